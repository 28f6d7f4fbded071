use crate::config::{Config, ProviderConfig, StreamConfig};
use crate::error::{Error, Result};
use crate::models::{ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse};
use crate::protocol::dashscope::{
    DashScopeEmbeddingResponse, DashScopeError, DashScopeResponse, EMBEDDINGS_PATH, PLUGIN_HEADER,
    SSE_HEADER,
};
use crate::protocol::errors::map_error;
use crate::protocol::request::{chat_path, translate_embedding_request, RequestTranslator};
use crate::protocol::response::{translate_embedding_response, translate_response};
use crate::protocol::stream::{spawn_decoder, StreamDecoder};
use crate::protocol::{ChunkStream, ProtocolAdapter};
use crate::proxy::{ProxyForwarder, Transport, UpstreamRequest};
use crate::usage_collector::UsageSlot;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::Method;
use tracing::{debug, info};

/// DashScope 适配器
///
/// 组合请求翻译、传输、响应翻译和流式解码
pub struct DashScopeAdapter<T = ProxyForwarder> {
    transport: T,
    base_url: String,
    api_key: String,
    plugin: Option<String>,
    translator: RequestTranslator,
    channel_capacity: usize,
}

impl DashScopeAdapter<ProxyForwarder> {
    /// 使用 reqwest 传输创建适配器
    pub fn from_config(config: &Config) -> Result<Self> {
        let transport = ProxyForwarder::new(&config.proxy)?;
        Ok(Self::new(transport, &config.provider, &config.stream))
    }
}

impl<T: Transport> DashScopeAdapter<T> {
    pub fn new(transport: T, provider: &ProviderConfig, stream: &StreamConfig) -> Self {
        Self {
            transport,
            base_url: provider.base_url.trim_end_matches('/').to_string(),
            api_key: provider.api_key.clone(),
            plugin: provider.plugin.clone().filter(|plugin| !plugin.is_empty()),
            translator: RequestTranslator::new(provider.request_mode),
            channel_capacity: stream.channel_capacity,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn headers(&self, stream: bool) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                .map_err(|_| Error::Proxy("Invalid token format".into()))?,
        );

        if stream {
            headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
            headers.insert(
                HeaderName::from_static(SSE_HEADER),
                HeaderValue::from_static("enable"),
            );
        }

        if let Some(plugin) = &self.plugin {
            headers.insert(
                HeaderName::from_static(PLUGIN_HEADER),
                HeaderValue::from_str(plugin)
                    .map_err(|_| Error::Proxy(format!("Invalid {} header value", PLUGIN_HEADER)))?,
            );
        }

        Ok(headers)
    }

    fn chat_request(&self, request: &ChatRequest, stream: bool) -> Result<UpstreamRequest> {
        let mut body = self.translator.translate(request)?;
        body.parameters.incremental_output = stream;

        let url = self.url(chat_path(&request.model));
        debug!(model = %request.model, url = %url, stream, "Dispatching chat request");

        Ok(self.transport.new_request(
            Method::POST,
            &url,
            Bytes::from(serde_json::to_vec(&body)?),
            self.headers(stream)?,
        ))
    }
}

/// 上游非 2xx 时尝试把响应体解析为供应商错误片段
fn map_upstream_error(error: Error) -> Error {
    match error {
        Error::Upstream { status, body } => {
            match serde_json::from_str::<DashScopeError>(&body)
                .ok()
                .as_ref()
                .and_then(map_error)
            {
                Some(error) => Error::Vendor { status, error },
                None => Error::Upstream { status, body },
            }
        }
        other => other,
    }
}

#[async_trait]
impl<T: Transport> ProtocolAdapter for DashScopeAdapter<T> {
    async fn chat_completion(&self, request: &ChatRequest, usage: &UsageSlot) -> Result<ChatResponse> {
        let upstream = self.chat_request(request, false)?;
        let body = self
            .transport
            .send(upstream)
            .await
            .map_err(map_upstream_error)?;

        let response: DashScopeResponse = serde_json::from_slice(&body)?;
        translate_response(response, request, usage)
    }

    async fn chat_completion_stream(
        &self,
        request: &ChatRequest,
        usage: &UsageSlot,
    ) -> Result<ChunkStream> {
        let upstream = self.chat_request(request, true)?;
        let lines = self
            .transport
            .send_streaming(upstream)
            .await
            .map_err(map_upstream_error)?;

        info!(model = %request.model, "DashScope stream established");
        let decoder = StreamDecoder::new(request.model.clone(), usage.clone());
        Ok(spawn_decoder(lines, decoder, self.channel_capacity))
    }

    async fn embeddings(
        &self,
        request: &EmbeddingRequest,
        usage: &UsageSlot,
    ) -> Result<EmbeddingResponse> {
        let body = translate_embedding_request(request)?;
        let url = self.url(EMBEDDINGS_PATH);
        debug!(model = %request.model, texts = body.input.texts.len(), "Dispatching embedding request");

        let upstream = self.transport.new_request(
            Method::POST,
            &url,
            Bytes::from(serde_json::to_vec(&body)?),
            self.headers(false)?,
        );
        let body = self
            .transport
            .send(upstream)
            .await
            .map_err(map_upstream_error)?;

        let response: DashScopeEmbeddingResponse = serde_json::from_slice(&body)?;
        translate_embedding_response(response, request, usage)
    }
}
