use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use reqwest::{
    header::{HeaderMap, HeaderValue, CONTENT_TYPE},
    Client, Method, Response,
};
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, error, info};

/// 按行切分后的上游事件流，每一项是一行（不含换行符）
pub type LineStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// 发往上游的请求
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// HTTP 传输能力
///
/// 适配器只依赖这个接口，便于在测试中替换
#[async_trait]
pub trait Transport: Send + Sync {
    /// 构造请求，确保 content-type 为 JSON
    fn new_request(
        &self,
        method: Method,
        url: &str,
        body: Bytes,
        mut headers: HeaderMap,
    ) -> UpstreamRequest {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        UpstreamRequest {
            method,
            url: url.to_string(),
            headers,
            body,
        }
    }

    /// 发送请求并读取完整响应体，非 2xx 返回 `Error::Upstream`
    async fn send(&self, request: UpstreamRequest) -> Result<Bytes>;

    /// 发送请求并返回按行切分的响应流，非 2xx 返回 `Error::Upstream`
    async fn send_streaming(&self, request: UpstreamRequest) -> Result<LineStream>;
}

pub struct ProxyForwarder {
    client: Client,
    // Dedicated client for streaming (no global timeout)
    streaming_client: Client,
}

impl ProxyForwarder {
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        // Standard client: obeys configured request timeout
        let client = Self::builder(config).timeout(config.timeout).build()?;

        // Streaming client: no global request timeout to allow long-lived SSE
        let streaming_client = Self::builder(config).build()?;

        Ok(Self {
            client,
            streaming_client,
        })
    }

    fn builder(config: &ProxyConfig) -> reqwest::ClientBuilder {
        Client::builder()
            .pool_max_idle_per_host(config.max_connections)
            .pool_idle_timeout(Duration::from_secs(60))
            .tcp_keepalive(if config.keep_alive {
                Some(Duration::from_secs(30))
            } else {
                None
            })
    }

    async fn execute(&self, client: &Client, request: UpstreamRequest) -> Result<Response> {
        debug!(method = %request.method, url = %request.url, "send_request: start");

        let response = client
            .request(request.method, &request.url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await
            .map_err(|e| {
                error!("HTTP client connection failed: {:?}", e);
                Error::Http(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .bytes()
                .await
                .unwrap_or_else(|_| Bytes::from("Failed to read error response"));
            let body = String::from_utf8_lossy(&body).into_owned();

            error!("Upstream error response (status {}): {}", status, body);

            return Err(Error::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl Transport for ProxyForwarder {
    async fn send(&self, request: UpstreamRequest) -> Result<Bytes> {
        let response = self.execute(&self.client, request).await?;
        info!("Upstream success response status: {}", response.status());
        Ok(response.bytes().await?)
    }

    async fn send_streaming(&self, request: UpstreamRequest) -> Result<LineStream> {
        let response = self.execute(&self.streaming_client, request).await?;
        info!("stream: established (status {})", response.status());

        let chunks = response.bytes_stream().map(|chunk| chunk.map_err(Error::Http));
        Ok(split_lines(chunks))
    }
}

/// 将字节流按 `\n` 切分成行
///
/// 去掉行尾的 `\r`，流结束时输出最后一个不完整的行；读取出错后不再继续
pub fn split_lines<S>(chunks: S) -> LineStream
where
    S: Stream<Item = Result<Bytes>> + Send + 'static,
{
    let mut chunks = Box::pin(chunks);

    Box::pin(async_stream::stream! {
        let mut buffer = BytesMut::new();
        let mut failed = false;

        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(bytes) => {
                    buffer.extend_from_slice(&bytes);
                    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                        let line = buffer.split_to(pos + 1);
                        yield Ok(trim_line(line));
                    }
                }
                Err(e) => {
                    yield Err(e);
                    failed = true;
                    break;
                }
            }
        }

        if !failed && !buffer.is_empty() {
            yield Ok(trim_line(buffer));
        }
    })
}

fn trim_line(line: BytesMut) -> Bytes {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    line.freeze().slice(..end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: Vec<Result<&'static str>>) -> impl Stream<Item = Result<Bytes>> + Send {
        futures::stream::iter(
            parts
                .into_iter()
                .map(|part| part.map(|s| Bytes::from_static(s.as_bytes()))),
        )
    }

    #[tokio::test]
    async fn splits_lines_across_chunk_boundaries() {
        let lines: Vec<_> = split_lines(chunks(vec![
            Ok("id:1\r\nevent:res"),
            Ok("ult\r\ndata:{\"a\""),
            Ok(":1}\n\n"),
            Ok("data:tail"),
        ]))
        .map(|line| line.unwrap())
        .collect()
        .await;

        assert_eq!(
            lines,
            vec![
                Bytes::from_static(b"id:1"),
                Bytes::from_static(b"event:result"),
                Bytes::from_static(b"data:{\"a\":1}"),
                Bytes::from_static(b""),
                Bytes::from_static(b"data:tail"),
            ]
        );
    }

    #[tokio::test]
    async fn stops_after_read_error() {
        let items: Vec<_> = split_lines(chunks(vec![
            Ok("data:a\ndata:partial"),
            Err(Error::Proxy("reset".to_string())),
            Ok("\ndata:b\n"),
        ]))
        .collect()
        .await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), &Bytes::from_static(b"data:a"));
        assert!(items[1].is_err());
    }

    #[test]
    fn new_request_sets_json_content_type() {
        let forwarder = ProxyForwarder::new(&crate::config::Config::default().proxy).unwrap();
        let request = forwarder.new_request(
            Method::POST,
            "http://localhost/x",
            Bytes::from_static(b"{}"),
            HeaderMap::new(),
        );
        assert_eq!(request.headers[CONTENT_TYPE], "application/json");
        assert_eq!(request.url, "http://localhost/x");
    }
}
