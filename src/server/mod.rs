use crate::error::Error;
use crate::models::{ChatRequest, EmbeddingRequest, ErrorResponse, Usage};
use crate::protocol::ProtocolAdapter;
use crate::usage_collector::UsageSlot;
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    adapter: Arc<dyn ProtocolAdapter>,
}

impl AppState {
    pub fn new(adapter: Arc<dyn ProtocolAdapter>) -> Self {
        Self { adapter }
    }
}

/// 创建路由
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/embeddings", post(embeddings))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                // 过滤掉健康检查的日志
                if request.uri().path() == "/health" {
                    tracing::trace_span!("health_check")
                } else {
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        uri = %request.uri(),
                        version = ?request.version(),
                    )
                }
            }),
        )
        .with_state(state)
}

async fn health() -> Response {
    Json(serde_json::json!({
        "status": "healthy"
    }))
    .into_response()
}

async fn chat_completions(State(state): State<AppState>, body: Bytes) -> Response {
    let request: ChatRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };

    // 每次调用使用新的用量槽
    let usage = UsageSlot::new();

    if request.stream {
        return stream_chat(state, request, usage).await;
    }

    match state.adapter.chat_completion(&request, &usage).await {
        Ok(response) => {
            log_usage(&request.model, usage.get());
            Json(response).into_response()
        }
        Err(e) => {
            error!(model = %request.model, error = %e, "Chat completion failed");
            create_error_response(&e)
        }
    }
}

async fn stream_chat(state: AppState, request: ChatRequest, usage: UsageSlot) -> Response {
    let mut chunks = match state.adapter.chat_completion_stream(&request, &usage).await {
        Ok(chunks) => chunks,
        Err(e) => {
            error!(model = %request.model, error = %e, "Failed to open stream");
            return create_error_response(&e);
        }
    };

    let model = request.model;
    let body = async_stream::stream! {
        let mut failed = false;

        while let Some(item) = chunks.next().await {
            let frame = item.and_then(|chunk| serde_json::to_string(&chunk).map_err(Error::from));
            match frame {
                Ok(json) => {
                    yield Ok::<Bytes, Infallible>(Bytes::from(format!("data: {}\n\n", json)));
                }
                Err(e) => {
                    yield Ok::<Bytes, Infallible>(Bytes::from(error_frame(&e)));
                    failed = true;
                    break;
                }
            }
        }

        if !failed {
            yield Ok::<Bytes, Infallible>(Bytes::from_static(b"data: [DONE]\n\n"));
        }

        // 流完全结束后才读取用量
        log_usage(&model, usage.get());
    };

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        // 禁用 nginx 缓冲
        [("x-accel-buffering", "no")],
        Body::from_stream(body),
    )
        .into_response()
}

async fn embeddings(State(state): State<AppState>, body: Bytes) -> Response {
    let request: EmbeddingRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };

    let usage = UsageSlot::new();
    match state.adapter.embeddings(&request, &usage).await {
        Ok(response) => {
            log_usage(&request.model, usage.get());
            Json(response).into_response()
        }
        Err(e) => {
            error!(model = %request.model, error = %e, "Embedding request failed");
            create_error_response(&e)
        }
    }
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, Response> {
    serde_json::from_slice(body).map_err(|e| {
        error!("Failed to parse request body: {}", e);
        create_error_response(&Error::Contract(format!("Invalid request body: {}", e)))
    })
}

fn log_usage(model: &str, usage: Option<Usage>) {
    let usage = usage.unwrap_or_default();
    info!(
        model = %model,
        prompt_tokens = usage.prompt_tokens,
        completion_tokens = usage.completion_tokens,
        total_tokens = usage.total_tokens,
        "Usage recorded"
    );
}

fn error_frame(error: &Error) -> String {
    let body = ErrorResponse {
        error: error.to_canonical(),
    };
    format!(
        "data: {}\n\n",
        serde_json::to_string(&body).unwrap_or_default()
    )
}

fn create_error_response(error: &Error) -> Response {
    let status = StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::BAD_GATEWAY);
    (
        status,
        Json(ErrorResponse {
            error: error.to_canonical(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        CanonicalError, ChatResponse, ChatStreamChunk, Choice, Delta, EmbeddingData,
        EmbeddingResponse, MessageContent, ResponseMessage, StreamChoice,
    };
    use crate::protocol::ChunkStream;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    /// 固定返回结果的适配器
    struct FakeAdapter {
        fail_stream: bool,
    }

    fn chunk(content: &str, finish_reason: Option<&str>) -> ChatStreamChunk {
        ChatStreamChunk {
            id: "req-1".to_string(),
            object: "chat.completion.chunk".to_string(),
            created: 0,
            model: "qwen-max".to_string(),
            choices: vec![StreamChoice {
                index: 0,
                delta: Delta {
                    content: Some(content.to_string()),
                },
                finish_reason: finish_reason.map(str::to_string),
            }],
        }
    }

    #[async_trait]
    impl ProtocolAdapter for FakeAdapter {
        async fn chat_completion(
            &self,
            request: &ChatRequest,
            usage: &UsageSlot,
        ) -> crate::Result<ChatResponse> {
            if request.model == "missing" {
                return Err(Error::Vendor {
                    status: 400,
                    error: CanonicalError {
                        message: "Model not exist.".to_string(),
                        error_type: "InvalidParameter".to_string(),
                        param: Some("req-9".to_string()),
                        code: Some("InvalidParameter".to_string()),
                    },
                });
            }
            usage.record(Usage::new(3, 2));
            Ok(ChatResponse {
                id: "req-1".to_string(),
                object: "chat.completion".to_string(),
                created: 0,
                model: request.model.clone(),
                choices: vec![Choice {
                    index: 0,
                    message: ResponseMessage {
                        role: "assistant".to_string(),
                        content: MessageContent::Text("hello".to_string()),
                    },
                    finish_reason: Some("stop".to_string()),
                }],
                usage: Some(Usage::new(3, 2)),
            })
        }

        async fn chat_completion_stream(
            &self,
            _request: &ChatRequest,
            _usage: &UsageSlot,
        ) -> crate::Result<ChunkStream> {
            let mut items = vec![Ok(chunk("Hi", None))];
            if self.fail_stream {
                items.push(Err(Error::Vendor {
                    status: 400,
                    error: CanonicalError::new("boom", "InternalError"),
                }));
            } else {
                items.push(Ok(chunk(" there", Some("stop"))));
            }
            Ok(Box::pin(futures::stream::iter(items)))
        }

        async fn embeddings(
            &self,
            request: &EmbeddingRequest,
            _usage: &UsageSlot,
        ) -> crate::Result<EmbeddingResponse> {
            Ok(EmbeddingResponse {
                object: "list".to_string(),
                data: vec![EmbeddingData {
                    object: "embedding".to_string(),
                    index: 0,
                    embedding: vec![0.5],
                }],
                model: request.model.clone(),
                usage: Usage::new(1, 0),
            })
        }
    }

    fn app(fail_stream: bool) -> Router {
        router(AppState::new(Arc::new(FakeAdapter { fail_stream })))
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn health_check() {
        let response = app(false)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn non_streaming_chat_returns_json() {
        let response = app(false)
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({"model": "qwen-max", "messages": [{"role": "user", "content": "hi"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["choices"][0]["message"]["content"], "hello");
        assert_eq!(body["usage"]["total_tokens"], 5);
    }

    #[tokio::test]
    async fn vendor_errors_use_canonical_shape() {
        let response = app(false)
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({"model": "missing", "messages": [{"role": "user", "content": "hi"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["error"]["type"], "InvalidParameter");
        assert_eq!(body["error"]["param"], "req-9");
    }

    #[tokio::test]
    async fn malformed_body_is_rejected() {
        let response = app(false)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/chat/completions")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["error"]["type"], "invalid_request_error");
    }

    #[tokio::test]
    async fn streaming_chat_frames_chunks_and_done() {
        let response = app(false)
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({"model": "qwen-max", "stream": true, "messages": [{"role": "user", "content": "hi"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/event-stream");

        let text = body_text(response).await;
        let frames: Vec<&str> = text.split("\n\n").filter(|f| !f.is_empty()).collect();
        assert_eq!(frames.len(), 3);
        assert!(frames[0].starts_with("data: {"));
        assert!(frames[1].contains(r#""finish_reason":"stop""#));
        assert_eq!(frames[2], "data: [DONE]");
    }

    #[tokio::test]
    async fn streaming_error_ends_with_error_frame() {
        let response = app(true)
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({"model": "qwen-max", "stream": true, "messages": [{"role": "user", "content": "hi"}]}),
            ))
            .await
            .unwrap();

        let text = body_text(response).await;
        let frames: Vec<&str> = text.split("\n\n").filter(|f| !f.is_empty()).collect();
        assert_eq!(frames.len(), 2);
        let error: Value = serde_json::from_str(frames[1].trim_start_matches("data: ")).unwrap();
        assert_eq!(error["error"]["type"], "InternalError");
        assert!(!text.contains("[DONE]"));
    }

    #[tokio::test]
    async fn embeddings_route() {
        let response = app(false)
            .oneshot(post_json(
                "/v1/embeddings",
                json!({"model": "text-embedding-v2", "input": "hello"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["object"], "list");
        assert_eq!(body["data"][0]["embedding"][0], 0.5);
    }
}
