pub mod adapter;
pub mod dashscope;
pub mod errors;
pub mod request;
pub mod response;
pub mod stream;

use crate::error::Result;
use crate::models::{ChatRequest, ChatResponse, ChatStreamChunk, EmbeddingRequest, EmbeddingResponse};
use crate::usage_collector::UsageSlot;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

pub use adapter::DashScopeAdapter;

/// 规范增量块的流，`Err` 为终止性错误
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChatStreamChunk>> + Send>>;

/// 网关调用供应商的统一接口
///
/// `usage` 由调用方为每次调用新建，调用（或流）结束之后再读取
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    async fn chat_completion(&self, request: &ChatRequest, usage: &UsageSlot) -> Result<ChatResponse>;

    async fn chat_completion_stream(
        &self,
        request: &ChatRequest,
        usage: &UsageSlot,
    ) -> Result<ChunkStream>;

    async fn embeddings(
        &self,
        request: &EmbeddingRequest,
        usage: &UsageSlot,
    ) -> Result<EmbeddingResponse>;
}
