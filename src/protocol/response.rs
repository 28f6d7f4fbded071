use crate::error::{Error, Result};
use crate::models::{
    ChatRequest, ChatResponse, EmbeddingData, EmbeddingRequest, EmbeddingResponse, Usage,
};
use crate::protocol::dashscope::{DashScopeEmbeddingResponse, DashScopeError, DashScopeResponse};
use crate::protocol::errors::map_error;
use crate::usage_collector::UsageSlot;
use uuid::Uuid;

/// 供应商错误片段统一以 400 返回给调用方
pub const VENDOR_ERROR_STATUS: u16 = 400;

/// 供应商没有返回 request_id 时使用的响应ID
pub fn fallback_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4().simple())
}

/// 错误片段优先于任何输出内容
fn check_error(error: &DashScopeError) -> Result<()> {
    match map_error(error) {
        Some(error) => Err(Error::Vendor {
            status: VENDOR_ERROR_STATUS,
            error,
        }),
        None => Ok(()),
    }
}

/// DashScope 非流式响应 -> 规范响应
///
/// 计算出的用量会写入 `usage` 槽，这是非流式路径唯一的副作用
pub fn translate_response(
    response: DashScopeResponse,
    request: &ChatRequest,
    usage: &UsageSlot,
) -> Result<ChatResponse> {
    check_error(&response.error)?;

    let choices = response.output.variant().shape().choices();

    let (input_tokens, output_tokens) = response.effective_usage();
    let total = Usage::new(input_tokens, output_tokens);
    usage.record(total);

    let id = if response.request_id().is_empty() {
        fallback_id()
    } else {
        response.request_id().to_string()
    };

    Ok(ChatResponse {
        id,
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: request.model.clone(),
        choices,
        usage: Some(total),
    })
}

/// DashScope 向量化响应 -> 规范响应，按 text_index 排序
pub fn translate_embedding_response(
    response: DashScopeEmbeddingResponse,
    request: &EmbeddingRequest,
    usage: &UsageSlot,
) -> Result<EmbeddingResponse> {
    check_error(&response.error)?;

    let mut embeddings = response.output.embeddings;
    embeddings.sort_by_key(|embedding| embedding.text_index);

    let data = embeddings
        .into_iter()
        .map(|embedding| EmbeddingData {
            object: "embedding".to_string(),
            index: embedding.text_index,
            embedding: embedding.embedding,
        })
        .collect();

    // 部分向量模型只返回 total_tokens
    let prompt_tokens = response.usage.as_ref().map_or(0, |usage| {
        let (input_tokens, _) = usage.effective();
        if input_tokens == 0 {
            usage.reported_total()
        } else {
            input_tokens
        }
    });
    let total = Usage::new(prompt_tokens, 0);
    usage.record(total);

    Ok(EmbeddingResponse {
        object: "list".to_string(),
        data,
        model: request.model.clone(),
        usage: total,
    })
}
