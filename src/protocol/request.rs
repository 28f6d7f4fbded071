use crate::config::RequestMode;
use crate::error::{Error, Result};
use crate::models::{ChatMessage, ChatRequest, ContentPart, EmbeddingRequest};
use crate::protocol::dashscope::{
    DashScopeContent, DashScopeEmbeddingInput, DashScopeEmbeddingParameters,
    DashScopeEmbeddingRequest, DashScopeInput, DashScopeMessage, DashScopeParameters,
    DashScopePart, DashScopeRequest, MULTIMODAL_GENERATION_PATH, RESULT_FORMAT_MESSAGE,
    TEXT_GENERATION_PATH, VISION_MODEL_PREFIX,
};
use tracing::{debug, warn};

/// 模型名是否带视觉前缀
pub fn is_vision_model(model: &str) -> bool {
    model.starts_with(VISION_MODEL_PREFIX)
}

/// 按模型名选择聊天接口路径，视觉模型走多模态接口
pub fn chat_path(model: &str) -> &'static str {
    if is_vision_model(model) {
        MULTIMODAL_GENERATION_PATH
    } else {
        TEXT_GENERATION_PATH
    }
}

/// 规范请求 -> DashScope 请求
///
/// 纯函数，不做 I/O；同一个请求翻译两次得到相同的结果
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestTranslator {
    mode: RequestMode,
}

impl RequestTranslator {
    pub fn new(mode: RequestMode) -> Self {
        Self { mode }
    }

    /// 翻译聊天请求
    ///
    /// # 说明
    /// 1. 按实际发送的内容判断是否为空：纯文本看拍平后的文本，视觉模型看保留下来的片段，
    ///    空消息被丢弃，全部为空时返回 `Error::Contract`
    /// 2. 角色统一转为小写
    /// 3. 视觉模型使用片段形式（只保留文本和图片），其他模型使用纯文本
    /// 4. prompt 模式下取最后一条非空消息的文本
    pub fn translate(&self, request: &ChatRequest) -> Result<DashScopeRequest> {
        let vision = is_vision_model(&request.model);

        let messages: Vec<DashScopeMessage> = request
            .messages
            .iter()
            .enumerate()
            .filter_map(|(index, message)| {
                let content = if vision {
                    let parts = vision_parts(&request.model, index, message);
                    if parts.is_empty() {
                        return None;
                    }
                    DashScopeContent::Parts(parts)
                } else {
                    let text = message.text();
                    if text.is_empty() {
                        return None;
                    }
                    DashScopeContent::Text(text)
                };

                Some(DashScopeMessage {
                    role: message.role.to_lowercase(),
                    content,
                })
            })
            .collect();

        let message_count = messages.len();
        let last = match messages.last() {
            Some(last) => last.content.text(),
            None => {
                return Err(Error::Contract(
                    "request must contain at least one non-empty message".into(),
                ))
            }
        };

        let input = if vision || self.mode == RequestMode::Messages {
            DashScopeInput::Messages { messages }
        } else {
            DashScopeInput::Prompt { prompt: last }
        };

        let parameters = DashScopeParameters {
            result_format: Some(RESULT_FORMAT_MESSAGE.to_string()),
            incremental_output: request.stream,
            enable_search: request.plugin.web_search_enabled(),
            temperature: request.temperature,
            top_p: request.top_p,
            top_k: request.top_k,
            seed: request.seed,
            max_tokens: request.max_tokens,
            stop: request.stop.clone(),
        };

        debug!(
            model = %request.model,
            messages = message_count,
            stream = request.stream,
            enable_search = parameters.enable_search,
            "Built DashScope request"
        );

        Ok(DashScopeRequest { input, parameters })
    }
}

/// 视觉消息的片段，其他类型的片段被丢弃并记录警告
fn vision_parts(model: &str, message_index: usize, message: &ChatMessage) -> Vec<DashScopePart> {
    message
        .parts()
        .into_iter()
        .enumerate()
        .filter_map(|(position, part)| match part {
            ContentPart::Text { text } if text.is_empty() => None,
            ContentPart::Text { text } => Some(DashScopePart::Text { text }),
            ContentPart::ImageUrl { image_url } => Some(DashScopePart::Image {
                image: image_url.url,
            }),
            ContentPart::Unsupported => {
                warn!(
                    model = %model,
                    message_index,
                    part_index = position,
                    "Dropping unsupported content part for vision model"
                );
                None
            }
        })
        .collect()
}

/// 规范向量化请求 -> DashScope 向量化请求
pub fn translate_embedding_request(request: &EmbeddingRequest) -> Result<DashScopeEmbeddingRequest> {
    let texts = request.input.texts();
    if texts.is_empty() {
        return Err(Error::Contract("embedding input must not be empty".into()));
    }

    Ok(DashScopeEmbeddingRequest {
        model: request.model.clone(),
        input: DashScopeEmbeddingInput { texts },
        parameters: request
            .text_type
            .as_ref()
            .map(|text_type| DashScopeEmbeddingParameters {
                text_type: Some(text_type.clone()),
            }),
    })
}
