use crate::models::{Choice, ContentPart, MessageContent, ResponseMessage, StopSequences};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// 视觉模型名前缀，命中时走多模态接口并使用片段形式的消息
pub const VISION_MODEL_PREFIX: &str = "qwen-vl";

pub const TEXT_GENERATION_PATH: &str = "/api/v1/services/aigc/text-generation/generation";
pub const MULTIMODAL_GENERATION_PATH: &str =
    "/api/v1/services/aigc/multimodal-generation/generation";
pub const EMBEDDINGS_PATH: &str = "/api/v1/services/embeddings/text-embedding/text-embedding";

/// 流式开关请求头（X-DashScope-SSE）
pub const SSE_HEADER: &str = "x-dashscope-sse";
/// 渠道插件配置请求头（X-DashScope-Plugin）
pub const PLUGIN_HEADER: &str = "x-dashscope-plugin";

/// 流式事件行的前缀
pub const SSE_DATA_PREFIX: &[u8] = b"data:";

/// 结构化的 message 结果格式（另一种是旧的 text 格式）
pub const RESULT_FORMAT_MESSAGE: &str = "message";

/// 字段为 null 时按缺省值处理
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn is_false(value: &bool) -> bool {
    !*value
}

// ================== 请求 ==================

/// 请求体只有 input 和 parameters，模型名不放在请求体里
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashScopeRequest {
    pub input: DashScopeInput,
    #[serde(default)]
    pub parameters: DashScopeParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DashScopeInput {
    Messages { messages: Vec<DashScopeMessage> },
    Prompt { prompt: String },
}

#[cfg(test)]
impl DashScopeInput {
    pub fn messages(&self) -> &[DashScopeMessage] {
        match self {
            Self::Messages { messages } => messages,
            Self::Prompt { .. } => &[],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DashScopeParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_format: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub incremental_output: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub enable_search: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSequences>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashScopeMessage {
    pub role: String,
    pub content: DashScopeContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DashScopeContent {
    Text(String),
    Parts(Vec<DashScopePart>),
}

impl DashScopeContent {
    /// 拼接所有文本片段
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    DashScopePart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    /// 纯文本保持不变，片段形式解析为规范的类型化片段
    pub fn to_canonical(&self) -> MessageContent {
        match self {
            Self::Text(text) => MessageContent::Text(text.clone()),
            Self::Parts(parts) => MessageContent::Parts(
                parts.iter().filter_map(DashScopePart::to_canonical).collect(),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DashScopePart {
    Text { text: String },
    Image { image: String },
    /// 供应商回显的其他片段（如检测框），不映射
    Other(Value),
}

impl DashScopePart {
    pub fn to_canonical(&self) -> Option<ContentPart> {
        match self {
            Self::Text { text } => Some(ContentPart::Text { text: text.clone() }),
            Self::Image { image } => Some(ContentPart::image(image.clone())),
            Self::Other(_) => None,
        }
    }
}

// ================== 响应 ==================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DashScopeResponse {
    #[serde(default, deserialize_with = "null_as_default")]
    pub output: DashScopeOutput,
    #[serde(default)]
    pub usage: Option<DashScopeUsage>,
    /// 内嵌的错误片段，成功时 code 为空
    #[serde(flatten)]
    pub error: DashScopeError,
}

impl DashScopeResponse {
    pub fn request_id(&self) -> &str {
        &self.error.request_id
    }

    /// 有效的 (input, output) 用量，没有用量时为 (0, 0)
    pub fn effective_usage(&self) -> (u32, u32) {
        self.usage.as_ref().map_or((0, 0), DashScopeUsage::effective)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DashScopeError {
    #[serde(default, deserialize_with = "null_as_default")]
    pub code: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub message: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub request_id: String,
}

impl DashScopeError {
    /// code 为空表示没有错误
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DashScopeOutput {
    /// 旧的平铺文本格式
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// 结构化的 message 格式
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub choices: Vec<DashScopeChoice>,
}

impl DashScopeOutput {
    /// 按填充的字段一次性确定输出形态
    pub fn variant(&self) -> OutputVariant<'_> {
        if self.choices.is_empty() {
            OutputVariant::Legacy(LegacyOutput {
                text: self.text.as_deref().unwrap_or_default(),
                finish_reason: self.finish_reason.as_deref(),
            })
        } else {
            OutputVariant::Structured(StructuredOutput {
                choices: &self.choices,
                finish_reason: self.finish_reason.as_deref(),
            })
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DashScopeChoice {
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub message: DashScopeChoiceMessage,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DashScopeChoiceMessage {
    #[serde(default, deserialize_with = "null_as_default")]
    pub role: String,
    #[serde(default)]
    pub content: Option<DashScopeContent>,
}

/// 空字符串和字面量 "null" 表示仍在生成
pub fn normalize_finish_reason(reason: Option<&str>) -> Option<String> {
    reason
        .filter(|r| !r.is_empty() && *r != "null")
        .map(str::to_string)
}

/// 两种输出形态共用的处理接口
pub trait OutputShape {
    /// 本行应发出的增量文本
    fn delta(&self, last_seen: &str) -> String;

    /// 累计模式下的全文，解码器据此更新已见文本
    fn cumulative_text(&self) -> Option<&str>;

    fn finish_reason(&self) -> Option<String>;

    /// 构造非流式的规范 choices
    fn choices(&self) -> Vec<Choice>;
}

/// 平铺 text 字段：累计模式，每次重发目前为止的全文
#[derive(Debug, Clone, Copy)]
pub struct LegacyOutput<'a> {
    text: &'a str,
    finish_reason: Option<&'a str>,
}

impl OutputShape for LegacyOutput<'_> {
    fn delta(&self, last_seen: &str) -> String {
        self.text
            .strip_prefix(last_seen)
            .unwrap_or(self.text)
            .to_string()
    }

    fn cumulative_text(&self) -> Option<&str> {
        Some(self.text)
    }

    fn finish_reason(&self) -> Option<String> {
        normalize_finish_reason(self.finish_reason)
    }

    fn choices(&self) -> Vec<Choice> {
        vec![Choice {
            index: 0,
            message: ResponseMessage {
                role: "assistant".to_string(),
                content: MessageContent::Text(self.text.to_string()),
            },
            finish_reason: self.finish_reason(),
        }]
    }
}

/// choices[].message 形态：增量模式，每次只发送新片段
#[derive(Debug, Clone, Copy)]
pub struct StructuredOutput<'a> {
    choices: &'a [DashScopeChoice],
    finish_reason: Option<&'a str>,
}

impl StructuredOutput<'_> {
    fn choice_finish_reason(&self, choice: &DashScopeChoice) -> Option<String> {
        normalize_finish_reason(choice.finish_reason.as_deref())
            .or_else(|| normalize_finish_reason(self.finish_reason))
    }
}

impl OutputShape for StructuredOutput<'_> {
    fn delta(&self, _last_seen: &str) -> String {
        self.choices
            .first()
            .and_then(|choice| choice.message.content.as_ref())
            .map(DashScopeContent::text)
            .unwrap_or_default()
    }

    fn cumulative_text(&self) -> Option<&str> {
        None
    }

    fn finish_reason(&self) -> Option<String> {
        match self.choices.first() {
            Some(choice) => self.choice_finish_reason(choice),
            None => normalize_finish_reason(self.finish_reason),
        }
    }

    fn choices(&self) -> Vec<Choice> {
        self.choices
            .iter()
            .zip(0u32..)
            .map(|(choice, index)| {
                let role = if choice.message.role.is_empty() {
                    "assistant".to_string()
                } else {
                    choice.message.role.clone()
                };
                let content = choice
                    .message
                    .content
                    .as_ref()
                    .map_or_else(|| MessageContent::Text(String::new()), DashScopeContent::to_canonical);

                Choice {
                    index,
                    message: ResponseMessage { role, content },
                    finish_reason: self.choice_finish_reason(choice),
                }
            })
            .collect()
    }
}

/// 解码时确定的输出形态
#[derive(Debug, Clone, Copy)]
pub enum OutputVariant<'a> {
    Legacy(LegacyOutput<'a>),
    Structured(StructuredOutput<'a>),
}

impl<'a> OutputVariant<'a> {
    pub fn shape(&self) -> &dyn OutputShape {
        match self {
            Self::Legacy(output) => output,
            Self::Structured(output) => output,
        }
    }
}

// ================== 用量 ==================

/// 供应商先后用过两种用量格式，两种都要兼容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DashScopeUsage {
    /// 按子模型列出
    PerModel { models: Vec<ModelUsage> },
    /// 单个汇总
    Aggregate(AggregateUsage),
}

impl DashScopeUsage {
    /// 有效的 (input, output)
    ///
    /// 列表形式以第一个元素为准，不求和也不取平均
    pub fn effective(&self) -> (u32, u32) {
        match self {
            Self::PerModel { models } => models
                .first()
                .map_or((0, 0), |m| (m.input_tokens, m.output_tokens)),
            Self::Aggregate(usage) => (usage.input_tokens, usage.output_tokens),
        }
    }

    /// 供应商自报的总数，只用于向量化接口缺少 input_tokens 时兜底
    pub fn reported_total(&self) -> u32 {
        match self {
            Self::PerModel { models } => models.first().map_or(0, |m| m.total_tokens),
            Self::Aggregate(usage) => usage.total_tokens,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelUsage {
    #[serde(default, deserialize_with = "null_as_default")]
    pub input_tokens: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub output_tokens: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub total_tokens: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub model_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateUsage {
    #[serde(default, deserialize_with = "null_as_default")]
    pub input_tokens: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub output_tokens: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub total_tokens: u32,
}

// ================== 向量化 ==================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashScopeEmbeddingRequest {
    pub model: String,
    pub input: DashScopeEmbeddingInput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<DashScopeEmbeddingParameters>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashScopeEmbeddingInput {
    pub texts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashScopeEmbeddingParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DashScopeEmbeddingResponse {
    #[serde(default, deserialize_with = "null_as_default")]
    pub output: DashScopeEmbeddingOutput,
    #[serde(default)]
    pub usage: Option<DashScopeUsage>,
    #[serde(flatten)]
    pub error: DashScopeError,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DashScopeEmbeddingOutput {
    #[serde(default, deserialize_with = "null_as_default")]
    pub embeddings: Vec<DashScopeEmbedding>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashScopeEmbedding {
    pub embedding: Vec<f64>,
    #[serde(default)]
    pub text_index: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_body_has_only_input_and_parameters() {
        let request = DashScopeRequest {
            input: DashScopeInput::Messages {
                messages: vec![DashScopeMessage {
                    role: "user".to_string(),
                    content: DashScopeContent::Text("hi".to_string()),
                }],
            },
            parameters: DashScopeParameters {
                result_format: Some(RESULT_FORMAT_MESSAGE.to_string()),
                incremental_output: true,
                ..Default::default()
            },
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "input": {"messages": [{"role": "user", "content": "hi"}]},
                "parameters": {"result_format": "message", "incremental_output": true}
            })
        );
    }

    #[test]
    fn vision_parts_serialize_as_text_and_image_objects() {
        let content = DashScopeContent::Parts(vec![
            DashScopePart::Text {
                text: "look".to_string(),
            },
            DashScopePart::Image {
                image: "https://x/a.png".to_string(),
            },
        ]);
        assert_eq!(
            serde_json::to_value(&content).unwrap(),
            json!([{"text": "look"}, {"image": "https://x/a.png"}])
        );
    }

    #[test]
    fn parses_both_usage_shapes() {
        let per_model: DashScopeUsage = serde_json::from_value(json!({
            "models": [
                {"input_tokens": 7, "output_tokens": 2, "total_tokens": 9, "model_id": "qwen-max"},
                {"input_tokens": 100, "output_tokens": 100}
            ]
        }))
        .unwrap();
        assert_eq!(per_model.effective(), (7, 2));

        let aggregate: DashScopeUsage = serde_json::from_value(json!({
            "input_tokens": 10, "output_tokens": 5, "total_tokens": 99
        }))
        .unwrap();
        assert_eq!(aggregate.effective(), (10, 5));
        assert_eq!(aggregate.reported_total(), 99);

        let empty: DashScopeUsage = serde_json::from_value(json!({"models": []})).unwrap();
        assert_eq!(empty.effective(), (0, 0));
    }

    #[test]
    fn error_fragment_is_flattened_and_null_tolerant() {
        let response: DashScopeResponse = serde_json::from_value(json!({
            "code": "InvalidApiKey",
            "message": "Invalid API-key provided.",
            "request_id": "req-9"
        }))
        .unwrap();
        assert!(!response.error.is_empty());
        assert_eq!(response.request_id(), "req-9");

        let ok: DashScopeResponse = serde_json::from_value(json!({
            "code": null,
            "output": {"text": "hello", "finish_reason": "stop"},
            "usage": null,
            "request_id": "req-10"
        }))
        .unwrap();
        assert!(ok.error.is_empty());
        assert_eq!(ok.effective_usage(), (0, 0));
    }

    #[test]
    fn variant_follows_populated_field() {
        let legacy: DashScopeOutput =
            serde_json::from_value(json!({"text": "Hi there", "finish_reason": "null"})).unwrap();
        let variant = legacy.variant();
        assert!(matches!(variant, OutputVariant::Legacy(_)));
        assert_eq!(variant.shape().delta("Hi"), " there");
        assert_eq!(variant.shape().finish_reason(), None);

        let structured: DashScopeOutput = serde_json::from_value(json!({
            "choices": [{"finish_reason": "stop", "message": {"role": "assistant", "content": "Hi"}}]
        }))
        .unwrap();
        let variant = structured.variant();
        assert!(matches!(variant, OutputVariant::Structured(_)));
        assert_eq!(variant.shape().delta("Hi"), "Hi");
        assert_eq!(variant.shape().finish_reason().as_deref(), Some("stop"));
        assert_eq!(variant.shape().cumulative_text(), None);
    }

    #[test]
    fn structured_content_parts_become_canonical_parts() {
        let output: DashScopeOutput = serde_json::from_value(json!({
            "choices": [{
                "finish_reason": "stop",
                "message": {"role": "assistant", "content": [
                    {"text": "a cat"},
                    {"box": [1, 2, 3, 4]},
                    {"image": "https://x/crop.png"}
                ]}
            }]
        }))
        .unwrap();

        let choices = output.variant().shape().choices();
        assert_eq!(choices.len(), 1);
        assert_eq!(
            choices[0].message.content,
            MessageContent::Parts(vec![
                ContentPart::Text {
                    text: "a cat".to_string()
                },
                ContentPart::image("https://x/crop.png"),
            ])
        );
    }

    #[test]
    fn finish_reason_normalization() {
        assert_eq!(normalize_finish_reason(None), None);
        assert_eq!(normalize_finish_reason(Some("")), None);
        assert_eq!(normalize_finish_reason(Some("null")), None);
        assert_eq!(normalize_finish_reason(Some("length")).as_deref(), Some("length"));
    }
}
