use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;
use crate::models::Usage;

/// 单次调用的用量槽
///
/// 由网关创建并交给适配器，适配器在调用过程中写入，网关在调用（或流）
/// 完全结束之后读取用于计费。克隆得到的是同一个槽的句柄。
#[derive(Debug, Clone, Default)]
pub struct UsageSlot {
    inner: Arc<Mutex<Option<Usage>>>,
}

impl UsageSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, usage: Usage) {
        debug!(
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "Usage Collector - recording usage"
        );
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = Some(usage);
    }

    pub fn get(&self) -> Option<Usage> {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 流式解码器独占的用量累加器
///
/// 中间块的 output_tokens 为 0（或缺失），只有非零读数才覆盖之前的值
#[derive(Debug, Default)]
pub struct UsageAccumulator {
    latest: Option<Usage>,
}

impl UsageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次读数，被采纳时返回新的用量
    pub fn observe(&mut self, input_tokens: u32, output_tokens: u32) -> Option<Usage> {
        if output_tokens == 0 {
            return None;
        }
        let usage = Usage::new(input_tokens, output_tokens);
        self.latest = Some(usage);
        Some(usage)
    }

    pub fn latest(&self) -> Option<Usage> {
        self.latest
    }
}
