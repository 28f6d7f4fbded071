use crate::error::{Error, Result};
use crate::models::{ChatStreamChunk, Delta, StreamChoice, Usage};
use crate::protocol::dashscope::{DashScopeResponse, SSE_DATA_PREFIX};
use crate::protocol::errors::map_error;
use crate::protocol::response::{fallback_id, VENDOR_ERROR_STATUS};
use crate::protocol::ChunkStream;
use crate::proxy::LineStream;
use crate::usage_collector::{UsageAccumulator, UsageSlot};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// 单行的处理结果
#[derive(Debug)]
pub enum LineOutcome {
    /// 非数据行（保活空行、event:/id: 等）
    Skip,
    Emit(ChatStreamChunk),
    /// 终止性错误，之后不再处理任何行
    Fail(Error),
}

/// 流式解码器
///
/// 每个流式调用构造一个，独占已见文本和用量累加器，不跨调用复用
#[derive(Debug)]
pub struct StreamDecoder {
    model: String,
    fallback_id: String,
    last_text: String,
    usage: UsageAccumulator,
    slot: UsageSlot,
    failed: bool,
}

impl StreamDecoder {
    pub fn new(model: impl Into<String>, slot: UsageSlot) -> Self {
        Self {
            model: model.into(),
            fallback_id: fallback_id(),
            last_text: String::new(),
            usage: UsageAccumulator::new(),
            slot,
            failed: false,
        }
    }

    #[cfg(test)]
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// 最后一次非零的用量读数
    pub fn usage(&self) -> Option<Usage> {
        self.usage.latest()
    }

    /// 处理一行原始事件，每行最多产生一个规范块
    pub fn decode_line(&mut self, line: &[u8]) -> LineOutcome {
        if self.failed {
            return LineOutcome::Skip;
        }

        let Some(payload) = line.strip_prefix(SSE_DATA_PREFIX) else {
            return LineOutcome::Skip;
        };

        let response: DashScopeResponse = match serde_json::from_slice(payload) {
            Ok(response) => response,
            Err(e) => return self.fail(e.into()),
        };

        if let Some(error) = map_error(&response.error) {
            return self.fail(Error::Vendor {
                status: VENDOR_ERROR_STATUS,
                error,
            });
        }

        let variant = response.output.variant();
        let shape = variant.shape();
        let delta = shape.delta(&self.last_text);
        if let Some(text) = shape.cumulative_text() {
            self.last_text = text.to_string();
        }
        let finish_reason = shape.finish_reason();

        if let Some(usage) = &response.usage {
            let (input_tokens, output_tokens) = usage.effective();
            if let Some(usage) = self.usage.observe(input_tokens, output_tokens) {
                self.slot.record(usage);
            }
        }

        let id = if response.request_id().is_empty() {
            self.fallback_id.clone()
        } else {
            response.request_id().to_string()
        };

        LineOutcome::Emit(ChatStreamChunk {
            id,
            object: "chat.completion.chunk".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: self.model.clone(),
            choices: vec![StreamChoice {
                index: 0,
                delta: Delta {
                    content: Some(delta),
                },
                finish_reason,
            }],
        })
    }

    fn fail(&mut self, error: Error) -> LineOutcome {
        self.failed = true;
        LineOutcome::Fail(error)
    }
}

/// 启动生产者任务并返回消费端
///
/// 生产者独占解码器和行流，通过有界通道交给消费者。
/// 通道满时生产者阻塞，进而停止读取网络；消费端被丢弃时生产者在下一次发送失败后退出，
/// 行流随之被丢弃，底层连接关闭。
pub fn spawn_decoder(lines: LineStream, decoder: StreamDecoder, capacity: usize) -> ChunkStream {
    let (tx, mut rx) = mpsc::channel(capacity.max(1));
    tokio::spawn(produce(lines, decoder, tx));

    Box::pin(async_stream::stream! {
        while let Some(item) = rx.recv().await {
            yield item;
        }
    })
}

async fn produce(
    mut lines: LineStream,
    mut decoder: StreamDecoder,
    tx: mpsc::Sender<Result<ChatStreamChunk>>,
) {
    let mut emitted = 0usize;

    while let Some(line) = lines.next().await {
        let outcome = match line {
            Ok(line) => decoder.decode_line(&line),
            Err(e) => decoder.fail(e),
        };

        match outcome {
            LineOutcome::Skip => {}
            LineOutcome::Emit(chunk) => {
                if tx.send(Ok(chunk)).await.is_err() {
                    debug!("Stream consumer dropped, stopping producer");
                    return;
                }
                emitted += 1;
            }
            LineOutcome::Fail(e) => {
                error!(model = %decoder.model, error = %e, "DashScope stream failed");
                // 消费端可能已经不在了
                let _ = tx.send(Err(e)).await;
                return;
            }
        }
    }

    let usage = decoder.usage().unwrap_or_default();
    info!(
        model = %decoder.model,
        chunks = emitted,
        prompt_tokens = usage.prompt_tokens,
        completion_tokens = usage.completion_tokens,
        "DashScope stream finished"
    );
}
