//! 进度推送订阅
//! 解析 SSE 帧, 把事件按到达顺序送入任务的消息队列

use crate::backend::{EventStream, TaskBackend};
use crate::error::TransportError;
use crate::machine::{StreamEnd, TaskMessage};
use crate::types::ProgressEvent;
use futures::stream::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// SSE 帧解析器
///
/// 按空行切帧, 兼容 CRLF; 注释行 (`:` 开头, 用作心跳) 与 `event:`/`id:` 字段忽略,
/// 多行 `data:` 用换行拼接。
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// 追加一段字节, 返回其中完整帧的 data 内容
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut payloads = Vec::new();
        while let Some(pos) = find_frame_end(&self.buffer) {
            let frame: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            let frame = String::from_utf8_lossy(&frame[..pos]);
            if let Some(payload) = parse_frame(&frame) {
                payloads.push(payload);
            }
        }
        payloads
    }
}

fn find_frame_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

fn parse_frame(frame: &str) -> Option<String> {
    let data: Vec<&str> = frame
        .lines()
        .filter(|line| !line.starts_with(':'))
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
        .collect();

    if data.is_empty() {
        None
    } else {
        Some(data.join("\n"))
    }
}

/// 解析单个事件, 格式错误的帧跳过
pub fn decode_event(payload: &str) -> Option<ProgressEvent> {
    match serde_json::from_str::<ProgressEvent>(payload) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!("⚠️ 无法解析进度事件: {} ({})", e, payload);
            None
        }
    }
}

/// 字节流 → 进度事件流
pub fn decode_stream<S, B, E>(bytes: S) -> EventStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<TransportError> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut decoder = SseDecoder::default();
        futures::pin_mut!(bytes);
        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(chunk) => {
                    for payload in decoder.push(chunk.as_ref()) {
                        if let Some(event) = decode_event(&payload) {
                            yield Ok(event);
                        }
                    }
                }
                Err(e) => {
                    yield Err(e.into());
                    break;
                }
            }
        }
    })
}

/// 订阅一个任务的推送, 直到终止事件、断开、超时或被取消
///
/// 终止事件转发后立即返回, 不再读取后续内容; 被取消时不发送任何消息。
pub async fn run_subscriber(
    backend: Arc<dyn TaskBackend>,
    task_id: String,
    outbox: UnboundedSender<TaskMessage>,
    cancel: CancellationToken,
    idle_timeout: Duration,
) {
    // 握手同样受空闲超时约束
    let subscribed = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        result = tokio::time::timeout(idle_timeout, backend.subscribe(&task_id)) => result,
    };

    let mut events = match subscribed {
        Ok(Ok(events)) => events,
        Ok(Err(e)) => {
            let _ = outbox.send(TaskMessage::StreamEnded(StreamEnd::Failed(e)));
            return;
        }
        Err(_) => {
            warn!("⚠️ 订阅任务 {} 的推送超时", task_id);
            let _ = outbox.send(TaskMessage::StreamEnded(StreamEnd::Stalled));
            return;
        }
    };

    info!("📡 已订阅任务 {} 的进度推送", task_id);

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("取消订阅任务 {}", task_id);
                return;
            }
            next = tokio::time::timeout(idle_timeout, events.next()) => next,
        };

        let end = match next {
            Err(_) => StreamEnd::Stalled,
            Ok(None) => StreamEnd::Closed,
            Ok(Some(Err(e))) => StreamEnd::Failed(e),
            Ok(Some(Ok(event))) => {
                let terminal = event.is_terminal();
                if outbox.send(TaskMessage::Stream(event)).is_err() {
                    return;
                }
                if terminal {
                    debug!("任务 {} 收到终止事件, 关闭推送", task_id);
                    return;
                }
                continue;
            }
        };

        let _ = outbox.send(TaskMessage::StreamEnded(end));
        return;
    }
}
