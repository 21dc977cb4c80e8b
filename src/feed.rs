//! 任务状态推送
//! 把编排器的视图变化和刷新通知转成 SSE 事件流

use crate::types::{Task, TaskView};
use futures::stream::Stream;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

/// 推送给前端的事件
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum FeedEvent {
    State(TaskView),
    Refresh {
        #[serde(rename = "taskId")]
        task_id: String,
    },
}

impl FeedEvent {
    fn name(&self) -> &'static str {
        match self {
            FeedEvent::State(_) => "state",
            FeedEvent::Refresh { .. } => "refresh",
        }
    }
}

/// 订阅任务状态, 先推送一次当前状态, 之后每次变化推送一次
pub fn task_feed(
    mut views: watch::Receiver<TaskView>,
    mut refresh: broadcast::Receiver<Task>,
) -> impl Stream<Item = String> {
    let (tx, rx) = mpsc::channel::<String>(32);

    tokio::spawn(async move {
        let current = views.borrow_and_update().clone();
        if tx.send(format_event(&FeedEvent::State(current))).await.is_err() {
            return;
        }

        loop {
            let event = tokio::select! {
                _ = tx.closed() => break,
                changed = views.changed() => match changed {
                    Ok(()) => FeedEvent::State(views.borrow_and_update().clone()),
                    Err(_) => break,
                },
                task = refresh.recv() => match task {
                    Ok(task) => FeedEvent::Refresh { task_id: task.id },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("刷新通知积压, 跳过 {} 条", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };

            if tx.send(format_event(&event)).await.is_err() {
                break;
            }
        }

        debug!("任务推送连接已关闭");
    });

    ReceiverStream::new(rx)
}

/// 格式化 SSE 事件
fn format_event(event: &FeedEvent) -> String {
    format!(
        "event: {}\ndata: {}\n\n",
        event.name(),
        serde_json::to_string(event).unwrap_or_default()
    )
}
