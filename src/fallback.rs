//! 兜底状态查询
//!
//! 推送在终止事件之前断开时使用, 每次断开只查询一次。服务端即使重启过,
//! 也会返回缓存的最后一次快照, 或者 `found=false`。

use crate::backend::TaskBackend;
use crate::machine::TaskMessage;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct FallbackPoller {
    backend: Arc<dyn TaskBackend>,
}

impl FallbackPoller {
    pub fn new(backend: Arc<dyn TaskBackend>) -> Self {
        Self { backend }
    }

    /// 查询一次缓存状态并把结果交给状态机; 被取消时什么也不发送
    pub async fn query_once(
        &self,
        task_id: &str,
        outbox: &UnboundedSender<TaskMessage>,
        cancel: &CancellationToken,
    ) {
        info!("🔍 推送中断, 查询任务 {} 的缓存状态", task_id);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("任务 {} 的状态查询已取消", task_id);
                return;
            }
            result = self.backend.cached_status(task_id) => result,
        };

        match &result {
            Ok(cached) if cached.found => info!(
                "任务 {} 缓存状态: {:?}",
                task_id,
                cached.status
            ),
            Ok(_) => warn!("⚠️ 服务端没有任务 {} 的记录", task_id),
            Err(e) => warn!("⚠️ 查询任务 {} 状态失败: {}", task_id, e),
        }

        let _ = outbox.send(TaskMessage::Fallback(result));
    }
}
