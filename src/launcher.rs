//! 任务启动与取消

use crate::backend::TaskBackend;
use crate::error::TaskError;
use crate::types::ResourceUpdateParams;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use url::Url;

#[derive(Clone)]
pub struct TaskLauncher {
    backend: Arc<dyn TaskBackend>,
}

impl TaskLauncher {
    pub fn new(backend: Arc<dyn TaskBackend>) -> Self {
        Self { backend }
    }

    /// 本地参数检查, 服务端还会再校验一次
    pub fn validate(params: &ResourceUpdateParams) -> Result<(), TaskError> {
        let repo_url = params.repo_url.trim();
        if repo_url.is_empty() {
            return Err(TaskError::Validation("仓库地址不能为空".to_string()));
        }

        let url = Url::parse(repo_url)
            .map_err(|e| TaskError::Validation(format!("仓库地址无效: {}", e)))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(TaskError::Validation(format!(
                "仓库地址必须是 http(s) 链接: {}",
                repo_url
            )));
        }

        Ok(())
    }

    /// 启动任务并返回任务 id; 失败时不会产生任何任务
    pub async fn launch(&self, params: &ResourceUpdateParams) -> Result<String, TaskError> {
        Self::validate(params)?;

        let params = ResourceUpdateParams {
            repo_url: params.repo_url.trim().to_string(),
            ..params.clone()
        };
        let task_id = self.backend.launch(&params).await?;
        info!("🚀 已启动资源更新任务 {} ({})", task_id, params.repo_url);
        Ok(task_id)
    }

    /// 通知服务端停止任务, 不等待结果
    pub fn cancel(&self, task_id: &str) -> JoinHandle<()> {
        let backend = self.backend.clone();
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            match backend.cancel(&task_id).await {
                Ok(()) => info!("服务端已确认取消任务 {}", task_id),
                Err(e) => warn!("⚠️ 取消任务 {} 的请求失败: {}", task_id, e),
            }
        })
    }
}
