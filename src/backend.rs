//! 弹幕服务接口
//! 编排器通过 `TaskBackend` 与服务端交互, 默认实现基于 reqwest

use crate::config::ServerConfig;
use crate::error::{TaskError, TransportError};
use crate::http_client::{self, HTTP_CLIENT};
use crate::stream::decode_stream;
use crate::types::{CachedStatus, InstallResponse, PackageUpload, ProgressEvent, ResourceUpdateParams};
use async_trait::async_trait;
use futures::stream::BoxStream;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

pub type EventStream = BoxStream<'static, Result<ProgressEvent, TransportError>>;

const RESOURCE_TASKS: &str = "api/ui/scrapers/resources/download";
const UPLOAD_PACKAGE: &str = "api/ui/scrapers/upload-package";

/// 服务存活检查, 重启探测只依赖这一项
#[async_trait]
pub trait Liveness: Send + Sync {
    /// 任何非 2xx 或请求失败都视为服务不可用
    async fn is_up(&self) -> bool;
}

#[async_trait]
pub trait TaskBackend: Liveness {
    async fn launch(&self, params: &ResourceUpdateParams) -> Result<String, TaskError>;

    async fn cancel(&self, task_id: &str) -> Result<(), TransportError>;

    async fn subscribe(&self, task_id: &str) -> Result<EventStream, TransportError>;

    async fn cached_status(&self, task_id: &str) -> Result<CachedStatus, TransportError>;

    async fn install_package(&self, upload: PackageUpload) -> Result<InstallResponse, TaskError>;
}

#[derive(Debug, Deserialize)]
struct LaunchResponse {
    #[serde(alias = "taskId")]
    task_id: String,
}

pub struct HttpBackend {
    client: Client,
    base: Url,
    liveness_url: Url,
    liveness_timeout: Duration,
    request_timeout: Duration,
}

impl HttpBackend {
    pub fn new(config: &ServerConfig) -> Result<Self, url::ParseError> {
        Self::with_client(HTTP_CLIENT.clone(), config)
    }

    pub fn with_client(client: Client, config: &ServerConfig) -> Result<Self, url::ParseError> {
        // 保证 join 时保留 base 的路径前缀
        let mut base = Url::parse(&config.base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let liveness_url = base.join(config.liveness_path.trim_start_matches('/'))?;

        Ok(Self {
            client,
            base,
            liveness_url,
            liveness_timeout: config.liveness_timeout,
            request_timeout: config.request_timeout,
        })
    }

    fn task_url(&self, task_id: &str, action: &str) -> Result<Url, TransportError> {
        let path = format!(
            "{}/{}/{}",
            RESOURCE_TASKS,
            urlencoding::encode(task_id),
            action
        );
        self.base
            .join(&path)
            .map_err(|e| TransportError::RequestFailed(e.to_string()))
    }

    fn url(&self, path: &str) -> Result<Url, TransportError> {
        self.base
            .join(path)
            .map_err(|e| TransportError::RequestFailed(e.to_string()))
    }
}

#[async_trait]
impl Liveness for HttpBackend {
    async fn is_up(&self) -> bool {
        let req = self
            .client
            .get(self.liveness_url.clone())
            .timeout(self.liveness_timeout);
        match http_client::send(req).await {
            Ok(_) => true,
            Err(e) => {
                debug!("存活检查失败: {}", e);
                false
            }
        }
    }
}

#[async_trait]
impl TaskBackend for HttpBackend {
    async fn launch(&self, params: &ResourceUpdateParams) -> Result<String, TaskError> {
        let req = self
            .client
            .post(self.url(RESOURCE_TASKS)?)
            .timeout(self.request_timeout)
            .json(params);
        let response: LaunchResponse = http_client::send_validated(req).await?;
        Ok(response.task_id)
    }

    async fn cancel(&self, task_id: &str) -> Result<(), TransportError> {
        let req = self
            .client
            .post(self.task_url(task_id, "cancel")?)
            .timeout(self.request_timeout);
        http_client::send(req).await.map(|_| ())
    }

    async fn subscribe(&self, task_id: &str) -> Result<EventStream, TransportError> {
        // 长连接, 不设请求超时; 空闲超时由订阅方负责
        let req = self
            .client
            .get(self.task_url(task_id, "progress")?)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(reqwest::header::CACHE_CONTROL, "no-cache");
        let response = http_client::send(req).await?;
        Ok(decode_stream(response.bytes_stream()))
    }

    async fn cached_status(&self, task_id: &str) -> Result<CachedStatus, TransportError> {
        let req = self
            .client
            .get(self.task_url(task_id, "status")?)
            .timeout(self.request_timeout);
        match http_client::send_json(req).await {
            Err(TransportError::BadStatus(code)) if code == StatusCode::NOT_FOUND.as_u16() => {
                Ok(CachedStatus::not_found())
            }
            other => other,
        }
    }

    async fn install_package(&self, upload: PackageUpload) -> Result<InstallResponse, TaskError> {
        let part = reqwest::multipart::Part::bytes(upload.bytes).file_name(upload.file_name);
        let form = reqwest::multipart::Form::new().part("file", part);
        let req = self
            .client
            .post(self.url(UPLOAD_PACKAGE)?)
            .timeout(self.request_timeout)
            .multipart(form);
        http_client::send_validated(req).await
    }
}
