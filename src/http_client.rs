use crate::error::{TaskError, TransportError};
use once_cell::sync::Lazy;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;

const CONNECT_TIMEOUT_SECONDS: u64 = 5;

const USER_AGENT: &str = concat!("danmu-task-console/", env!("CARGO_PKG_VERSION"));

/// 全局 HTTP 客户端
///
/// 不设置整体超时: 进度推送是长连接, 普通请求各自通过 `RequestBuilder::timeout` 限时。
pub static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECONDS))
        .user_agent(USER_AGENT)
        .gzip(true)
        .brotli(true)
        .build()
        .expect("Failed to create HTTP client")
});

/// 服务端错误响应体 (`{"detail": "..."}`)
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    detail: serde_json::Value,
}

/// 发送请求, 非 2xx 视为错误
pub async fn send(req: RequestBuilder) -> Result<Response, TransportError> {
    let response = req.send().await?;

    if !response.status().is_success() {
        return Err(TransportError::BadStatus(response.status().as_u16()));
    }

    Ok(response)
}

/// 发送请求并解析 JSON
pub async fn send_json<T: serde::de::DeserializeOwned>(
    req: RequestBuilder,
) -> Result<T, TransportError> {
    let response = send(req).await?;
    response
        .json()
        .await
        .map_err(|e| TransportError::Decode(e.to_string()))
}

/// 发送会经过服务端参数校验的请求
///
/// 400/422 转为 `TaskError::Validation`, 并带上服务端给出的 detail。
pub async fn send_validated<T: serde::de::DeserializeOwned>(
    req: RequestBuilder,
) -> Result<T, TaskError> {
    let response = req.send().await.map_err(TransportError::from)?;
    let status = response.status();

    if status == StatusCode::BAD_REQUEST || status == StatusCode::UNPROCESSABLE_ENTITY {
        let text = response.text().await.unwrap_or_default();
        return Err(TaskError::Validation(extract_detail(&text, status)));
    }

    if !status.is_success() {
        return Err(TransportError::BadStatus(status.as_u16()).into());
    }

    response
        .json()
        .await
        .map_err(|e| TransportError::Decode(e.to_string()).into())
}

fn extract_detail(text: &str, status: StatusCode) -> String {
    let detail = serde_json::from_str::<ErrorBody>(text)
        .ok()
        .map(|body| body.detail)
        .unwrap_or(serde_json::Value::Null);

    match detail {
        serde_json::Value::String(s) if !s.is_empty() => s,
        serde_json::Value::Null => {
            if text.trim().is_empty() {
                format!("HTTP {}", status.as_u16())
            } else {
                text.trim().to_string()
            }
        }
        other => other.to_string(),
    }
}
