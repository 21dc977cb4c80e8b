use thiserror::Error;

/// 与弹幕服务通信时的传输层错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("请求超时")]
    Timeout,
    #[error("请求失败: {0}")]
    RequestFailed(String),
    #[error("响应异常状态码: {0}")]
    BadStatus(u16),
    #[error("响应解析失败: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::RequestFailed(e.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("参数校验失败: {0}")]
    Validation(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("任务失败: {0}")]
    TaskFailure(String),
    #[error("等待服务重启超时, 操作可能已成功, 请手动刷新")]
    RestartTimeout,
    #[error("与服务端的连接中断, 无法确认任务状态, 请刷新页面")]
    StatusUnknown,
    #[error("当前没有正在跟踪的任务")]
    NoActiveTask,
    #[error("任务仍在进行中, 请先取消")]
    TaskInProgress,
}
