//! 数据模型
//! 任务记录、进度事件、缓存状态以及对 UI 暴露的视图

use crate::error::TaskError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// 任务消息最多保留条数
pub const MAX_MESSAGES: usize = 500;

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// 下载结果汇总
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub downloaded: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// 当前跟踪的后台任务
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,
    pub current: u64,
    pub total: u64,
    pub percent: u8,
    pub messages: VecDeque<String>,
    pub needs_restart: bool,
    /// 重启已被探测器确认
    pub confirmed: bool,
    pub result_summary: ResultSummary,
    pub started_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: TaskStatus::Pending,
            current: 0,
            total: 0,
            percent: 0,
            messages: VecDeque::new(),
            needs_restart: false,
            confirmed: false,
            result_summary: ResultSummary::default(),
            started_at: Utc::now(),
        }
    }

    pub fn push_message(&mut self, message: impl Into<String>) {
        let message = message.into();
        if message.is_empty() {
            return;
        }
        if self.messages.len() >= MAX_MESSAGES {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    /// 按 current/total 重新计算百分比
    pub fn recompute_percent(&mut self) {
        self.percent = if self.total == 0 {
            0
        } else {
            (u128::from(self.current.min(self.total)) * 100 / u128::from(self.total)) as u8
        };
    }
}

/// 资源下载/更新任务参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUpdateParams {
    #[serde(alias = "repo_url")]
    pub repo_url: String,
    #[serde(default, alias = "full_replace")]
    pub full_replace: bool,
}

/// 服务端推送的进度事件
///
/// 所有字段在线上都可能缺省, 缺省即为零值。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Info {
        #[serde(default)]
        message: String,
    },
    Total {
        #[serde(default)]
        total: u64,
        #[serde(default)]
        message: String,
    },
    CompareResult {
        #[serde(default, alias = "toDownload", alias = "need_download")]
        to_download: u64,
        #[serde(default)]
        unchanged: u64,
        #[serde(default)]
        message: String,
    },
    Progress {
        #[serde(default)]
        current: u64,
        #[serde(default)]
        total: u64,
        #[serde(default)]
        filename: String,
        #[serde(default)]
        message: String,
    },
    Success {
        #[serde(default)]
        filename: String,
        #[serde(default)]
        message: String,
    },
    Skip {
        #[serde(default)]
        filename: String,
        #[serde(default)]
        message: String,
    },
    SkipHash {
        #[serde(default)]
        filename: String,
        #[serde(default)]
        message: String,
    },
    Failed {
        #[serde(default)]
        filename: String,
        #[serde(default, alias = "error")]
        message: String,
    },
    Complete {
        #[serde(default)]
        downloaded: u64,
        #[serde(default)]
        skipped: u64,
        #[serde(default)]
        failed: u64,
        #[serde(
            default,
            alias = "needsRestart",
            alias = "needRestart",
            alias = "need_restart"
        )]
        needs_restart: bool,
        #[serde(default)]
        message: String,
    },
    ContainerRestartRequired {
        #[serde(default)]
        message: String,
    },
    Restart {
        #[serde(default)]
        message: String,
    },
    Done {
        #[serde(default)]
        message: String,
    },
    Error {
        #[serde(default)]
        message: String,
    },
    /// 未登记的事件类型
    #[serde(other)]
    Unknown,
}

impl ProgressEvent {
    /// 终止信号: 收到后订阅即关闭
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete { .. } | Self::Error { .. } | Self::Restart { .. } | Self::Done { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Info { .. } => "info",
            Self::Total { .. } => "total",
            Self::CompareResult { .. } => "compare_result",
            Self::Progress { .. } => "progress",
            Self::Success { .. } => "success",
            Self::Skip { .. } => "skip",
            Self::SkipHash { .. } => "skip_hash",
            Self::Failed { .. } => "failed",
            Self::Complete { .. } => "complete",
            Self::ContainerRestartRequired { .. } => "container_restart_required",
            Self::Restart { .. } => "restart",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
            Self::Unknown => "unknown",
        }
    }
}

/// 服务端缓存的任务快照 (服务重启后仍可查询)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedStatus {
    pub found: bool,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default, alias = "needs_restart", alias = "need_restart")]
    pub needs_restart: bool,
    #[serde(default)]
    pub downloaded: u64,
    #[serde(default)]
    pub skipped: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub message: String,
}

impl CachedStatus {
    pub fn not_found() -> Self {
        Self::default()
    }

    /// 与该快照等价的终止事件; 非终止状态返回 None
    pub fn as_terminal_event(&self) -> Option<ProgressEvent> {
        if !self.found {
            return None;
        }
        match self.status? {
            TaskStatus::Completed => Some(ProgressEvent::Complete {
                downloaded: self.downloaded,
                skipped: self.skipped,
                failed: self.failed,
                needs_restart: self.needs_restart,
                message: self.message.clone(),
            }),
            TaskStatus::Failed => Some(ProgressEvent::Error {
                message: self.message.clone(),
            }),
            TaskStatus::Pending | TaskStatus::Running | TaskStatus::Cancelled => None,
        }
    }
}

/// 上传安装包的响应
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallResponse {
    #[serde(default)]
    pub message: String,
    #[serde(default, alias = "need_restart")]
    pub need_restart: bool,
    #[serde(default, alias = "auto_restart")]
    pub auto_restart: bool,
}

/// 待转发的安装包
#[derive(Debug, Clone)]
pub struct PackageUpload {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// 重启探测阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbePhase {
    AwaitingDown,
    AwaitingUp,
}

/// 重启探测进度
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartProbeState {
    pub phase: ProbePhase,
    pub elapsed_seconds: u64,
    pub budget_seconds: u64,
    pub percent: u8,
}

/// 推送通道状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub attached: bool,
    pub saw_terminal: bool,
}

/// UI 看到的阶段
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewPhase {
    #[default]
    Idle,
    Streaming,
    Reconciling,
    Degraded,
    AwaitingRestart,
    Settled,
}

/// 任务最终结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Failed { message: String },
    Cancelled,
    RestartConfirmed,
    /// 重启确认超时, 操作大概率已成功
    RestartTimeout,
    /// 推送中断且无法确认状态, 需要手动刷新
    RefreshRequired,
    ManualRestartRequired { message: String },
    /// 用户放弃等待重启
    Dismissed,
}

impl Outcome {
    /// 是否需要触发数据刷新
    pub fn triggers_refresh(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed { .. } | Self::RestartConfirmed
        )
    }

    /// 需要展示给用户的错误; 取消与成功没有错误文本
    pub fn error(&self) -> Option<TaskError> {
        match self {
            Self::Failed { message } => Some(TaskError::TaskFailure(message.clone())),
            Self::RestartTimeout => Some(TaskError::RestartTimeout),
            Self::RefreshRequired => Some(TaskError::StatusUnknown),
            Self::Completed
            | Self::Cancelled
            | Self::RestartConfirmed
            | Self::ManualRestartRequired { .. }
            | Self::Dismissed => None,
        }
    }
}

/// 编排器对外暴露的状态快照
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    pub task: Option<Task>,
    pub phase: ViewPhase,
    pub connection: ConnectionState,
    pub probe: Option<RestartProbeState>,
    pub notice: Option<Outcome>,
    pub error: Option<String>,
}

impl TaskView {
    pub fn is_settled(&self) -> bool {
        matches!(self.phase, ViewPhase::Settled | ViewPhase::Idle)
    }
}
