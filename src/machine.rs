//! 任务状态机
//!
//! 纯粹的 reducer: 每个外部信号 (推送事件、流断开、兜底查询结果、计时器、
//! 重启探测、用户取消) 都是一条 [`TaskMessage`], `apply` 只修改状态并返回
//! 需要执行的 [`Effect`], 不做任何 IO。
//!
//! 终止状态一旦写入就不再改变; 收到终止信号后连接标记为 `SawTerminal`,
//! 之后传输层的断开/报错一律按正常收尾处理。

use crate::error::TransportError;
use crate::prober::ProbeOutcome;
use crate::types::{
    CachedStatus, ConnectionState, InstallResponse, Outcome, ProgressEvent, RestartProbeState,
    Task, TaskStatus, TaskView, ViewPhase,
};
use tracing::{debug, info, warn};

/// 推送流结束的方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// 服务端正常关闭, 但没有发出终止事件
    Closed,
    Failed(TransportError),
    /// 超过空闲超时没有任何事件
    Stalled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskMessage {
    Stream(ProgressEvent),
    StreamEnded(StreamEnd),
    Fallback(Result<CachedStatus, TransportError>),
    GraceElapsed,
    Probe(RestartProbeState),
    ProbeResolved(ProbeOutcome),
    Cancel,
}

/// reducer 要求执行的副作用
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Subscribe,
    CloseStream,
    QueryFallback,
    StartGrace,
    StartProbe,
    RemoteCancel,
    Settle(Outcome),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Streaming,
    Reconciling,
    Degraded,
    AwaitingRestart,
    Settled(Outcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Connection {
    Attached,
    SawTerminal,
    Lost,
    Detached,
}

#[derive(Debug, Clone)]
pub struct TaskMachine {
    task: Task,
    phase: Phase,
    connection: Connection,
    probe: Option<RestartProbeState>,
    reattached: u32,
    max_reattach: u32,
    probes_started: u32,
    fallback_queries: u32,
}

impl TaskMachine {
    /// 由启动接口返回的任务 id 创建, 通过推送流跟踪
    pub fn streaming(task: Task, max_reattach: u32) -> Self {
        Self {
            task,
            phase: Phase::Streaming,
            connection: Connection::Detached,
            probe: None,
            reattached: 0,
            max_reattach,
            probes_started: 0,
            fallback_queries: 0,
        }
    }

    /// 已完成且需要重启的任务, 直接进入重启探测 (安装包上传)
    pub fn awaiting_restart(mut task: Task) -> Self {
        task.status = TaskStatus::Completed;
        task.needs_restart = true;
        task.percent = 100;
        Self {
            task,
            phase: Phase::AwaitingRestart,
            connection: Connection::Detached,
            probe: None,
            reattached: 0,
            max_reattach: 0,
            probes_started: 0,
            fallback_queries: 0,
        }
    }

    /// 安装包上传的结果: 自动重启时进入探测, 否则直接结束
    pub fn from_install(mut task: Task, response: &InstallResponse) -> Self {
        task.push_message(response.message.clone());
        if response.need_restart && response.auto_restart {
            return Self::awaiting_restart(task);
        }

        task.status = TaskStatus::Completed;
        task.percent = 100;
        let outcome = if response.need_restart {
            task.needs_restart = true;
            Outcome::ManualRestartRequired {
                message: or_default(response.message.clone(), || {
                    "安装完成, 请手动重启服务".to_string()
                }),
            }
        } else {
            Outcome::Completed
        };

        Self {
            task,
            phase: Phase::Settled(outcome),
            connection: Connection::Detached,
            probe: None,
            reattached: 0,
            max_reattach: 0,
            probes_started: 0,
            fallback_queries: 0,
        }
    }

    /// 初始副作用
    pub fn begin(&mut self) -> Vec<Effect> {
        match &self.phase {
            Phase::Streaming => {
                self.connection = Connection::Attached;
                vec![Effect::Subscribe]
            }
            Phase::AwaitingRestart => {
                self.probes_started += 1;
                vec![Effect::StartProbe]
            }
            Phase::Settled(outcome) => vec![Effect::Settle(outcome.clone())],
            Phase::Reconciling | Phase::Degraded => Vec::new(),
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        match &self.phase {
            Phase::Settled(outcome) => Some(outcome),
            _ => None,
        }
    }

    pub fn probes_started(&self) -> u32 {
        self.probes_started
    }

    pub fn fallback_queries(&self) -> u32 {
        self.fallback_queries
    }

    pub fn apply(&mut self, message: TaskMessage) -> Vec<Effect> {
        match message {
            TaskMessage::Stream(event) => self.on_stream_event(event),
            TaskMessage::StreamEnded(end) => self.on_stream_end(end),
            TaskMessage::Fallback(result) => self.on_fallback(result),
            TaskMessage::GraceElapsed => {
                if self.phase != Phase::Degraded {
                    return Vec::new();
                }
                warn!("⚠️ 任务 {} 状态在宽限期内仍无法确认", self.task.id);
                self.task
                    .push_message("无法确认任务状态, 服务可能仍在重启, 请稍后手动刷新");
                self.settle(Outcome::RefreshRequired)
            }
            TaskMessage::Probe(state) => {
                if self.phase == Phase::AwaitingRestart {
                    self.probe = Some(state);
                }
                Vec::new()
            }
            TaskMessage::ProbeResolved(outcome) => self.on_probe_resolved(outcome),
            TaskMessage::Cancel => self.on_cancel(),
        }
    }

    fn on_stream_event(&mut self, event: ProgressEvent) -> Vec<Effect> {
        if self.connection != Connection::Attached || self.phase != Phase::Streaming {
            debug!("丢弃任务 {} 的过期事件: {}", self.task.id, event.kind());
            return Vec::new();
        }

        if self.task.status == TaskStatus::Pending {
            self.task.status = TaskStatus::Running;
        }

        if event.is_terminal() {
            self.connection = Connection::SawTerminal;
            let mut effects = vec![Effect::CloseStream];
            effects.extend(self.on_terminal(event));
            return effects;
        }

        self.apply_progress(event);
        Vec::new()
    }

    /// 非终止事件只更新计数与消息
    fn apply_progress(&mut self, event: ProgressEvent) {
        let task = &mut self.task;
        match event {
            ProgressEvent::Info { message } => task.push_message(message),
            ProgressEvent::Total { total, message } => {
                task.total = total;
                task.recompute_percent();
                task.push_message(message);
            }
            ProgressEvent::CompareResult {
                to_download,
                unchanged,
                message,
            } => {
                if to_download > 0 {
                    task.total = to_download;
                    task.recompute_percent();
                }
                if message.is_empty() {
                    task.push_message(format!(
                        "需要下载 {} 个文件, {} 个无变化",
                        to_download, unchanged
                    ));
                } else {
                    task.push_message(message);
                }
            }
            ProgressEvent::Progress {
                current,
                total,
                filename,
                message,
            } => {
                task.current = current;
                if total > 0 {
                    task.total = total;
                }
                task.recompute_percent();
                if !message.is_empty() {
                    task.push_message(message);
                } else if !filename.is_empty() {
                    task.push_message(format!("正在处理: {}", filename));
                }
            }
            ProgressEvent::Success { filename, message } => {
                task.result_summary.downloaded += 1;
                task.push_message(or_default(message, || format!("✅ {}", filename)));
            }
            ProgressEvent::Skip { filename, message }
            | ProgressEvent::SkipHash { filename, message } => {
                task.result_summary.skipped += 1;
                task.push_message(or_default(message, || format!("⏭️ {}", filename)));
            }
            ProgressEvent::Failed { filename, message } => {
                task.result_summary.failed += 1;
                task.push_message(format!("❌ {} {}", filename, message).trim().to_string());
            }
            // 仅提示, 是否重启以终止事件为准
            ProgressEvent::ContainerRestartRequired { message } => {
                task.push_message(or_default(message, || "完成后可能需要重启服务".to_string()));
            }
            ProgressEvent::Unknown => {
                debug!("任务 {} 收到未知类型的事件", task.id);
            }
            ProgressEvent::Complete { .. }
            | ProgressEvent::Restart { .. }
            | ProgressEvent::Done { .. }
            | ProgressEvent::Error { .. } => {}
        }
    }

    /// 终止事件, 推送流与兜底查询共用
    fn on_terminal(&mut self, event: ProgressEvent) -> Vec<Effect> {
        if self.task.status.is_terminal() {
            debug!("任务 {} 已终止, 忽略 {}", self.task.id, event.kind());
            return Vec::new();
        }

        match event {
            ProgressEvent::Complete {
                downloaded,
                skipped,
                failed,
                needs_restart,
                message,
            } => {
                self.task.result_summary.downloaded = downloaded;
                self.task.result_summary.skipped = skipped;
                self.task.result_summary.failed = failed;
                self.task.needs_restart = needs_restart;
                self.task.push_message(or_default(message, || {
                    format!(
                        "完成: 下载 {} 个, 跳过 {} 个, 失败 {} 个",
                        downloaded, skipped, failed
                    )
                }));
                self.finish_completed()
            }
            ProgressEvent::Restart { message } => {
                self.task.needs_restart = true;
                self.task
                    .push_message(or_default(message, || "服务正在重启".to_string()));
                self.finish_completed()
            }
            ProgressEvent::Done { message } => {
                self.task.push_message(message);
                self.finish_completed()
            }
            ProgressEvent::Error { message } => {
                self.task.status = TaskStatus::Failed;
                self.task.push_message(message.clone());
                warn!("❌ 任务 {} 失败: {}", self.task.id, message);
                self.settle(Outcome::Failed { message })
            }
            other => {
                debug!("{} 不是终止事件", other.kind());
                Vec::new()
            }
        }
    }

    fn finish_completed(&mut self) -> Vec<Effect> {
        self.task.status = TaskStatus::Completed;
        if self.task.total > 0 {
            self.task.current = self.task.total;
        }
        self.task.percent = 100;

        if self.task.needs_restart {
            info!("🔄 任务 {} 完成, 等待服务重启", self.task.id);
            self.phase = Phase::AwaitingRestart;
            self.probes_started += 1;
            vec![Effect::StartProbe]
        } else {
            info!("✅ 任务 {} 完成", self.task.id);
            self.settle(Outcome::Completed)
        }
    }

    fn on_stream_end(&mut self, end: StreamEnd) -> Vec<Effect> {
        if self.connection != Connection::Attached
            || self.phase != Phase::Streaming
            || self.task.status.is_terminal()
        {
            debug!("任务 {} 推送通道收尾: {:?}", self.task.id, end);
            return Vec::new();
        }

        match &end {
            StreamEnd::Closed => warn!("⚠️ 任务 {} 推送在终止事件前关闭", self.task.id),
            StreamEnd::Failed(e) => warn!("⚠️ 任务 {} 推送中断: {}", self.task.id, e),
            StreamEnd::Stalled => warn!("⚠️ 任务 {} 推送长时间无事件", self.task.id),
        }

        self.connection = Connection::Lost;
        self.phase = Phase::Reconciling;
        self.fallback_queries += 1;
        vec![Effect::QueryFallback]
    }

    fn on_fallback(&mut self, result: Result<CachedStatus, TransportError>) -> Vec<Effect> {
        if self.phase != Phase::Reconciling {
            return Vec::new();
        }

        let cached = match result {
            Ok(cached) => cached,
            Err(e) => {
                warn!("⚠️ 任务 {} 状态查询失败: {}", self.task.id, e);
                return self.enter_degraded();
            }
        };

        if let Some(event) = cached.as_terminal_event() {
            info!("任务 {} 通过缓存状态对账: {}", self.task.id, event.kind());
            self.connection = Connection::Detached;
            return self.on_terminal(event);
        }

        match cached.status {
            Some(TaskStatus::Cancelled) if cached.found => {
                self.connection = Connection::Detached;
                self.task.status = TaskStatus::Cancelled;
                self.task.push_message(cached.message);
                self.settle(Outcome::Cancelled)
            }
            Some(TaskStatus::Pending | TaskStatus::Running) if cached.found => {
                if self.reattached >= self.max_reattach {
                    warn!("⚠️ 任务 {} 重新订阅次数已用完", self.task.id);
                    return self.enter_degraded();
                }
                self.reattached += 1;
                info!(
                    "任务 {} 仍在运行, 重新订阅推送 ({}/{})",
                    self.task.id, self.reattached, self.max_reattach
                );
                self.phase = Phase::Streaming;
                self.connection = Connection::Attached;
                vec![Effect::Subscribe]
            }
            _ => self.enter_degraded(),
        }
    }

    fn enter_degraded(&mut self) -> Vec<Effect> {
        self.phase = Phase::Degraded;
        self.connection = Connection::Detached;
        self.task
            .push_message("与服务端的连接中断, 正在等待服务恢复...");
        vec![Effect::StartGrace]
    }

    fn on_probe_resolved(&mut self, outcome: ProbeOutcome) -> Vec<Effect> {
        if self.phase != Phase::AwaitingRestart {
            return Vec::new();
        }
        match outcome {
            ProbeOutcome::Ready { .. } => {
                self.task.confirmed = true;
                self.task.push_message("服务已重启完成");
                self.settle(Outcome::RestartConfirmed)
            }
            ProbeOutcome::Timeout { .. } => {
                self.task
                    .push_message("等待服务重启超时, 操作可能已成功, 请手动刷新");
                self.settle(Outcome::RestartTimeout)
            }
            // 探测器被取消时不改动任务
            ProbeOutcome::Cancelled => Vec::new(),
        }
    }

    fn on_cancel(&mut self) -> Vec<Effect> {
        match self.phase {
            Phase::Settled(_) => Vec::new(),
            Phase::AwaitingRestart => {
                info!("任务 {} 放弃等待重启", self.task.id);
                self.settle(Outcome::Dismissed)
            }
            Phase::Streaming | Phase::Reconciling | Phase::Degraded => {
                if self.task.status.is_terminal() {
                    return Vec::new();
                }
                info!("🛑 任务 {} 已取消", self.task.id);
                self.task.status = TaskStatus::Cancelled;
                self.connection = Connection::Detached;
                self.task.push_message("任务已取消");
                let mut effects = vec![Effect::RemoteCancel];
                effects.extend(self.settle(Outcome::Cancelled));
                effects
            }
        }
    }

    fn settle(&mut self, outcome: Outcome) -> Vec<Effect> {
        self.phase = Phase::Settled(outcome.clone());
        vec![Effect::Settle(outcome)]
    }

    pub fn view(&self) -> TaskView {
        let phase = match self.phase {
            Phase::Streaming => ViewPhase::Streaming,
            Phase::Reconciling => ViewPhase::Reconciling,
            Phase::Degraded => ViewPhase::Degraded,
            Phase::AwaitingRestart => ViewPhase::AwaitingRestart,
            Phase::Settled(_) => ViewPhase::Settled,
        };
        let notice = self.outcome().cloned();
        TaskView {
            task: Some(self.task.clone()),
            phase,
            connection: ConnectionState {
                attached: self.connection == Connection::Attached,
                saw_terminal: self.connection == Connection::SawTerminal,
            },
            probe: self.probe,
            error: notice.as_ref().and_then(Outcome::error).map(|e| e.to_string()),
            notice,
        }
    }
}

fn or_default(message: String, fallback: impl FnOnce() -> String) -> String {
    if message.is_empty() {
        fallback()
    } else {
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProbePhase;
    use std::time::Duration;

    fn machine() -> TaskMachine {
        let mut machine = TaskMachine::streaming(Task::new("task-1"), 1);
        assert_eq!(machine.begin(), vec![Effect::Subscribe]);
        machine
    }

    fn progress(current: u64, total: u64) -> TaskMessage {
        TaskMessage::Stream(ProgressEvent::Progress {
            current,
            total,
            filename: String::new(),
            message: String::new(),
        })
    }

    fn complete(needs_restart: bool) -> TaskMessage {
        TaskMessage::Stream(ProgressEvent::Complete {
            downloaded: 3,
            skipped: 1,
            failed: 0,
            needs_restart,
            message: String::new(),
        })
    }

    fn transport_error() -> TaskMessage {
        TaskMessage::StreamEnded(StreamEnd::Failed(TransportError::RequestFailed(
            "connection reset".to_string(),
        )))
    }

    #[test]
    fn non_terminal_events_only_touch_counters() {
        let mut m = machine();
        assert!(m.apply(progress(40, 100)).is_empty());
        assert!(m
            .apply(TaskMessage::Stream(ProgressEvent::Success {
                filename: "a.py".to_string(),
                message: String::new(),
            }))
            .is_empty());
        assert!(m
            .apply(TaskMessage::Stream(ProgressEvent::SkipHash {
                filename: "b.py".to_string(),
                message: String::new(),
            }))
            .is_empty());
        assert!(m
            .apply(TaskMessage::Stream(ProgressEvent::Failed {
                filename: "c.py".to_string(),
                message: "hash mismatch".to_string(),
            }))
            .is_empty());

        let task = m.task();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.percent, 40);
        assert_eq!(task.result_summary.downloaded, 1);
        assert_eq!(task.result_summary.skipped, 1);
        assert_eq!(task.result_summary.failed, 1);
        assert_eq!(task.messages.len(), 3);
    }

    #[test]
    fn complete_without_restart_settles_without_probe() {
        let mut m = machine();
        m.apply(progress(40, 100));
        m.apply(progress(100, 100));
        let effects = m.apply(complete(false));

        assert_eq!(
            effects,
            vec![Effect::CloseStream, Effect::Settle(Outcome::Completed)]
        );
        assert_eq!(m.task().status, TaskStatus::Completed);
        assert_eq!(m.task().result_summary.downloaded, 3);
        assert_eq!(m.probes_started(), 0);
    }

    #[test]
    fn complete_with_restart_starts_exactly_one_probe() {
        let mut m = machine();
        let effects = m.apply(complete(true));
        assert_eq!(effects, vec![Effect::CloseStream, Effect::StartProbe]);

        // 断开与重复事件都不能再启动探测
        assert!(m.apply(transport_error()).is_empty());
        assert!(m.apply(complete(true)).is_empty());
        assert!(m
            .apply(TaskMessage::Stream(ProgressEvent::Restart {
                message: String::new()
            }))
            .is_empty());
        assert_eq!(m.probes_started(), 1);

        m.apply(TaskMessage::Probe(RestartProbeState {
            phase: ProbePhase::AwaitingUp,
            elapsed_seconds: 12,
            budget_seconds: 120,
            percent: 10,
        }));
        assert_eq!(m.view().phase, ViewPhase::AwaitingRestart);

        let effects = m.apply(TaskMessage::ProbeResolved(ProbeOutcome::Ready {
            elapsed: Duration::from_secs(14),
        }));
        assert_eq!(effects, vec![Effect::Settle(Outcome::RestartConfirmed)]);
        assert!(m.task().confirmed);
        assert_eq!(m.task().status, TaskStatus::Completed);
    }

    #[test]
    fn restart_hint_does_not_override_complete_payload() {
        let mut m = machine();
        m.apply(TaskMessage::Stream(ProgressEvent::ContainerRestartRequired {
            message: String::new(),
        }));
        assert_eq!(m.task().status, TaskStatus::Running);
        assert!(!m.task().needs_restart);

        let effects = m.apply(complete(false));
        assert_eq!(
            effects,
            vec![Effect::CloseStream, Effect::Settle(Outcome::Completed)]
        );
        assert!(!m.task().needs_restart);
        assert_eq!(m.probes_started(), 0);

        let mut m = machine();
        m.apply(TaskMessage::Stream(ProgressEvent::ContainerRestartRequired {
            message: String::new(),
        }));
        assert_eq!(
            m.apply(complete(true)),
            vec![Effect::CloseStream, Effect::StartProbe]
        );
        assert_eq!(m.probes_started(), 1);
    }

    #[test]
    fn transport_error_after_terminal_is_silent() {
        let mut m = machine();
        m.apply(complete(false));
        assert!(m.apply(transport_error()).is_empty());
        assert!(m
            .apply(TaskMessage::StreamEnded(StreamEnd::Closed))
            .is_empty());
        assert_eq!(m.fallback_queries(), 0);
        assert_eq!(m.outcome(), Some(&Outcome::Completed));
        assert!(m.view().connection.saw_terminal);
    }

    #[test]
    fn transport_error_before_terminal_queries_once() {
        let mut m = machine();
        m.apply(progress(10, 100));
        assert_eq!(m.apply(transport_error()), vec![Effect::QueryFallback]);
        // 同一次断开的后续信号不再触发查询
        assert!(m.apply(transport_error()).is_empty());
        assert!(m
            .apply(TaskMessage::StreamEnded(StreamEnd::Stalled))
            .is_empty());
        assert_eq!(m.fallback_queries(), 1);
        assert_eq!(m.view().phase, ViewPhase::Reconciling);
    }

    #[test]
    fn fallback_completion_reconciles_like_stream_event() {
        let mut via_stream = machine();
        via_stream.apply(progress(10, 100));
        let stream_effects = via_stream.apply(complete(true));

        let mut via_fallback = machine();
        via_fallback.apply(progress(10, 100));
        via_fallback.apply(transport_error());
        let fallback_effects = via_fallback.apply(TaskMessage::Fallback(Ok(CachedStatus {
            found: true,
            status: Some(TaskStatus::Completed),
            needs_restart: true,
            downloaded: 3,
            skipped: 1,
            failed: 0,
            message: String::new(),
        })));

        assert_eq!(fallback_effects, vec![Effect::StartProbe]);
        assert_eq!(stream_effects[1..], fallback_effects[..]);

        let a = via_stream.task();
        let b = via_fallback.task();
        assert_eq!(a.status, b.status);
        assert_eq!(a.result_summary, b.result_summary);
        assert_eq!(a.needs_restart, b.needs_restart);
        assert_eq!(a.percent, b.percent);
        assert_eq!(via_fallback.probes_started(), 1);
    }

    #[test]
    fn fallback_failure_reports_task_failure() {
        let mut m = machine();
        m.apply(transport_error());
        let effects = m.apply(TaskMessage::Fallback(Ok(CachedStatus {
            found: true,
            status: Some(TaskStatus::Failed),
            message: "仓库不可用".to_string(),
            ..Default::default()
        })));
        assert_eq!(
            effects,
            vec![Effect::Settle(Outcome::Failed {
                message: "仓库不可用".to_string()
            })]
        );
        assert_eq!(m.task().status, TaskStatus::Failed);
        assert_eq!(m.view().error.as_deref(), Some("任务失败: 仓库不可用"));
    }

    #[test]
    fn not_found_degrades_then_asks_for_refresh() {
        let mut m = machine();
        m.apply(progress(10, 100));
        m.apply(transport_error());
        assert_eq!(
            m.apply(TaskMessage::Fallback(Ok(CachedStatus::not_found()))),
            vec![Effect::StartGrace]
        );
        assert_eq!(m.view().phase, ViewPhase::Degraded);

        // 宽限期内的迟到事件不改变状态
        assert!(m.apply(complete(false)).is_empty());

        assert_eq!(
            m.apply(TaskMessage::GraceElapsed),
            vec![Effect::Settle(Outcome::RefreshRequired)]
        );
        assert_eq!(m.task().status, TaskStatus::Running);
        assert!(m.view().error.is_some());
    }

    #[test]
    fn failed_query_degrades_too() {
        let mut m = machine();
        m.apply(TaskMessage::StreamEnded(StreamEnd::Stalled));
        assert_eq!(
            m.apply(TaskMessage::Fallback(Err(TransportError::Timeout))),
            vec![Effect::StartGrace]
        );
    }

    #[test]
    fn running_task_is_reattached_within_limit() {
        let running = || {
            TaskMessage::Fallback(Ok(CachedStatus {
                found: true,
                status: Some(TaskStatus::Running),
                ..Default::default()
            }))
        };
        let mut m = machine();
        m.apply(transport_error());
        assert_eq!(m.apply(running()), vec![Effect::Subscribe]);
        assert_eq!(m.view().phase, ViewPhase::Streaming);

        // 重新订阅后的断开可以再查询一次, 但不会再重新订阅
        assert_eq!(m.apply(transport_error()), vec![Effect::QueryFallback]);
        assert_eq!(m.apply(running()), vec![Effect::StartGrace]);
        assert_eq!(m.fallback_queries(), 2);
    }

    #[test]
    fn restart_and_done_markers_settle_undecided_tasks() {
        let mut m = machine();
        let effects = m.apply(TaskMessage::Stream(ProgressEvent::Restart {
            message: String::new(),
        }));
        assert_eq!(effects, vec![Effect::CloseStream, Effect::StartProbe]);
        assert!(m.task().needs_restart);

        let mut m = machine();
        m.apply(TaskMessage::Stream(ProgressEvent::Success {
            filename: "a.py".to_string(),
            message: String::new(),
        }));
        let effects = m.apply(TaskMessage::Stream(ProgressEvent::Done {
            message: String::new(),
        }));
        assert_eq!(
            effects,
            vec![Effect::CloseStream, Effect::Settle(Outcome::Completed)]
        );
        assert_eq!(m.task().result_summary.downloaded, 1);
    }

    #[test]
    fn error_event_fails_task() {
        let mut m = machine();
        let effects = m.apply(TaskMessage::Stream(ProgressEvent::Error {
            message: "磁盘已满".to_string(),
        }));
        assert_eq!(
            effects,
            vec![
                Effect::CloseStream,
                Effect::Settle(Outcome::Failed {
                    message: "磁盘已满".to_string()
                })
            ]
        );
    }

    #[test]
    fn terminal_event_delivered_twice_is_idempotent() {
        let mut m = machine();
        m.apply(complete(false));
        let before = m.view();
        assert!(m.apply(complete(false)).is_empty());
        assert!(m
            .apply(TaskMessage::Stream(ProgressEvent::Error {
                message: "late".to_string()
            }))
            .is_empty());
        assert_eq!(m.view(), before);
    }

    #[test]
    fn cancel_is_local_and_final() {
        let mut m = machine();
        m.apply(progress(5, 10));
        assert_eq!(
            m.apply(TaskMessage::Cancel),
            vec![Effect::RemoteCancel, Effect::Settle(Outcome::Cancelled)]
        );
        assert_eq!(m.task().status, TaskStatus::Cancelled);
        assert!(m.view().error.is_none());

        assert!(m.apply(complete(false)).is_empty());
        assert!(m.apply(transport_error()).is_empty());
        assert!(m.apply(TaskMessage::Cancel).is_empty());
        assert_eq!(m.task().status, TaskStatus::Cancelled);
    }

    #[test]
    fn cancel_while_awaiting_restart_keeps_completed_status() {
        let mut m = machine();
        m.apply(complete(true));
        assert_eq!(
            m.apply(TaskMessage::Cancel),
            vec![Effect::Settle(Outcome::Dismissed)]
        );
        assert_eq!(m.task().status, TaskStatus::Completed);
        assert!(m
            .apply(TaskMessage::ProbeResolved(ProbeOutcome::Ready {
                elapsed: Duration::from_secs(1)
            }))
            .is_empty());
        assert!(!m.task().confirmed);
    }

    #[test]
    fn install_without_auto_restart_asks_for_manual_action() {
        let response = InstallResponse {
            message: "已安装 3 个源".to_string(),
            need_restart: true,
            auto_restart: false,
        };
        let mut m = TaskMachine::from_install(Task::new("install-1"), &response);
        assert_eq!(
            m.begin(),
            vec![Effect::Settle(Outcome::ManualRestartRequired {
                message: "已安装 3 个源".to_string()
            })]
        );
        assert_eq!(m.probes_started(), 0);

        let response = InstallResponse {
            need_restart: true,
            auto_restart: true,
            ..Default::default()
        };
        let mut m = TaskMachine::from_install(Task::new("install-2"), &response);
        assert_eq!(m.begin(), vec![Effect::StartProbe]);
        assert_eq!(m.view().phase, ViewPhase::AwaitingRestart);
    }

    #[test]
    fn restart_timeout_is_not_a_failure() {
        let mut m = TaskMachine::awaiting_restart(Task::new("install-1"));
        assert_eq!(m.begin(), vec![Effect::StartProbe]);
        let effects = m.apply(TaskMessage::ProbeResolved(ProbeOutcome::Timeout {
            elapsed: Duration::from_secs(120),
        }));
        assert_eq!(effects, vec![Effect::Settle(Outcome::RestartTimeout)]);
        assert_eq!(m.task().status, TaskStatus::Completed);
        assert!(!m.task().confirmed);
    }
}
