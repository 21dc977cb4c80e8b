//! 任务编排器
//!
//! 每个编排器同一时间只跟踪一个任务。任务由一个独立的 runner 驱动:
//! 推送订阅、兜底查询、宽限计时、重启探测这些来源把消息写进同一个队列,
//! runner 逐条交给 [`TaskMachine`] 处理并执行返回的副作用。
//! 同一时刻最多只有一个来源在运行。
//!
//! 启动新任务前, 旧任务的所有来源都会被取消并等待退出。

use crate::backend::TaskBackend;
use crate::clock::sleep_or_cancel;
use crate::config::OrchestratorConfig;
use crate::error::TaskError;
use crate::fallback::FallbackPoller;
use crate::launcher::TaskLauncher;
use crate::machine::{Effect, TaskMachine, TaskMessage};
use crate::prober::RestartProber;
use crate::stream::run_subscriber;
use crate::types::{
    InstallResponse, Outcome, PackageUpload, ResourceUpdateParams, Task, TaskView,
};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 任务结束后的数据刷新回调
pub type RefreshHook = Arc<dyn Fn(&Task) + Send + Sync>;

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn TaskBackend>,
    launcher: TaskLauncher,
    config: OrchestratorConfig,
    view: watch::Sender<TaskView>,
    refresh: RefreshHook,
    active: Mutex<Option<ActiveTask>>,
}

struct ActiveTask {
    task_id: String,
    inbox: mpsc::UnboundedSender<TaskMessage>,
    retire: CancellationToken,
    finished: CancellationToken,
    handle: JoinHandle<()>,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn TaskBackend>,
        config: OrchestratorConfig,
        refresh: RefreshHook,
    ) -> Self {
        let (view, _) = watch::channel(TaskView::default());
        Self {
            inner: Arc::new(Inner {
                launcher: TaskLauncher::new(backend.clone()),
                backend,
                config,
                view,
                refresh,
                active: Mutex::new(None),
            }),
        }
    }

    pub fn snapshot(&self) -> TaskView {
        self.inner.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<TaskView> {
        self.inner.view.subscribe()
    }

    /// 启动资源更新任务
    ///
    /// 启动失败时当前任务保持不变; 成功后先让旧任务退役, 再开始跟踪新任务。
    pub async fn start(&self, params: ResourceUpdateParams) -> Result<String, TaskError> {
        let task_id = self.inner.launcher.launch(&params).await?;

        let mut active = self.inner.active.lock().await;
        retire(&mut active).await;

        let machine = TaskMachine::streaming(Task::new(&task_id), self.inner.config.max_reattach);
        *active = Some(self.spawn_runner(machine));
        Ok(task_id)
    }

    /// 上传安装包, 需要自动重启时直接进入重启探测
    pub async fn install(&self, upload: PackageUpload) -> Result<InstallResponse, TaskError> {
        let file_name = upload.file_name.clone();
        let response = self.inner.backend.install_package(upload).await?;
        info!(
            "📦 安装包 {} 已上传: need_restart={}, auto_restart={}",
            file_name, response.need_restart, response.auto_restart
        );

        let mut active = self.inner.active.lock().await;
        retire(&mut active).await;

        let task = Task::new(format!("install-{}", Utc::now().timestamp_millis()));
        let machine = TaskMachine::from_install(task, &response);
        *active = Some(self.spawn_runner(machine));
        Ok(response)
    }

    /// 取消当前任务, 本地状态立即变为已取消, 不等待服务端确认
    ///
    /// 任务在取消消息被处理前已经自行结束时返回 `NoActiveTask`。
    pub async fn cancel(&self) -> Result<(), TaskError> {
        let mut active = self.inner.active.lock().await;
        let Some(current) = active.as_ref() else {
            return Err(TaskError::NoActiveTask);
        };
        if self.snapshot().is_settled() || current.inbox.send(TaskMessage::Cancel).is_err() {
            return Err(TaskError::NoActiveTask);
        }

        if let Some(current) = active.take() {
            let _ = current.handle.await;
        }

        match self.snapshot().notice {
            Some(Outcome::Cancelled | Outcome::Dismissed) => Ok(()),
            _ => Err(TaskError::NoActiveTask),
        }
    }

    /// 等待当前任务彻底结束 (包括刷新回调)
    #[allow(dead_code)]
    pub async fn wait_finished(&self) {
        let finished = match self.inner.active.lock().await.as_ref() {
            Some(active) => active.finished.clone(),
            None => return,
        };
        finished.cancelled().await;
    }

    /// 等待当前视图进入结束状态
    #[allow(dead_code)]
    pub async fn settled(&self) -> TaskView {
        let mut rx = self.inner.view.subscribe();
        loop {
            let view = rx.borrow_and_update().clone();
            if view.is_settled() {
                return view;
            }
            if rx.changed().await.is_err() {
                return view;
            }
        }
    }

    /// 让当前任务退役并清空视图
    pub async fn clear(&self) {
        let mut active = self.inner.active.lock().await;
        retire(&mut active).await;
        self.inner.view.send_replace(TaskView::default());
    }

    fn spawn_runner(&self, mut machine: TaskMachine) -> ActiveTask {
        let (outbox, inbox) = mpsc::unbounded_channel();
        let retire = CancellationToken::new();
        let finished = CancellationToken::new();
        let task_id = machine.task().id.clone();

        let effects = machine.begin();
        self.inner.view.send_replace(machine.view());

        let runner = TaskRunner {
            machine,
            backend: self.inner.backend.clone(),
            launcher: self.inner.launcher.clone(),
            config: self.inner.config.clone(),
            view: self.inner.view.clone(),
            refresh: self.inner.refresh.clone(),
            retire: retire.clone(),
            inbox,
            outbox: outbox.clone(),
            source: None,
        };
        let guard = finished.clone().drop_guard();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            runner.run(effects).await;
        });

        ActiveTask {
            task_id,
            inbox: outbox,
            retire,
            finished,
            handle,
        }
    }
}

async fn retire(active: &mut Option<ActiveTask>) {
    if let Some(previous) = active.take() {
        debug!("任务 {} 退役", previous.task_id);
        previous.retire.cancel();
        let _ = previous.handle.await;
    }
}

struct Source {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct TaskRunner {
    machine: TaskMachine,
    backend: Arc<dyn TaskBackend>,
    launcher: TaskLauncher,
    config: OrchestratorConfig,
    view: watch::Sender<TaskView>,
    refresh: RefreshHook,
    retire: CancellationToken,
    inbox: mpsc::UnboundedReceiver<TaskMessage>,
    outbox: mpsc::UnboundedSender<TaskMessage>,
    source: Option<Source>,
}

impl TaskRunner {
    async fn run(mut self, initial: Vec<Effect>) {
        if let Some(outcome) = self.execute(initial).await {
            self.finish(outcome).await;
            return;
        }

        loop {
            let message = tokio::select! {
                biased;
                _ = self.retire.cancelled() => {
                    self.stop_source().await;
                    debug!("任务 {} 已被替换", self.machine.task().id);
                    return;
                }
                message = self.inbox.recv() => match message {
                    Some(message) => message,
                    None => return,
                },
            };

            let effects = self.machine.apply(message);
            self.publish();
            if let Some(outcome) = self.execute(effects).await {
                self.finish(outcome).await;
                return;
            }
        }
    }

    fn publish(&self) {
        if !self.retire.is_cancelled() {
            self.view.send_replace(self.machine.view());
        }
    }

    async fn execute(&mut self, effects: Vec<Effect>) -> Option<Outcome> {
        let mut settled = None;
        for effect in effects {
            match effect {
                Effect::Subscribe => {
                    let backend = self.backend.clone();
                    let task_id = self.machine.task().id.clone();
                    let idle_timeout = self.config.stream_idle_timeout;
                    self.start_source(move |cancel, outbox| {
                        run_subscriber(backend, task_id, outbox, cancel, idle_timeout)
                    })
                    .await;
                }
                Effect::CloseStream => self.stop_source().await,
                Effect::QueryFallback => {
                    let poller = FallbackPoller::new(self.backend.clone());
                    let task_id = self.machine.task().id.clone();
                    self.start_source(move |cancel, outbox| async move {
                        poller.query_once(&task_id, &outbox, &cancel).await;
                    })
                    .await;
                }
                Effect::StartGrace => {
                    let grace = self.config.degraded_grace;
                    self.start_source(move |cancel, outbox| async move {
                        if sleep_or_cancel(grace, &cancel).await {
                            let _ = outbox.send(TaskMessage::GraceElapsed);
                        }
                    })
                    .await;
                }
                Effect::StartProbe => {
                    let prober = RestartProber::new(self.backend.clone(), self.config.probe.clone());
                    self.start_source(move |cancel, outbox| async move {
                        let progress = outbox.clone();
                        let outcome = prober
                            .run(cancel.clone(), move |state| {
                                let _ = progress.send(TaskMessage::Probe(state));
                            })
                            .await;
                        if !cancel.is_cancelled() {
                            let _ = outbox.send(TaskMessage::ProbeResolved(outcome));
                        }
                    })
                    .await;
                }
                Effect::RemoteCancel => {
                    // 不等待服务端响应
                    let _ = self.launcher.cancel(&self.machine.task().id);
                }
                Effect::Settle(outcome) => {
                    self.stop_source().await;
                    settled = Some(outcome);
                }
            }
        }
        settled
    }

    /// 启动新的消息来源, 先停掉旧的
    async fn start_source<F, Fut>(&mut self, make: F)
    where
        F: FnOnce(CancellationToken, mpsc::UnboundedSender<TaskMessage>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.stop_source().await;
        let cancel = self.retire.child_token();
        let handle = tokio::spawn(make(cancel.clone(), self.outbox.clone()));
        self.source = Some(Source { cancel, handle });
    }

    async fn stop_source(&mut self) {
        if let Some(source) = self.source.take() {
            source.cancel.cancel();
            let _ = source.handle.await;
        }
    }

    /// 展示最终消息, 片刻后触发刷新
    async fn finish(self, outcome: Outcome) {
        let task = self.machine.task();
        info!(
            "任务 {} 结束: {:?} (兜底查询 {} 次, 重启探测 {} 次)",
            task.id,
            outcome,
            self.machine.fallback_queries(),
            self.machine.probes_started()
        );
        if !outcome.triggers_refresh() {
            return;
        }
        if sleep_or_cancel(self.config.refresh_delay, &self.retire).await {
            debug!("🔃 触发数据刷新 ({})", task.id);
            (self.refresh)(task);
        }
    }
}
