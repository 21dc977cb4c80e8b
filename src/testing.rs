//! 测试用的脚本化服务端

use crate::backend::{EventStream, Liveness, TaskBackend};
use crate::error::{TaskError, TransportError};
use crate::types::{CachedStatus, InstallResponse, PackageUpload, ProgressEvent, ResourceUpdateParams};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

pub type StreamScript = mpsc::UnboundedSender<Result<ProgressEvent, TransportError>>;
type ScriptReceiver = mpsc::UnboundedReceiver<Result<ProgressEvent, TransportError>>;

#[derive(Default)]
pub struct FakeBackend {
    next_id: AtomicUsize,
    launch_error: Mutex<Option<TaskError>>,
    streams: Mutex<HashMap<String, VecDeque<ScriptReceiver>>>,
    cached: Mutex<HashMap<String, Result<CachedStatus, TransportError>>>,
    liveness_script: Mutex<VecDeque<bool>>,
    liveness_after_script: AtomicBool,
    install: Mutex<Option<InstallResponse>>,
    /// 取消请求永不返回
    pub hang_cancel: AtomicBool,
    /// 订阅请求永不返回
    pub hang_subscribe: AtomicBool,
    pub launches: AtomicUsize,
    pub subscribes: AtomicUsize,
    pub cancels: AtomicUsize,
    pub cancels_completed: AtomicUsize,
    pub status_queries: AtomicUsize,
    pub liveness_checks: AtomicUsize,
}

impl FakeBackend {
    /// 预先准备某个任务的推送内容, 多次调用对应多次订阅
    pub fn script_stream(&self, task_id: &str) -> StreamScript {
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams
            .lock()
            .unwrap()
            .entry(task_id.to_string())
            .or_default()
            .push_back(rx);
        tx
    }

    pub fn set_cached(&self, task_id: &str, result: Result<CachedStatus, TransportError>) {
        self.cached.lock().unwrap().insert(task_id.to_string(), result);
    }

    pub fn fail_launch(&self, error: TaskError) {
        *self.launch_error.lock().unwrap() = Some(error);
    }

    /// 依次返回脚本中的结果, 用完后一直返回 `then`
    pub fn script_liveness(&self, script: &[bool], then: bool) {
        *self.liveness_script.lock().unwrap() = script.iter().copied().collect();
        self.liveness_after_script.store(then, Ordering::SeqCst);
    }

    pub fn set_install_response(&self, response: InstallResponse) {
        *self.install.lock().unwrap() = Some(response);
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Liveness for FakeBackend {
    async fn is_up(&self) -> bool {
        self.liveness_checks.fetch_add(1, Ordering::SeqCst);
        self.liveness_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.liveness_after_script.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl TaskBackend for FakeBackend {
    async fn launch(&self, _params: &ResourceUpdateParams) -> Result<String, TaskError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.launch_error.lock().unwrap().take() {
            return Err(error);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("task-{}", id))
    }

    async fn cancel(&self, _task_id: &str) -> Result<(), TransportError> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        if self.hang_cancel.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        self.cancels_completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, task_id: &str) -> Result<EventStream, TransportError> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        if self.hang_subscribe.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        let next = self
            .streams
            .lock()
            .unwrap()
            .get_mut(task_id)
            .and_then(VecDeque::pop_front);
        match next {
            Some(rx) => Ok(UnboundedReceiverStream::new(rx).boxed()),
            None => Err(TransportError::RequestFailed(format!(
                "no stream scripted for {}",
                task_id
            ))),
        }
    }

    async fn cached_status(&self, task_id: &str) -> Result<CachedStatus, TransportError> {
        self.status_queries.fetch_add(1, Ordering::SeqCst);
        self.cached
            .lock()
            .unwrap()
            .get(task_id)
            .cloned()
            .unwrap_or_else(|| Ok(CachedStatus::not_found()))
    }

    async fn install_package(&self, _upload: PackageUpload) -> Result<InstallResponse, TaskError> {
        Ok(self.install.lock().unwrap().clone().unwrap_or_default())
    }
}
