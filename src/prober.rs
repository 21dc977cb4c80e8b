//! 重启就绪探测
//!
//! 两阶段有界轮询, 共用一个总预算:
//! - 阶段 A (等待下线): 每秒检查一次存活接口, 一旦失败进入阶段 B;
//!   整个窗口内都正常也进入阶段 B, 重启可能快到观察不到下线。
//!   这是一个经验假设, 并不是重启完成的可靠信号。
//! - 阶段 B (等待上线): 每两秒检查一次, 第一次正常即确认重启完成。
//!
//! 预算耗尽返回 `Timeout`, 它不代表任务失败。

use crate::backend::Liveness;
use crate::clock::Ticker;
use crate::config::ProbeConfig;
use crate::types::{ProbePhase, RestartProbeState};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ready { elapsed: Duration },
    Timeout { elapsed: Duration },
    Cancelled,
}

pub struct RestartProber<L: ?Sized> {
    liveness: Arc<L>,
    config: ProbeConfig,
}

impl<L: Liveness + ?Sized> RestartProber<L> {
    pub fn new(liveness: Arc<L>, config: ProbeConfig) -> Self {
        Self { liveness, config }
    }

    /// 显示进度: min(elapsed / B, 阶段上限)
    pub fn state(&self, phase: ProbePhase, elapsed: Duration) -> RestartProbeState {
        let budget = self.config.budget.as_secs_f64().max(f64::EPSILON);
        let cap = match phase {
            ProbePhase::AwaitingDown => self.config.down_cap,
            ProbePhase::AwaitingUp => self.config.up_cap,
        };
        let ratio = (elapsed.as_secs_f64() / budget).min(cap).clamp(0.0, 1.0);
        RestartProbeState {
            phase,
            elapsed_seconds: elapsed.as_secs(),
            budget_seconds: self.config.budget.as_secs(),
            percent: (ratio * 100.0).floor() as u8,
        }
    }

    /// 运行到确认、超时或被取消
    ///
    /// 取消后不再发起任何请求, 也不再调用 `report`。
    pub async fn run<F>(&self, cancel: CancellationToken, mut report: F) -> ProbeOutcome
    where
        F: FnMut(RestartProbeState) + Send,
    {
        let budget = self.config.budget;
        let mut ticker = Ticker::new(self.config.down_interval, cancel.clone());
        let mut phase = ProbePhase::AwaitingDown;

        info!("⏳ 等待服务重启 (预算 {}s)", budget.as_secs());
        report(self.state(phase, Duration::ZERO));

        loop {
            let elapsed = ticker.elapsed();
            if elapsed >= budget {
                warn!("⚠️ 等待服务重启超时 ({}s)", elapsed.as_secs());
                return ProbeOutcome::Timeout { elapsed };
            }

            if phase == ProbePhase::AwaitingDown && elapsed >= self.config.down_window {
                info!("阶段 A 内未观察到服务下线, 按已重启处理");
                phase = self.enter_awaiting_up(&mut ticker, &mut report);
            }

            let up = tokio::select! {
                biased;
                _ = cancel.cancelled() => return ProbeOutcome::Cancelled,
                up = tokio::time::timeout(budget - elapsed, self.liveness.is_up()) => up,
            };
            let Ok(up) = up else {
                let elapsed = ticker.elapsed();
                warn!("⚠️ 等待服务重启超时 ({}s)", elapsed.as_secs());
                return ProbeOutcome::Timeout { elapsed };
            };
            debug!("存活检查: {} ({:?})", up, phase);

            match phase {
                ProbePhase::AwaitingDown if !up => {
                    info!("🔻 服务已下线, 等待重新上线");
                    phase = self.enter_awaiting_up(&mut ticker, &mut report);
                }
                ProbePhase::AwaitingUp if up => {
                    let elapsed = ticker.elapsed();
                    info!("✅ 服务已重新上线 ({}s)", elapsed.as_secs());
                    return ProbeOutcome::Ready { elapsed };
                }
                _ => report(self.state(phase, ticker.elapsed())),
            }

            if ticker.tick().await.is_none() {
                return ProbeOutcome::Cancelled;
            }
        }
    }

    fn enter_awaiting_up<F>(&self, ticker: &mut Ticker, report: &mut F) -> ProbePhase
    where
        F: FnMut(RestartProbeState),
    {
        ticker.set_period(self.config.up_interval);
        report(self.state(ProbePhase::AwaitingUp, ticker.elapsed()));
        ProbePhase::AwaitingUp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;
    use std::sync::Mutex;

    fn prober(backend: &Arc<FakeBackend>) -> RestartProber<FakeBackend> {
        RestartProber::new(backend.clone(), ProbeConfig::default())
    }

    async fn run_collecting(
        prober: &RestartProber<FakeBackend>,
        cancel: CancellationToken,
    ) -> (ProbeOutcome, Vec<RestartProbeState>) {
        let states = Mutex::new(Vec::new());
        let outcome = prober
            .run(cancel, |state| states.lock().unwrap().push(state))
            .await;
        (outcome, states.into_inner().unwrap())
    }

    fn assert_phases_monotonic(states: &[RestartProbeState]) {
        let first_up = states
            .iter()
            .position(|s| s.phase == ProbePhase::AwaitingUp)
            .unwrap_or(states.len());
        assert!(states[first_up..]
            .iter()
            .all(|s| s.phase == ProbePhase::AwaitingUp));
    }

    #[tokio::test(start_paused = true)]
    async fn downtime_then_recovery_confirms_restart() {
        let backend = Arc::new(FakeBackend::default());
        backend.script_liveness(&[false, false, false, false, false], true);

        let (outcome, states) = run_collecting(&prober(&backend), CancellationToken::new()).await;

        // 阶段 A 第一次就失败, 之后阶段 B 每 2 秒一次, 第 6 次成功
        assert_eq!(
            outcome,
            ProbeOutcome::Ready {
                elapsed: Duration::from_secs(10)
            }
        );
        assert_eq!(FakeBackend::count(&backend.liveness_checks), 6);
        assert_phases_monotonic(&states);
        assert!(states.iter().all(|s| s.percent < 100));
    }

    #[tokio::test(start_paused = true)]
    async fn unobserved_downtime_still_advances_after_window() {
        let backend = Arc::new(FakeBackend::default());
        backend.script_liveness(&[], true);

        let (outcome, states) = run_collecting(&prober(&backend), CancellationToken::new()).await;

        assert_eq!(
            outcome,
            ProbeOutcome::Ready {
                elapsed: Duration::from_secs(30)
            }
        );
        let switch = states
            .iter()
            .find(|s| s.phase == ProbePhase::AwaitingUp)
            .unwrap();
        assert!(switch.elapsed_seconds <= 30);
        assert_phases_monotonic(&states);
    }

    #[tokio::test(start_paused = true)]
    async fn never_coming_back_times_out() {
        let backend = Arc::new(FakeBackend::default());
        backend.script_liveness(&[], false);

        let (outcome, states) = run_collecting(&prober(&backend), CancellationToken::new()).await;

        assert_eq!(
            outcome,
            ProbeOutcome::Timeout {
                elapsed: Duration::from_secs(120)
            }
        );
        let last = states.last().unwrap();
        assert_eq!(last.phase, ProbePhase::AwaitingUp);
        assert!(last.percent <= 95);
        assert_phases_monotonic(&states);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_further_checks() {
        let backend = Arc::new(FakeBackend::default());
        backend.script_liveness(&[], true);
        let cancel = CancellationToken::new();

        let handle = {
            let backend = backend.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                RestartProber::new(backend, ProbeConfig::default())
                    .run(cancel, |_| {})
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(4500)).await;
        cancel.cancel();
        let checks = FakeBackend::count(&backend.liveness_checks);
        assert_eq!(handle.await.unwrap(), ProbeOutcome::Cancelled);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(FakeBackend::count(&backend.liveness_checks), checks);
        assert_eq!(checks, 5);
    }

    #[test]
    fn displayed_progress_is_capped_per_phase() {
        let backend = Arc::new(FakeBackend::default());
        let prober = prober(&backend);

        let early = prober.state(ProbePhase::AwaitingDown, Duration::from_secs(12));
        assert_eq!(early.percent, 10);
        let late_a = prober.state(ProbePhase::AwaitingDown, Duration::from_secs(100));
        assert_eq!(late_a.percent, 30);
        let late_b = prober.state(ProbePhase::AwaitingUp, Duration::from_secs(119));
        assert_eq!(late_b.percent, 95);
        assert_eq!(late_b.budget_seconds, 120);
    }
}
