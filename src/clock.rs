//! 可取消的周期计时器
//!
//! 所有轮询循环共用。时间取自 `tokio::time`, 测试里可以暂停/快进时钟,
//! 超时行为因此是确定的。

use std::time::Duration;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub struct Ticker {
    interval: Interval,
    started: Instant,
    cancel: CancellationToken,
}

impl Ticker {
    /// 第一次 tick 在 `period` 之后
    pub fn new(period: Duration, cancel: CancellationToken) -> Self {
        Self {
            interval: Self::interval(period),
            started: Instant::now(),
            cancel,
        }
    }

    fn interval(period: Duration) -> Interval {
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    }

    /// 切换周期, 已流逝时间不清零
    pub fn set_period(&mut self, period: Duration) {
        self.interval = Self::interval(period);
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// 等待下一次 tick, 返回累计流逝时间; 被取消时返回 None
    pub async fn tick(&mut self) -> Option<Duration> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            _ = self.interval.tick() => Some(self.elapsed()),
        }
    }
}

/// 睡眠一段时间, 被取消时提前返回 false
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = time::sleep(duration) => true,
    }
}
