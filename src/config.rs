//! 运行配置
//! 启动时从环境变量读取一次, 非法值回退到默认值

use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// 重启探测配置
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// 总预算 B
    pub budget: Duration,
    /// 阶段 A (等待下线) 最长时间
    pub down_window: Duration,
    pub down_interval: Duration,
    pub up_interval: Duration,
    /// 阶段 A/B 进度上限 (0.0 - 1.0)
    pub down_cap: f64,
    pub up_cap: f64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            budget: Duration::from_secs(120),
            down_window: Duration::from_secs(30),
            down_interval: Duration::from_secs(1),
            up_interval: Duration::from_secs(2),
            down_cap: 0.30,
            up_cap: 0.95,
        }
    }
}

/// 编排器配置
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// 推送流空闲超时, 超过即视为中断
    pub stream_idle_timeout: Duration,
    /// 状态未知时的宽限期
    pub degraded_grace: Duration,
    /// 最终消息展示多久后触发刷新
    pub refresh_delay: Duration,
    /// 服务端确认任务仍在运行时, 最多重新订阅几次
    pub max_reattach: u32,
    pub probe: ProbeConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stream_idle_timeout: Duration::from_secs(300),
            degraded_grace: Duration::from_secs(10),
            refresh_delay: Duration::from_millis(1500),
            max_reattach: 3,
            probe: ProbeConfig::default(),
        }
    }
}

/// 弹幕服务连接配置
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub base_url: String,
    pub liveness_path: String,
    pub liveness_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:7768".to_string(),
            liveness_path: "/health".to_string(),
            liveness_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub server: ServerConfig,
    pub orchestrator: OrchestratorConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let server_defaults = ServerConfig::default();
        let orch_defaults = OrchestratorConfig::default();
        let probe_defaults = ProbeConfig::default();

        let read = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let server = ServerConfig {
            base_url: read("DANMU_SERVER_URL").unwrap_or(server_defaults.base_url),
            liveness_path: read("LIVENESS_PATH").unwrap_or(server_defaults.liveness_path),
            liveness_timeout: secs(
                parse_or(&read, "LIVENESS_TIMEOUT_SECS", 3u64),
                server_defaults.liveness_timeout,
            ),
            request_timeout: secs(
                parse_or(&read, "REQUEST_TIMEOUT_SECS", 15u64),
                server_defaults.request_timeout,
            ),
        };

        let probe = ProbeConfig {
            budget: secs(
                parse_or(&read, "RESTART_BUDGET_SECS", 120u64),
                probe_defaults.budget,
            ),
            down_window: secs(
                parse_or(&read, "RESTART_DOWN_WINDOW_SECS", 30u64),
                probe_defaults.down_window,
            ),
            down_interval: millis(
                parse_or(&read, "RESTART_DOWN_INTERVAL_MS", 1000u64),
                probe_defaults.down_interval,
            ),
            up_interval: millis(
                parse_or(&read, "RESTART_UP_INTERVAL_MS", 2000u64),
                probe_defaults.up_interval,
            ),
            ..probe_defaults
        };

        let orchestrator = OrchestratorConfig {
            stream_idle_timeout: secs(
                parse_or(&read, "STREAM_IDLE_TIMEOUT_SECS", 300u64),
                orch_defaults.stream_idle_timeout,
            ),
            degraded_grace: secs(
                parse_or(&read, "DEGRADED_GRACE_SECS", 10u64),
                orch_defaults.degraded_grace,
            ),
            refresh_delay: Duration::from_millis(parse_or(&read, "REFRESH_DELAY_MS", 1500u64)),
            max_reattach: parse_or(&read, "MAX_REATTACH", orch_defaults.max_reattach),
            probe,
        };

        Self {
            port: parse_or(&read, "PORT", 3000u16),
            server,
            orchestrator,
        }
    }
}

fn parse_or<T: FromStr + Copy>(read: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match read(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("⚠️ 环境变量 {}={} 无法解析, 使用默认值", key, raw);
                default
            }
        },
        None => default,
    }
}

/// 零值时长没有意义, 回退默认
fn secs(value: u64, default: Duration) -> Duration {
    if value == 0 {
        default
    } else {
        Duration::from_secs(value)
    }
}

fn millis(value: u64, default: Duration) -> Duration {
    if value == 0 {
        default
    } else {
        Duration::from_millis(value)
    }
}
