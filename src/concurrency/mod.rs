//! 并发限流模块
//!
//! 按资源（API Key 或上游账号）的分布式信号量：有界等待队列、
//! 等待超时、执行超时、客户端断开自动释放、配置热更。注册表是
//! 进程内限流器的唯一属主。

mod handle;
mod limiter;
mod registry;
mod settings;

pub use handle::{ConcurrencyHandle, ReleaseReason};
pub use limiter::{LimiterState, ResourceLimiter, StatsSnapshot};
pub use registry::LimiterRegistry;
pub use settings::{LimiterSettings, RECOGNIZED_SERVICES};
