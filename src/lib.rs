//! relaygate — 多租户 LLM 代理的准入控制与会话亲和核心
//!
//! 对每个指向上游账号的对话补全请求，本 crate 负责回答四个问题：
//! - 是否允许占用一个并发槽位（按 API Key 与账号两级限流）
//! - 该账号在粘性会话与独占规则下是否有资格处理本次会话
//! - 消息历史是否为此前观测到的会话的合法延续（摘要哈希链）
//! - 请求结束（正常或异常）时如何把上述资源全部释放
//!
//! HTTP 传输、上游调用、账号目录持久化等都是外部协作方，
//! 本 crate 只通过 [`store::KvStore`] 与共享状态打交道。
//!
//! 入口是 [`session::SessionCoordinator`]：
//!
//! ```no_run
//! use std::sync::Arc;
//! use relaygate::config::CoreConfig;
//! use relaygate::session::{ClientSignal, SessionCoordinator};
//! use relaygate::store::MemoryStore;
//!
//! # async fn demo(request: relaygate::session::AdmissionRequest) {
//! let store = Arc::new(MemoryStore::new());
//! let coordinator = SessionCoordinator::new(store, CoreConfig::default());
//! let signal = ClientSignal::new();
//! match coordinator.admit(request, &signal).await {
//!     Ok(grant) => {
//!         // 调用上游……
//!         grant.release().await;
//!     }
//!     Err(e) => {
//!         tracing::warn!("[Coordinator] 准入被拒绝: {} ({})", e, e.code());
//!     }
//! }
//! # }
//! ```

pub mod concurrency;
pub mod config;
pub mod error;
pub mod models;
pub mod session;
pub mod store;

pub use error::AdmissionError;
pub use session::SessionCoordinator;

/// 测试日志初始化（use try_init to avoid panic if already set）
#[cfg(test)]
pub(crate) fn init_test_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("relaygate=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}
