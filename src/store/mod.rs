//! KV 存储抽象
//!
//! 核心所有跨进程状态（限流计数、会话窗口、摘要、粘性绑定）都放在
//! 后端 KV 存储里，进程内不持有远端键的所有权。trait 暴露核心消费的
//! 类型化操作，外加三个原子复合操作：脚本型后端把它们实现为单条
//! 服务端脚本，内置的内存后端在键级入口锁下执行，原子性等价。
//!
//! 存储客户端不是缓存：错误从不伪装成成功，后端不可达一律上浮
//! [`StoreError::Unavailable`]，由调用方决定 fail-closed 行为。

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use std::time::Duration;

/// 存储层错误
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// 后端在重试预算内不可达
    #[error("kv backend unavailable: {0}")]
    Unavailable(String),
    /// 键已存在且类型不符
    #[error("wrong value type for key {key}")]
    WrongType { key: String },
}

/// §4.C 原子准入脚本的返回
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAdmitOutcome {
    /// 指纹已在窗口内，仅刷新活跃时间
    Existing { current: u64 },
    /// 新指纹被接纳
    Added { current: u64 },
    /// 窗口内去重会话数已达上限
    Rejected { current: u64 },
}

/// 核心消费的 KV 操作集
///
/// 所有方法都可被取消（调用方用 `select!` 包裹即可），实现方不得
/// 在错误时返回部分成功。
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;
    async fn del(&self, key: &str) -> Result<bool, StoreError>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;
    /// 剩余 TTL；键不存在或无 TTL 时返回 None
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;
    async fn decr(&self, key: &str) -> Result<i64, StoreError>;

    /// 返回 true 表示新成员，false 表示仅更新了分值
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool, StoreError>;
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError>;
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError>;
    async fn zcard(&self, key: &str) -> Result<u64, StoreError>;
    /// 按分值升序返回全部成员
    async fn zrange(&self, key: &str) -> Result<Vec<(String, f64)>, StoreError>;
    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError>;

    /// 会话滑动窗口原子准入
    ///
    /// 等价脚本：已存在则刷新分值；否则清掉窗口外成员后计数，
    /// 达到上限拒绝，未达上限插入。任何分支都会刷新键 TTL。
    /// 返回时保证 `zcard(key) <= max_sessions`。
    async fn admit_session(
        &self,
        key: &str,
        fingerprint: &str,
        now_ms: i64,
        window: Duration,
        max_sessions: u64,
    ) -> Result<SessionAdmitOutcome, StoreError>;

    /// 并发槽位原子抢占
    ///
    /// 清掉租约已过期的成员后，当未过期成员数小于 `max` 时把
    /// `member` 以 `now_ms + lease` 为分值写入并返回 true。
    async fn try_acquire_slot(
        &self,
        key: &str,
        member: &str,
        max: u64,
        lease: Duration,
        now_ms: i64,
    ) -> Result<bool, StoreError>;

    /// 等待计数原子自增并刷新空闲 TTL，返回自增后的值
    async fn enter_queue(&self, key: &str, idle_ttl: Duration) -> Result<i64, StoreError>;
}

/// 测试用：所有操作都返回 Unavailable 的后端，
/// 用于验证 acquire/admit 的 fail-closed 行为。
#[cfg(test)]
pub(crate) struct UnavailableStore;

#[cfg(test)]
#[async_trait]
impl KvStore for UnavailableStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    async fn set(&self, _: &str, _: &str, _: Option<Duration>) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    async fn del(&self, _: &str) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    async fn expire(&self, _: &str, _: Duration) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    async fn ttl(&self, _: &str) -> Result<Option<Duration>, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    async fn incr(&self, _: &str) -> Result<i64, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    async fn decr(&self, _: &str) -> Result<i64, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    async fn zadd(&self, _: &str, _: &str, _: f64) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    async fn zrem(&self, _: &str, _: &str) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    async fn zscore(&self, _: &str, _: &str) -> Result<Option<f64>, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    async fn zcard(&self, _: &str) -> Result<u64, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    async fn zrange(&self, _: &str) -> Result<Vec<(String, f64)>, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    async fn zremrangebyscore(&self, _: &str, _: f64, _: f64) -> Result<u64, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    async fn admit_session(
        &self,
        _: &str,
        _: &str,
        _: i64,
        _: Duration,
        _: u64,
    ) -> Result<SessionAdmitOutcome, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    async fn try_acquire_slot(
        &self,
        _: &str,
        _: &str,
        _: u64,
        _: Duration,
        _: i64,
    ) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    async fn enter_queue(&self, _: &str, _: Duration) -> Result<i64, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
}
