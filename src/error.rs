//! 错误类型定义
//!
//! 核心各组件返回的类型化错误，以及暴露给调用方的稳定错误码。
//! 错误码是对外契约的一部分，适配层据此映射 HTTP 状态与重试提示。

use serde_json::json;

use crate::session::signal::ClientEvent;
use crate::store::StoreError;

/// 准入核心的统一错误类型
///
/// 四类错误的归属见各变体注释：
/// - 调用方错误（4xx，不重试）
/// - 准入拒绝（429/409）
/// - 超时（503/504）
/// - 后端故障（fail-closed）
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdmissionError {
    /// 等待队列已满，立即拒绝（含 queue_size=0 的零容忍场景）
    #[error("queue is full on {resource_id}: {current_waiting}/{max_queue_size} waiting")]
    QueueFull {
        resource_id: String,
        current_waiting: u64,
        max_queue_size: u64,
    },

    /// 入队后在 queue_wait_seconds 内未获准入
    #[error("timed out after {timeout_secs}s waiting in queue for {resource_id}")]
    QueueWaitTimeout {
        resource_id: String,
        timeout_secs: u64,
    },

    /// 已准入但执行超过 execution_seconds
    #[error("execution exceeded {timeout_secs}s on {resource_id}")]
    ExecutionTimeout {
        resource_id: String,
        timeout_secs: u64,
    },

    /// 客户端在准入前或执行中断开
    #[error("client disconnected ({event})")]
    ClientDisconnected { event: ClientEvent },

    /// 滑动窗口内去重会话数已达上限
    #[error("session limit exceeded: {current}/{max} active sessions in {window_seconds}s window")]
    SessionLimitExceeded {
        current: u64,
        max: u64,
        window_seconds: u64,
    },

    /// 独占账号只服务自己已持有的会话或全新会话
    #[error("exclusive accounts only serve sessions they already own or brand-new sessions")]
    SessionNotNew,

    /// 消息历史与已记录的会话摘要无公共前缀
    #[error("session content does not match recorded history")]
    SessionContentMismatch,

    /// 非法追加：一次只允许追加一条新消息
    #[error("illegal append: only a single new message may be appended")]
    SessionAppendViolation,

    /// 非法回滚：历史只能截断到用户轮
    #[error("illegal rollback: history may only be truncated at a user turn")]
    SessionRollbackViolation,

    /// 非法分叉：只能在用户轮之后重新生成
    #[error("illegal branch: history may only diverge after a user turn")]
    SessionBranchViolation,

    /// 调用方错误：资源 id 为空或非法
    #[error("invalid resource id: {0}")]
    InvalidResourceId(String),

    /// 调用方错误：账号 id 为空或候选列表不可用
    #[error("invalid account id: {0}")]
    InvalidAccountId(String),

    /// 调用方错误：限流配置无法解析
    #[error("invalid config parameters: {0}")]
    InvalidConfig(String),

    /// KV 后端不可用；acquire/admit 路径一律 fail-closed
    #[error(transparent)]
    Backend(#[from] StoreError),
}

impl AdmissionError {
    /// 稳定错误码（wire code）
    pub fn code(&self) -> &'static str {
        match self {
            Self::QueueFull { .. } => "QUEUE_FULL",
            Self::QueueWaitTimeout { .. } | Self::ExecutionTimeout { .. } => "TIMEOUT",
            Self::ClientDisconnected { .. } => "CLIENT_DISCONNECTED",
            Self::SessionLimitExceeded { .. } => "SESSION_LIMIT_EXCEEDED",
            Self::SessionNotNew => "SESSION_NOT_NEW",
            Self::SessionContentMismatch => "SESSION_CONTENT_MISMATCH",
            Self::SessionAppendViolation => "SESSION_APPEND_VIOLATION",
            Self::SessionRollbackViolation => "SESSION_ROLLBACK_VIOLATION",
            Self::SessionBranchViolation => "SESSION_BRANCH_VIOLATION",
            Self::InvalidResourceId(_) => "INVALID_RESOURCE_ID",
            Self::InvalidAccountId(_) => "INVALID_ACCOUNT_ID",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::Backend(_) => "BACKEND_UNAVAILABLE",
        }
    }

    /// 建议的 HTTP 状态码（适配层可覆盖）
    pub fn status_hint(&self) -> u16 {
        match self {
            Self::QueueFull { .. } | Self::SessionLimitExceeded { .. } => 429,
            Self::SessionNotNew
            | Self::SessionContentMismatch
            | Self::SessionAppendViolation
            | Self::SessionRollbackViolation
            | Self::SessionBranchViolation => 409,
            Self::QueueWaitTimeout { .. } => 503,
            Self::ExecutionTimeout { .. } => 504,
            Self::ClientDisconnected { .. } => 499,
            Self::InvalidResourceId(_) | Self::InvalidAccountId(_) | Self::InvalidConfig(_) => 400,
            Self::Backend(_) => 503,
        }
    }

    /// 结构化错误详情，字段随错误码稳定
    ///
    /// # 返回
    /// 适配层可直接序列化进响应体的 JSON 对象
    pub fn details(&self) -> serde_json::Value {
        match self {
            Self::QueueFull {
                resource_id,
                current_waiting,
                max_queue_size,
            } => json!({
                "error": self.code(),
                "resourceId": resource_id,
                "currentWaiting": current_waiting,
                "maxQueueSize": max_queue_size,
            }),
            Self::QueueWaitTimeout {
                resource_id,
                timeout_secs,
            } => json!({
                "error": self.code(),
                "resourceId": resource_id,
                "timeout": timeout_secs,
                "timeoutMs": timeout_secs * 1000,
                "timeoutType": "queue",
            }),
            Self::ExecutionTimeout {
                resource_id,
                timeout_secs,
            } => json!({
                "error": self.code(),
                "resourceId": resource_id,
                "timeout": timeout_secs,
                "timeoutMs": timeout_secs * 1000,
                "timeoutType": "execution",
            }),
            Self::SessionLimitExceeded {
                current,
                max,
                window_seconds,
            } => json!({
                "error": self.code(),
                "current": current,
                "max": max,
                "windowSeconds": window_seconds,
            }),
            other => json!({
                "error": other.code(),
                "message": other.to_string(),
            }),
        }
    }
}
