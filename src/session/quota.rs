//! 会话配额管理器
//!
//! 按账号维护滑动窗口内的去重会话指纹集合，窗口内去重会话数
//! 不得超过上限。检查与准入必须是单次原子操作，否则两个并发
//! 调用都可能观察到 `n < max` 并双双插入。

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::AdmissionError;
use crate::store::{KvStore, SessionAdmitOutcome};

/// 会话配额配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionQuotaConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: u64,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
}

impl Default for SessionQuotaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_sessions: default_max_sessions(),
            window_seconds: default_window_seconds(),
        }
    }
}

impl SessionQuotaConfig {
    /// 钳位：`maxSessions ≥ 1`，`windowSeconds ≥ 60`
    pub fn normalized(&self) -> Self {
        Self {
            enabled: self.enabled,
            max_sessions: self.max_sessions.max(1),
            window_seconds: self.window_seconds.max(60),
        }
    }
}

fn default_max_sessions() -> u64 {
    5
}

fn default_window_seconds() -> u64 {
    3600
}

/// 准入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    /// 指纹已计入窗口（新增或刷新）
    Admitted {
        current: u64,
        max: u64,
        window_seconds: u64,
    },
    /// 配额关闭或指纹为空，未做检查
    Skipped,
}

pub struct SessionQuotaManager {
    store: Arc<dyn KvStore>,
}

impl SessionQuotaManager {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn quota_key(account_id: &str) -> String {
        format!("session_concurrency:{}", account_id)
    }

    /// 把会话指纹计入账号的滑动窗口
    ///
    /// 后端错误原样上浮，由调用方决定准入（核心不 fail-open）。
    pub async fn admit(
        &self,
        account_id: &str,
        fingerprint: &str,
        config: &SessionQuotaConfig,
    ) -> Result<QuotaDecision, AdmissionError> {
        if !config.enabled || fingerprint.is_empty() {
            return Ok(QuotaDecision::Skipped);
        }
        let config = config.normalized();
        let key = Self::quota_key(account_id);
        let window = Duration::from_secs(config.window_seconds);

        let outcome = self
            .store
            .admit_session(
                &key,
                fingerprint,
                Utc::now().timestamp_millis(),
                window,
                config.max_sessions,
            )
            .await?;

        match outcome {
            SessionAdmitOutcome::Existing { current } => {
                tracing::debug!(
                    "[SessionQuota] {} 刷新已有会话 {} ({}/{})",
                    account_id,
                    fingerprint,
                    current,
                    config.max_sessions
                );
                Ok(QuotaDecision::Admitted {
                    current,
                    max: config.max_sessions,
                    window_seconds: config.window_seconds,
                })
            }
            SessionAdmitOutcome::Added { current } => {
                tracing::debug!(
                    "[SessionQuota] {} 接纳新会话 {} ({}/{})",
                    account_id,
                    fingerprint,
                    current,
                    config.max_sessions
                );
                Ok(QuotaDecision::Admitted {
                    current,
                    max: config.max_sessions,
                    window_seconds: config.window_seconds,
                })
            }
            SessionAdmitOutcome::Rejected { current } => {
                tracing::warn!(
                    "[SessionQuota] {} 会话数达到上限 ({}/{})，拒绝 {}",
                    account_id,
                    current,
                    config.max_sessions,
                    fingerprint
                );
                Err(AdmissionError::SessionLimitExceeded {
                    current,
                    max: config.max_sessions,
                    window_seconds: config.window_seconds,
                })
            }
        }
    }

    /// 窗口内活跃会话数（统计接口）
    pub async fn active_sessions(&self, account_id: &str) -> Result<u64, AdmissionError> {
        Ok(self.store.zcard(&Self::quota_key(account_id)).await?)
    }
}
