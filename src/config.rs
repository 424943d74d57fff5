//! 核心配置
//!
//! 安装级默认值，按配置键分组：
//! - `defaults.concurrency.executionTimeout`（秒，默认 300）
//! - `concurrency.limiterCacheTtl`（毫秒，默认 1 800 000）
//! - `concurrency.sessionConfigCacheTtl`（毫秒）
//! - `session.stickyTtlHours`（默认 168）
//! - `session.renewalThresholdMinutes`
//!
//! 所有字段都有默认值，缺省配置可直接 `CoreConfig::default()` 使用。

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 核心配置根
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub defaults: InstallDefaults,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// 安装默认值
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallDefaults {
    #[serde(default)]
    pub concurrency: ConcurrencyDefaults,
}

/// 限流器缺省参数，账号配置缺字段时回退到这里
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyDefaults {
    /// 执行超时（秒），0 表示禁用
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout: u64,
    /// 队列等待超时（秒）
    #[serde(default = "default_queue_wait_seconds")]
    pub queue_wait_seconds: u64,
}

impl Default for ConcurrencyDefaults {
    fn default() -> Self {
        Self {
            execution_timeout: default_execution_timeout(),
            queue_wait_seconds: default_queue_wait_seconds(),
        }
    }
}

/// 限流器注册表参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyConfig {
    /// 注册表条目空闲多久后可被清理（毫秒）
    #[serde(default = "default_limiter_cache_ttl")]
    pub limiter_cache_ttl: u64,
    /// 归一化后的会话级限流配置缓存时长（毫秒）
    #[serde(default = "default_session_config_cache_ttl")]
    pub session_config_cache_ttl: u64,
    /// 注册表容量上限
    #[serde(default = "default_registry_capacity")]
    pub registry_capacity: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            limiter_cache_ttl: default_limiter_cache_ttl(),
            session_config_cache_ttl: default_session_config_cache_ttl(),
            registry_capacity: default_registry_capacity(),
        }
    }
}

impl ConcurrencyConfig {
    pub fn limiter_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.limiter_cache_ttl)
    }

    pub fn session_config_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.session_config_cache_ttl)
    }
}

/// 会话粘性参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// 粘性绑定 TTL（小时）
    #[serde(default = "default_sticky_ttl_hours")]
    pub sticky_ttl_hours: u64,
    /// 剩余 TTL 低于该阈值（分钟）时续期
    #[serde(default = "default_renewal_threshold_minutes")]
    pub renewal_threshold_minutes: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sticky_ttl_hours: default_sticky_ttl_hours(),
            renewal_threshold_minutes: default_renewal_threshold_minutes(),
        }
    }
}

impl SessionConfig {
    pub fn sticky_ttl(&self) -> Duration {
        Duration::from_secs(self.sticky_ttl_hours * 3600)
    }

    pub fn renewal_threshold(&self) -> Duration {
        Duration::from_secs(self.renewal_threshold_minutes * 60)
    }
}

fn default_execution_timeout() -> u64 {
    300
}

fn default_queue_wait_seconds() -> u64 {
    60
}

fn default_limiter_cache_ttl() -> u64 {
    1_800_000
}

fn default_session_config_cache_ttl() -> u64 {
    300_000
}

fn default_registry_capacity() -> usize {
    10_000
}

fn default_sticky_ttl_hours() -> u64 {
    168
}

fn default_renewal_threshold_minutes() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CoreConfig::default();
        assert_eq!(config.defaults.concurrency.execution_timeout, 300);
        assert_eq!(config.concurrency.limiter_cache_ttl, 1_800_000);
        assert_eq!(config.session.sticky_ttl_hours, 168);
        assert_eq!(config.session.sticky_ttl(), Duration::from_secs(168 * 3600));
    }

    #[test]
    fn test_partial_config_falls_back() {
        let config: CoreConfig = serde_json::from_str(
            r#"{"session": {"stickyTtlHours": 24}, "concurrency": {"limiterCacheTtl": 1000}}"#,
        )
        .unwrap();
        assert_eq!(config.session.sticky_ttl_hours, 24);
        assert_eq!(config.session.renewal_threshold_minutes, 60);
        assert_eq!(config.concurrency.limiter_cache_ttl, 1000);
        assert_eq!(config.concurrency.registry_capacity, 10_000);
    }
}
