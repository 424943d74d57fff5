//! 上游账号模型
//!
//! 账号目录由外部维护，核心只消费调度所需的字段。

use serde::{Deserialize, Serialize};

use crate::session::quota::SessionQuotaConfig;

/// 上游平台
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Claude,
    Gemini,
    Openai,
    Droid,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Gemini => "gemini",
            Self::Openai => "openai",
            Self::Droid => "droid",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(Self::Claude),
            "gemini" => Ok(Self::Gemini),
            "openai" => Ok(Self::Openai),
            "droid" => Ok(Self::Droid),
            other => Err(format!("unknown platform: {}", other)),
        }
    }
}

/// 账号状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Disabled,
    Error,
}

impl Default for AccountStatus {
    fn default() -> Self {
        Self::Active
    }
}

/// 上游账号
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub account_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub platform: Platform,
    /// 订阅等级（ULTRA / PRO / FREE），影响调度优先级
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_tier: Option<String>,
    /// 独占会话模式：只服务自己持有的会话或全新会话
    #[serde(default)]
    pub exclusive_session_only: bool,
    /// 会话记录保留时长（秒）
    #[serde(default = "default_session_retention")]
    pub session_retention_seconds: u64,
    /// 账号级限流配置，JSON 字符串或对象，acquire 时归一化
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency_config: Option<serde_json::Value>,
    /// 会话配额配置
    #[serde(default)]
    pub session_concurrency_config: SessionQuotaConfig,
    /// 是否启用消息摘要校验
    #[serde(default)]
    pub enable_message_digest: bool,
    #[serde(default)]
    pub status: AccountStatus,
}

impl Account {
    /// 订阅等级优先级（数字越小优先级越高）
    pub fn tier_priority(&self) -> u8 {
        match self.subscription_tier.as_deref() {
            Some("ULTRA") => 0,
            Some("PRO") => 1,
            Some("FREE") => 2,
            _ => 3,
        }
    }

    pub fn is_available(&self) -> bool {
        self.status == AccountStatus::Active
    }
}

fn default_session_retention() -> u64 {
    // 与粘性绑定默认 TTL 对齐：168 小时
    168 * 3600
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(json: serde_json::Value) -> Account {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_catalog_deserialization_defaults() {
        let a = account(serde_json::json!({
            "accountId": "acc-1",
            "platform": "claude",
        }));
        assert_eq!(a.account_id, "acc-1");
        assert!(!a.exclusive_session_only);
        assert!(!a.enable_message_digest);
        assert_eq!(a.status, AccountStatus::Active);
        assert_eq!(a.session_retention_seconds, 168 * 3600);
        assert!(a.is_available());
    }

    #[test]
    fn test_tier_priority_ordering() {
        let ultra = account(serde_json::json!({
            "accountId": "u", "platform": "claude", "subscriptionTier": "ULTRA"
        }));
        let pro = account(serde_json::json!({
            "accountId": "p", "platform": "claude", "subscriptionTier": "PRO"
        }));
        let unknown = account(serde_json::json!({
            "accountId": "x", "platform": "claude"
        }));
        assert!(ultra.tier_priority() < pro.tier_priority());
        assert!(pro.tier_priority() < unknown.tier_priority());
    }

    #[test]
    fn test_disabled_account_unavailable() {
        let a = account(serde_json::json!({
            "accountId": "d", "platform": "gemini", "status": "disabled"
        }));
        assert!(!a.is_available());
    }
}
