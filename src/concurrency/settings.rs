//! 限流器配置归一化
//!
//! 账号目录里的并发配置可能是 JSON 字符串也可能是对象，字段缺失或
//! 类型不符时回退安装默认值，数值按规则钳位：
//! - `maxConcurrency ← max(1, floor(x))`，显式 ≤0 视为关闭限流
//! - `queueSize ← max(0, floor(x))`
//! - `queueWaitSeconds ← max(1, floor(x))`
//! - `executionSeconds ← x>0 ? floor(x) : 0`（0 = 禁用执行超时）
//! - `targetServices` 过滤到已识别的服务集合

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

use crate::config::ConcurrencyDefaults;
use crate::error::AdmissionError;
use crate::models::Platform;

/// 限流器识别的服务集合
pub const RECOGNIZED_SERVICES: [&str; 4] = ["claude", "gemini", "openai", "droid"];

/// 归一化后的限流器设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterSettings {
    pub enabled: bool,
    pub max_concurrency: u64,
    pub queue_size: u64,
    pub queue_wait_seconds: u64,
    /// 0 表示禁用执行超时
    pub execution_seconds: u64,
    /// 空集合表示对全部服务生效
    pub target_services: BTreeSet<String>,
}

impl LimiterSettings {
    /// 安装默认值：限流关闭
    pub fn defaults(defaults: &ConcurrencyDefaults) -> Self {
        Self {
            enabled: false,
            max_concurrency: 1,
            queue_size: 0,
            queue_wait_seconds: defaults.queue_wait_seconds.max(1),
            execution_seconds: defaults.execution_timeout,
            target_services: BTreeSet::new(),
        }
    }

    /// 从调用方提供的原始配置归一化
    ///
    /// # 参数
    /// - `raw`: JSON 字符串或对象；None/Null 落到安装默认值
    ///
    /// # 返回
    /// 归一化后的设置；根节点无法解析时返回 `InvalidConfig`
    pub fn normalize(
        raw: Option<&Value>,
        defaults: &ConcurrencyDefaults,
    ) -> Result<Self, AdmissionError> {
        let mut settings = Self::defaults(defaults);

        let parsed;
        let object = match raw {
            None | Some(Value::Null) => return Ok(settings),
            Some(Value::String(s)) => {
                if s.trim().is_empty() {
                    return Ok(settings);
                }
                parsed = serde_json::from_str::<Value>(s).map_err(|e| {
                    AdmissionError::InvalidConfig(format!("concurrency config 不是合法 JSON: {}", e))
                })?;
                match &parsed {
                    Value::Object(map) => map,
                    Value::Null => return Ok(settings),
                    other => {
                        return Err(AdmissionError::InvalidConfig(format!(
                            "concurrency config 应为对象，实际为 {}",
                            type_name(other)
                        )))
                    }
                }
            }
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(AdmissionError::InvalidConfig(format!(
                    "concurrency config 应为对象，实际为 {}",
                    type_name(other)
                )))
            }
        };

        if let Some(enabled) = object.get("enabled").and_then(Value::as_bool) {
            settings.enabled = enabled;
        }

        if let Some(x) = number_field(object, "maxConcurrency") {
            if x <= 0.0 {
                // 显式 ≤0：关闭限流而非钳到 1
                settings.enabled = false;
            } else {
                settings.max_concurrency = (x.floor() as u64).max(1);
            }
        }

        if let Some(x) = number_field(object, "queueSize") {
            settings.queue_size = x.max(0.0).floor() as u64;
        }

        if let Some(x) = number_field(object, "queueWaitSeconds") {
            settings.queue_wait_seconds = (x.floor() as u64).max(1);
        }

        if let Some(x) = number_field(object, "executionSeconds") {
            settings.execution_seconds = if x > 0.0 { x.floor() as u64 } else { 0 };
        }

        if let Some(list) = object.get("targetServices").and_then(Value::as_array) {
            settings.target_services = list
                .iter()
                .filter_map(Value::as_str)
                .filter(|s| RECOGNIZED_SERVICES.contains(s))
                .map(str::to_string)
                .collect();
        }

        Ok(settings)
    }

    /// 该限流器是否作用于给定平台
    pub fn applies_to(&self, platform: Platform) -> bool {
        self.target_services.is_empty() || self.target_services.contains(platform.as_str())
    }

    /// 是否退化为 no-op（不限流）
    pub fn is_noop(&self) -> bool {
        !self.enabled || self.max_concurrency == 0
    }
}

fn number_field(object: &serde_json::Map<String, Value>, key: &str) -> Option<f64> {
    object.get(key).and_then(Value::as_f64).filter(|x| x.is_finite())
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> ConcurrencyDefaults {
        ConcurrencyDefaults::default()
    }

    #[test]
    fn test_missing_config_is_disabled() {
        let s = LimiterSettings::normalize(None, &defaults()).unwrap();
        assert!(!s.enabled);
        assert!(s.is_noop());
    }

    #[test]
    fn test_object_form_with_clamps() {
        let raw = serde_json::json!({
            "enabled": true,
            "maxConcurrency": 3.9,
            "queueSize": -2,
            "queueWaitSeconds": 0,
            "executionSeconds": -1,
            "targetServices": ["claude", "gemini", "slack"]
        });
        let s = LimiterSettings::normalize(Some(&raw), &defaults()).unwrap();
        assert!(s.enabled);
        assert_eq!(s.max_concurrency, 3);
        assert_eq!(s.queue_size, 0);
        assert_eq!(s.queue_wait_seconds, 1);
        assert_eq!(s.execution_seconds, 0);
        assert_eq!(
            s.target_services,
            ["claude", "gemini"].iter().map(|s| s.to_string()).collect()
        );
        assert!(s.applies_to(Platform::Claude));
        assert!(!s.applies_to(Platform::Openai));
    }

    #[test]
    fn test_json_string_form() {
        let raw = Value::String(
            r#"{"enabled": true, "maxConcurrency": 2, "queueSize": 5, "queueWaitSeconds": 30}"#
                .to_string(),
        );
        let s = LimiterSettings::normalize(Some(&raw), &defaults()).unwrap();
        assert!(s.enabled);
        assert_eq!(s.max_concurrency, 2);
        assert_eq!(s.queue_size, 5);
        assert_eq!(s.queue_wait_seconds, 30);
        // 缺省字段落到安装默认值
        assert_eq!(s.execution_seconds, 300);
    }

    #[test]
    fn test_explicit_zero_concurrency_disables() {
        let raw = serde_json::json!({"enabled": true, "maxConcurrency": 0});
        let s = LimiterSettings::normalize(Some(&raw), &defaults()).unwrap();
        assert!(s.is_noop());
    }

    #[test]
    fn test_malformed_json_string_is_invalid() {
        let raw = Value::String("{not json".to_string());
        assert!(matches!(
            LimiterSettings::normalize(Some(&raw), &defaults()),
            Err(AdmissionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_wrong_typed_fields_fall_back() {
        let raw = serde_json::json!({
            "enabled": true,
            "maxConcurrency": "lots",
            "queueSize": {"nested": true}
        });
        let s = LimiterSettings::normalize(Some(&raw), &defaults()).unwrap();
        assert_eq!(s.max_concurrency, 1);
        assert_eq!(s.queue_size, 0);
    }

    #[test]
    fn test_empty_target_services_applies_to_all() {
        let raw = serde_json::json!({"enabled": true, "maxConcurrency": 1});
        let s = LimiterSettings::normalize(Some(&raw), &defaults()).unwrap();
        assert!(s.applies_to(Platform::Droid));
    }
}
