//! 限流器注册表
//!
//! 进程内唯一持有 `ResourceLimiter` 的地方。LRU 容量上限约一万个
//! 资源，空闲超过 `limiterCacheTtl` 的条目在创建路径和显式清理时
//! 淘汰；两种淘汰都会触发 disposal 钩子断开底层句柄。
//!
//! 热更配置用资源级双重检查锁：无锁快路径比较设置，变更时在
//! 该资源的更新锁内复查后就地修改。
//!
//! 归一化结果按资源缓存 `sessionConfigCacheTtl` 毫秒：原始配置
//! 未变时跳过重新解析（JSON 字符串形态的配置每次解析并不便宜），
//! 原始配置一变缓存即失效，不影响热更的即时生效。

use dashmap::DashMap;
use lru::LruCache;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::handle::ConcurrencyHandle;
use super::limiter::{LimiterState, ResourceLimiter};
use super::settings::LimiterSettings;
use crate::config::CoreConfig;
use crate::error::AdmissionError;
use crate::session::signal::ClientSignal;
use crate::store::KvStore;

/// 归一化结果的缓存条目
struct CachedSettings {
    raw: Option<Value>,
    settings: LimiterSettings,
    cached_at: Instant,
}

pub struct LimiterRegistry {
    store: Arc<dyn KvStore>,
    limiters: std::sync::Mutex<LruCache<String, Arc<ResourceLimiter>>>,
    update_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    /// 按资源缓存的归一化设置
    settings_cache: DashMap<String, CachedSettings>,
    idle_ttl: Duration,
    config_cache_ttl: Duration,
    defaults: crate::config::ConcurrencyDefaults,
}

impl LimiterRegistry {
    pub fn new(store: Arc<dyn KvStore>, config: &CoreConfig) -> Self {
        let capacity = NonZeroUsize::new(config.concurrency.registry_capacity.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            limiters: std::sync::Mutex::new(LruCache::new(capacity)),
            update_locks: DashMap::new(),
            settings_cache: DashMap::new(),
            idle_ttl: config.concurrency.limiter_cache_ttl(),
            config_cache_ttl: config.concurrency.session_config_cache_ttl(),
            defaults: config.defaults.concurrency.clone(),
        }
    }

    /// 申请资源的并发槽位
    ///
    /// # 参数
    /// - `resource_id`: 并发约束作用的键，通常是 API Key id 或账号 id
    /// - `raw_config`: 调用方携带的限流配置（JSON 字符串或对象）
    /// - `signal`: 客户端终止信号
    pub async fn acquire(
        &self,
        resource_id: &str,
        raw_config: Option<&Value>,
        signal: &ClientSignal,
    ) -> Result<ConcurrencyHandle, AdmissionError> {
        let resource_id = resource_id.trim();
        if resource_id.is_empty() {
            return Err(AdmissionError::InvalidResourceId(
                "resource id 不能为空".to_string(),
            ));
        }

        let settings = self.normalize_cached(resource_id, raw_config)?;
        if settings.is_noop() {
            return Ok(ConcurrencyHandle::noop());
        }

        let limiter = self.get_or_create(resource_id, &settings);
        self.apply_settings(&limiter, resource_id, settings).await;
        limiter.acquire(signal).await
    }

    /// 归一化配置，原始值未变且缓存未过期时直接复用
    ///
    /// 解析失败不进缓存。
    fn normalize_cached(
        &self,
        resource_id: &str,
        raw: Option<&Value>,
    ) -> Result<LimiterSettings, AdmissionError> {
        if let Some(hit) = self.settings_cache.get(resource_id) {
            if hit.cached_at.elapsed() < self.config_cache_ttl && hit.raw.as_ref() == raw {
                return Ok(hit.settings.clone());
            }
        }

        let settings = LimiterSettings::normalize(raw, &self.defaults)?;
        self.settings_cache.insert(
            resource_id.to_string(),
            CachedSettings {
                raw: raw.cloned(),
                settings: settings.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok(settings)
    }

    /// 查找或创建限流器；过期条目就地淘汰重建
    fn get_or_create(&self, resource_id: &str, settings: &LimiterSettings) -> Arc<ResourceLimiter> {
        let mut cache = self.limiters.lock().unwrap();

        if let Some(existing) = cache.get(resource_id) {
            if existing.idle_for() < self.idle_ttl {
                let limiter = Arc::clone(existing);
                limiter.touch();
                return limiter;
            }
            if let Some((_, stale)) = cache.pop_entry(resource_id) {
                stale.disconnect();
            }
        }

        let limiter =
            ResourceLimiter::new(resource_id, Arc::clone(&self.store), settings.clone());
        if let Some((evicted_id, evicted)) = cache.push(resource_id.to_string(), Arc::clone(&limiter))
        {
            // 容量淘汰（push 返回被挤出的最久未用条目）
            if evicted_id != resource_id {
                evicted.disconnect();
            }
        }
        limiter
    }

    /// 双重检查的热更配置
    async fn apply_settings(
        &self,
        limiter: &Arc<ResourceLimiter>,
        resource_id: &str,
        settings: LimiterSettings,
    ) {
        // 快路径：设置未变
        if limiter.settings() == settings {
            return;
        }

        let lock = self
            .update_locks
            .entry(resource_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // 复查：可能已被并发更新者改过
        if limiter.settings() != settings {
            limiter.update_settings(settings);
        }
    }

    /// 清理空闲超过 TTL 的条目，返回淘汰数量
    pub fn evict_idle(&self) -> usize {
        let mut cache = self.limiters.lock().unwrap();
        let stale: Vec<String> = cache
            .iter()
            .filter(|(_, l)| l.idle_for() >= self.idle_ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            if let Some((_, limiter)) = cache.pop_entry(id) {
                limiter.disconnect();
            }
            self.update_locks.remove(id);
            self.settings_cache.remove(id);
        }
        self.settings_cache
            .retain(|_, hit| hit.cached_at.elapsed() < self.config_cache_ttl);
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.limiters.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 当前生效的设置（测试与运维接口）
    pub fn settings_of(&self, resource_id: &str) -> Option<LimiterSettings> {
        let mut cache = self.limiters.lock().unwrap();
        cache.get(resource_id).map(|l| l.settings())
    }

    /// 存储视角的状态快照
    pub async fn state_of(&self, resource_id: &str) -> Option<LimiterState> {
        let limiter = {
            let mut cache = self.limiters.lock().unwrap();
            cache.get(resource_id).map(Arc::clone)
        };
        match limiter {
            Some(l) => l.state().await.ok(),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::signal::ClientEvent;
    use crate::store::{MemoryStore, UnavailableStore};

    fn registry() -> LimiterRegistry {
        LimiterRegistry::new(Arc::new(MemoryStore::new()), &CoreConfig::default())
    }

    fn limiter_config(max: u64, queue: u64, wait_secs: u64) -> Value {
        serde_json::json!({
            "enabled": true,
            "maxConcurrency": max,
            "queueSize": queue,
            "queueWaitSeconds": wait_secs,
        })
    }

    #[tokio::test]
    async fn test_disabled_config_returns_noop_handle() {
        let registry = registry();
        let signal = ClientSignal::new();
        let handle = registry.acquire("r", None, &signal).await.unwrap();
        assert!(handle.is_noop());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_empty_resource_id_rejected() {
        let registry = registry();
        let signal = ClientSignal::new();
        let err = registry
            .acquire("  ", Some(&limiter_config(1, 0, 5)), &signal)
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::InvalidResourceId(_)));
    }

    #[tokio::test]
    async fn test_queue_full_rejection() {
        crate::init_test_tracing();
        let registry = Arc::new(registry());
        let config = limiter_config(1, 1, 5);
        let signal = ClientSignal::new();

        let a = registry.acquire("R", Some(&config), &signal).await.unwrap();
        assert!(!a.is_noop());

        // B 入队等待
        let registry2 = Arc::clone(&registry);
        let config2 = config.clone();
        let signal2 = signal.clone();
        let b = tokio::spawn(async move {
            registry2.acquire("R", Some(&config2), &signal2).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // C 被立即拒绝
        let err = registry
            .acquire("R", Some(&config), &signal)
            .await
            .unwrap_err();
        match err {
            AdmissionError::QueueFull {
                current_waiting,
                max_queue_size,
                ..
            } => {
                assert_eq!(current_waiting, 1);
                assert_eq!(max_queue_size, 1);
            }
            other => panic!("expected QueueFull, got {:?}", other),
        }

        // 释放 A 后 B 获准入
        a.release().await;
        let b = b.await.unwrap().unwrap();
        assert!(!b.is_noop());

        let state = registry.state_of("R").await.unwrap();
        assert_eq!(state.running, 1);
        b.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_wait_timeout() {
        let registry = registry();
        let config = limiter_config(1, 5, 2);
        let signal = ClientSignal::new();

        let _a = registry.acquire("R", Some(&config), &signal).await.unwrap();

        let started = tokio::time::Instant::now();
        let err = registry
            .acquire("R", Some(&config), &signal)
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        match &err {
            AdmissionError::QueueWaitTimeout { timeout_secs, .. } => {
                assert_eq!(*timeout_secs, 2);
            }
            other => panic!("expected QueueWaitTimeout, got {:?}", other),
        }
        assert_eq!(err.details()["timeout"], 2);
        assert_eq!(err.details()["timeoutMs"], 2000);
        assert_eq!(err.details()["timeoutType"], "queue");
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(3));

        // 超时后等待计数已回退
        let state = registry.state_of("R").await.unwrap();
        assert_eq!(state.queued, 0);
    }

    #[tokio::test]
    async fn test_auto_release_on_client_close() {
        crate::init_test_tracing();
        let registry = registry();
        let config = limiter_config(1, 0, 5);

        let signal = ClientSignal::new();
        let a = registry.acquire("R", Some(&config), &signal).await.unwrap();
        assert!(!a.is_released());

        signal.fire(ClientEvent::RequestClose);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(a.is_released());
        assert!(matches!(
            a.release_reason(),
            Some(super::super::handle::ReleaseReason::ClientDisconnected(
                ClientEvent::RequestClose
            ))
        ));

        // 1 秒内新的 acquire 必须成功
        let fresh_signal = ClientSignal::new();
        let b = registry
            .acquire("R", Some(&config), &fresh_signal)
            .await
            .unwrap();
        assert!(!b.is_noop());
        b.release().await;
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let registry = registry();
        let config = limiter_config(1, 0, 5);
        let signal = ClientSignal::new();

        let a = registry.acquire("R", Some(&config), &signal).await.unwrap();
        a.release().await;
        a.release().await;
        // 事件驱动的释放路径在显式释放后也不再生效
        signal.fire(ClientEvent::ResponseFinish);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let state = registry.state_of("R").await.unwrap();
        assert_eq!(state.running, 0);

        // 仍然只放一个槽位
        let s2 = ClientSignal::new();
        let b = registry.acquire("R", Some(&config), &s2).await.unwrap();
        assert!(!b.is_noop());
        b.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_execution_timeout_releases_slot() {
        let registry = registry();
        let config = serde_json::json!({
            "enabled": true,
            "maxConcurrency": 1,
            "queueSize": 0,
            "queueWaitSeconds": 5,
            "executionSeconds": 1,
        });
        let signal = ClientSignal::new();

        let a = registry.acquire("R", Some(&config), &signal).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(a.is_released());
        assert!(matches!(
            a.release_reason(),
            Some(super::super::handle::ReleaseReason::ExecutionTimeout)
        ));

        let state = registry.state_of("R").await.unwrap();
        assert_eq!(state.running, 0);
    }

    #[tokio::test]
    async fn test_cancel_while_queued_fails_client_disconnected() {
        let registry = Arc::new(registry());
        let config = limiter_config(1, 3, 10);
        let holder_signal = ClientSignal::new();
        let _a = registry
            .acquire("R", Some(&config), &holder_signal)
            .await
            .unwrap();

        let waiter_signal = ClientSignal::new();
        let registry2 = Arc::clone(&registry);
        let config2 = config.clone();
        let ws = waiter_signal.clone();
        let waiter = tokio::spawn(async move {
            registry2.acquire("R", Some(&config2), &ws).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        waiter_signal.fire(ClientEvent::RequestAborted);
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            AdmissionError::ClientDisconnected {
                event: ClientEvent::RequestAborted
            }
        ));

        let state = registry.state_of("R").await.unwrap();
        assert_eq!(state.queued, 0);
        assert_eq!(state.running, 1);
    }

    // 热更无需等待在途任务排空
    #[tokio::test]
    async fn test_hot_reconfig_applies_without_drain() {
        let registry = registry();
        let signal = ClientSignal::new();

        let a = registry
            .acquire("R", Some(&limiter_config(1, 2, 5)), &signal)
            .await
            .unwrap();
        assert_eq!(registry.settings_of("R").unwrap().max_concurrency, 1);

        // A 未释放时带新配置 acquire
        let s2 = ClientSignal::new();
        let b = registry
            .acquire("R", Some(&limiter_config(3, 2, 5)), &s2)
            .await
            .unwrap();
        assert_eq!(registry.settings_of("R").unwrap().max_concurrency, 3);
        assert!(!b.is_noop());

        a.release().await;
        b.release().await;
    }

    #[tokio::test]
    async fn test_settings_cache_serves_repeat_config() {
        let registry = registry();
        let signal = ClientSignal::new();
        let config = Value::String(
            r#"{"enabled": true, "maxConcurrency": 2, "queueSize": 1, "queueWaitSeconds": 5}"#
                .to_string(),
        );

        let a = registry.acquire("R", Some(&config), &signal).await.unwrap();
        // 原始配置未变：缓存命中，不重新解析
        let b = registry.acquire("R", Some(&config), &signal).await.unwrap();
        assert_eq!(registry.settings_of("R").unwrap().max_concurrency, 2);

        // 解析失败不进缓存，也不影响已缓存的合法配置
        let bad = Value::String("{not json".to_string());
        assert!(matches!(
            registry.acquire("R", Some(&bad), &signal).await,
            Err(AdmissionError::InvalidConfig(_))
        ));

        // 原始配置一变立即生效，缓存不挡热更
        let changed = limiter_config(4, 1, 5);
        let c = registry
            .acquire("R", Some(&changed), &signal)
            .await
            .unwrap();
        assert_eq!(registry.settings_of("R").unwrap().max_concurrency, 4);

        a.release().await;
        b.release().await;
        c.release().await;
    }

    #[tokio::test]
    async fn test_backend_failure_fails_closed() {
        let registry =
            LimiterRegistry::new(Arc::new(UnavailableStore), &CoreConfig::default());
        let signal = ClientSignal::new();
        let err = registry
            .acquire("R", Some(&limiter_config(1, 1, 5)), &signal)
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Backend(_)));
        assert_eq!(err.code(), "BACKEND_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_evict_idle_runs_disposal() {
        let config = CoreConfig {
            concurrency: crate::config::ConcurrencyConfig {
                limiter_cache_ttl: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let registry = LimiterRegistry::new(Arc::new(MemoryStore::new()), &config);
        let signal = ClientSignal::new();
        let handle = registry
            .acquire("R", Some(&limiter_config(1, 0, 5)), &signal)
            .await
            .unwrap();
        handle.release().await;

        assert_eq!(registry.len(), 1);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(registry.evict_idle(), 1);
        assert!(registry.is_empty());
    }
}
