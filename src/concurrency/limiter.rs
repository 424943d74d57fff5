//! 按资源的分布式信号量
//!
//! 存储键：
//! - `sem:{resourceId}`：运行中的作业 id，分值为租约到期毫秒
//! - `concurrency:queue:{resourceId}`：等待计数，10 分钟空闲 TTL
//!
//! 准入顺序：先尝试直接占位（queue_size=0 即零排队语义），失败后
//! 入队等待。进程内等待者经公平锁排队因而 FIFO；跨进程靠存储轮询，
//! 只有近似公平。本进程的释放会立即唤醒队头。

use chrono::Utc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use super::handle::{ConcurrencyHandle, ReleaseReason};
use super::settings::LimiterSettings;
use crate::error::AdmissionError;
use crate::session::signal::{ClientEvent, ClientSignal};
use crate::store::{KvStore, StoreError};

/// 跨进程释放的轮询间隔
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// 等待计数键的空闲 TTL
const QUEUE_IDLE_TTL: Duration = Duration::from_secs(600);
/// 执行超时禁用时的兜底租约
const FALLBACK_LEASE: Duration = Duration::from_secs(3600);

/// 累计计数
#[derive(Debug, Default)]
pub struct LimiterStats {
    admitted: AtomicU64,
    rejected: AtomicU64,
    queue_timeouts: AtomicU64,
    execution_timeouts: AtomicU64,
    disconnects: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub admitted: u64,
    pub rejected: u64,
    pub queue_timeouts: u64,
    pub execution_timeouts: u64,
    pub disconnects: u64,
}

/// 当前状态快照（计数来自存储）
#[derive(Debug, Clone)]
pub struct LimiterState {
    pub running: u64,
    pub queued: u64,
    pub settings: LimiterSettings,
}

enum WaitOutcome {
    Admitted(Result<(), StoreError>),
    TimedOut,
    Disconnected(ClientEvent),
}

pub struct ResourceLimiter {
    resource_id: String,
    store: Arc<dyn KvStore>,
    settings: std::sync::RwLock<LimiterSettings>,
    /// 进程内等待者的公平队列（tokio Mutex 按到达顺序授予）
    admit_lock: tokio::sync::Mutex<()>,
    release_notify: Notify,
    stats: LimiterStats,
    /// 最近访问时间（epoch 毫秒），注册表据此做空闲清理
    last_access: AtomicI64,
    disconnected: std::sync::atomic::AtomicBool,
}

impl ResourceLimiter {
    pub(crate) fn new(
        resource_id: impl Into<String>,
        store: Arc<dyn KvStore>,
        settings: LimiterSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            resource_id: resource_id.into(),
            store,
            settings: std::sync::RwLock::new(settings),
            admit_lock: tokio::sync::Mutex::new(()),
            release_notify: Notify::new(),
            stats: LimiterStats::default(),
            last_access: AtomicI64::new(Utc::now().timestamp_millis()),
            disconnected: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn settings(&self) -> LimiterSettings {
        self.settings.read().unwrap().clone()
    }

    /// 就地更新设置，不重建底层原语；调用方（注册表）持有资源级更新锁
    pub(crate) fn update_settings(&self, new: LimiterSettings) {
        let mut guard = self.settings.write().unwrap();
        tracing::info!(
            "[Limiter] {} 热更新配置: maxConcurrency {} -> {}, queueSize {} -> {}",
            self.resource_id,
            guard.max_concurrency,
            new.max_concurrency,
            guard.queue_size,
            new.queue_size
        );
        *guard = new;
    }

    pub(crate) fn touch(&self) {
        self.last_access
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub(crate) fn idle_for(&self) -> Duration {
        let last = self.last_access.load(Ordering::Relaxed);
        let elapsed = Utc::now().timestamp_millis() - last;
        Duration::from_millis(elapsed.max(0) as u64)
    }

    fn sem_key(&self) -> String {
        format!("sem:{}", self.resource_id)
    }

    fn queue_key(&self) -> String {
        format!("concurrency:queue:{}", self.resource_id)
    }

    fn lease(settings: &LimiterSettings) -> Duration {
        if settings.execution_seconds > 0 {
            Duration::from_secs(settings.execution_seconds + 60)
        } else {
            FALLBACK_LEASE
        }
    }

    /// 申请一个并发槽位
    ///
    /// 存储错误一律 fail-closed，不发放槽位。
    pub async fn acquire(
        self: &Arc<Self>,
        signal: &ClientSignal,
    ) -> Result<ConcurrencyHandle, AdmissionError> {
        self.touch();

        if let Some(event) = signal.fired() {
            return Err(AdmissionError::ClientDisconnected { event });
        }

        let settings = self.settings();
        if settings.is_noop() {
            return Ok(ConcurrencyHandle::noop());
        }

        let member = uuid::Uuid::new_v4().to_string();
        let lease = Self::lease(&settings);

        // 快速路径：有空位直接占用
        if self
            .store
            .try_acquire_slot(
                &self.sem_key(),
                &member,
                settings.max_concurrency,
                lease,
                Utc::now().timestamp_millis(),
            )
            .await?
        {
            return Ok(self.admitted(member, &settings, signal));
        }

        if settings.queue_size == 0 {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(AdmissionError::QueueFull {
                resource_id: self.resource_id.clone(),
                current_waiting: 0,
                max_queue_size: 0,
            });
        }

        // 入队：原子自增，超限立即回退
        let waiting = self
            .store
            .enter_queue(&self.queue_key(), QUEUE_IDLE_TTL)
            .await?;
        if waiting.max(0) as u64 > settings.queue_size {
            if let Err(e) = self.store.decr(&self.queue_key()).await {
                tracing::warn!("[Limiter] {} 出队回退失败: {}", self.resource_id, e);
            }
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(AdmissionError::QueueFull {
                resource_id: self.resource_id.clone(),
                current_waiting: (waiting.max(1) - 1) as u64,
                max_queue_size: settings.queue_size,
            });
        }

        tracing::debug!(
            "[Limiter] {} 入队等待 ({}/{})",
            self.resource_id,
            waiting,
            settings.queue_size
        );

        let wait = Duration::from_secs(settings.queue_wait_seconds);
        let mut watch = signal.watch();
        let outcome = tokio::select! {
            r = self.wait_for_slot(&member, &settings) => WaitOutcome::Admitted(r),
            _ = tokio::time::sleep(wait) => WaitOutcome::TimedOut,
            ev = watch.terminal() => WaitOutcome::Disconnected(ev),
        };

        if let Err(e) = self.store.decr(&self.queue_key()).await {
            tracing::warn!("[Limiter] {} 出队计数失败: {}", self.resource_id, e);
        }

        match outcome {
            WaitOutcome::Admitted(Ok(())) => Ok(self.admitted(member, &settings, signal)),
            WaitOutcome::Admitted(Err(e)) => Err(e.into()),
            WaitOutcome::TimedOut => {
                // 等待被放弃时槽位可能恰好已写入存储，按丢弃处理
                let _ = self.store.zrem(&self.sem_key(), &member).await;
                self.stats.queue_timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    "[Limiter] {} 等待 {}s 未获准入，超时",
                    self.resource_id,
                    settings.queue_wait_seconds
                );
                Err(AdmissionError::QueueWaitTimeout {
                    resource_id: self.resource_id.clone(),
                    timeout_secs: settings.queue_wait_seconds,
                })
            }
            WaitOutcome::Disconnected(event) => {
                let _ = self.store.zrem(&self.sem_key(), &member).await;
                self.stats.disconnects.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    "[Limiter] {} 等待者在准入前断开 ({})",
                    self.resource_id,
                    event
                );
                Err(AdmissionError::ClientDisconnected { event })
            }
        }
    }

    fn admitted(
        self: &Arc<Self>,
        member: String,
        settings: &LimiterSettings,
        signal: &ClientSignal,
    ) -> ConcurrencyHandle {
        self.stats.admitted.fetch_add(1, Ordering::Relaxed);
        ConcurrencyHandle::attach(
            Arc::clone(self),
            member,
            settings.execution_seconds,
            signal,
        )
    }

    async fn wait_for_slot(
        &self,
        member: &str,
        settings: &LimiterSettings,
    ) -> Result<(), StoreError> {
        let _guard = self.admit_lock.lock().await;
        let lease = Self::lease(settings);
        loop {
            if self
                .store
                .try_acquire_slot(
                    &self.sem_key(),
                    member,
                    settings.max_concurrency,
                    lease,
                    Utc::now().timestamp_millis(),
                )
                .await?
            {
                return Ok(());
            }
            // 本进程释放立即唤醒，跨进程释放靠轮询兜底
            let _ = tokio::time::timeout(POLL_INTERVAL, self.release_notify.notified()).await;
        }
    }

    pub(crate) async fn release_slot(&self, member: &str) -> Result<(), StoreError> {
        self.store.zrem(&self.sem_key(), member).await.map(|_| ())
    }

    pub(crate) fn on_released(&self, reason: ReleaseReason) {
        match reason {
            ReleaseReason::ExecutionTimeout => {
                self.stats.execution_timeouts.fetch_add(1, Ordering::Relaxed);
            }
            ReleaseReason::ClientDisconnected(_) => {
                self.stats.disconnects.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        self.release_notify.notify_waiters();
    }

    /// 释放底层存储句柄；注册表在淘汰条目时调用，幂等
    pub(crate) fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("[Limiter] {} 从注册表淘汰，断开底层句柄", self.resource_id);
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            admitted: self.stats.admitted.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            queue_timeouts: self.stats.queue_timeouts.load(Ordering::Relaxed),
            execution_timeouts: self.stats.execution_timeouts.load(Ordering::Relaxed),
            disconnects: self.stats.disconnects.load(Ordering::Relaxed),
        }
    }

    /// 运行/排队计数以存储为准
    pub async fn state(&self) -> Result<LimiterState, StoreError> {
        let running = self.store.zcard(&self.sem_key()).await?;
        let queued = self
            .store
            .get(&self.queue_key())
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0)
            .max(0) as u64;
        Ok(LimiterState {
            running,
            queued,
            settings: self.settings(),
        })
    }
}
