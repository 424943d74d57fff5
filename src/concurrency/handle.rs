//! 并发槽位句柄
//!
//! `acquire` 成功后返回的句柄。释放有两条路径：调用方显式
//! `release()`，或监听任务在客户端终止事件 / 执行超时触发时自动
//! 释放。`released` 守卫保证两条路径在计数上的效果至多一次。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use super::limiter::ResourceLimiter;
use crate::session::signal::{ClientEvent, ClientSignal};

/// 释放原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    /// 调用方显式释放
    Manual,
    /// 响应正常写完
    Finished,
    /// 客户端断开
    ClientDisconnected(ClientEvent),
    /// 响应出错
    ResponseError,
    /// 执行超时
    ExecutionTimeout,
}

pub(crate) struct HandleInner {
    limiter: Arc<ResourceLimiter>,
    member: String,
    released: AtomicBool,
    reason: std::sync::Mutex<Option<ReleaseReason>>,
    shutdown: Notify,
}

impl HandleInner {
    /// 释放序：置守卫 → 移除监听 → 释放存储槽位 → 统计
    async fn release_with(&self, reason: ReleaseReason) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        // notify_one 存留许可：监听任务尚未注册等待时也能退出
        self.shutdown.notify_one();

        // 存储释放失败只记录，不得掩盖释放本身；
        // 远端计数最多泄漏到租约到期。
        if let Err(e) = self.limiter.release_slot(&self.member).await {
            tracing::warn!(
                "[Limiter] 释放 {} 的槽位 {} 失败: {}",
                self.limiter.resource_id(),
                self.member,
                e
            );
        }

        *self.reason.lock().unwrap() = Some(reason);
        self.limiter.on_released(reason);
    }
}

/// 并发槽位句柄
///
/// 限流关闭时返回 no-op 句柄，释放是空操作。
#[derive(Clone)]
pub struct ConcurrencyHandle {
    inner: Option<Arc<HandleInner>>,
}

impl std::fmt::Debug for ConcurrencyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyHandle")
            .field("active", &self.inner.is_some())
            .finish()
    }
}

impl ConcurrencyHandle {
    pub(crate) fn noop() -> Self {
        Self { inner: None }
    }

    /// 绑定已准入的槽位并启动监听任务
    pub(crate) fn attach(
        limiter: Arc<ResourceLimiter>,
        member: String,
        execution_seconds: u64,
        signal: &ClientSignal,
    ) -> Self {
        let inner = Arc::new(HandleInner {
            limiter,
            member,
            released: AtomicBool::new(false),
            reason: std::sync::Mutex::new(None),
            shutdown: Notify::new(),
        });

        let mut watch = signal.watch();
        let listener = Arc::clone(&inner);
        tokio::spawn(async move {
            let exec_timer = async {
                if execution_seconds > 0 {
                    tokio::time::sleep(Duration::from_secs(execution_seconds)).await;
                } else {
                    std::future::pending::<()>().await;
                }
            };
            tokio::select! {
                ev = watch.terminal() => {
                    let reason = match ev {
                        ClientEvent::ResponseFinish => ReleaseReason::Finished,
                        ClientEvent::ResponseError => ReleaseReason::ResponseError,
                        other => ReleaseReason::ClientDisconnected(other),
                    };
                    listener.release_with(reason).await;
                }
                _ = exec_timer => {
                    tracing::warn!(
                        "[Limiter] {} 执行超过 {}s，强制释放槽位",
                        listener.limiter.resource_id(),
                        execution_seconds
                    );
                    listener.release_with(ReleaseReason::ExecutionTimeout).await;
                }
                _ = listener.shutdown.notified() => {}
            }
        });

        Self { inner: Some(inner) }
    }

    pub fn is_noop(&self) -> bool {
        self.inner.is_none()
    }

    pub fn is_released(&self) -> bool {
        match &self.inner {
            Some(inner) => inner.released.load(Ordering::SeqCst),
            None => true,
        }
    }

    /// 已释放时的原因；未释放或 no-op 返回 None
    pub fn release_reason(&self) -> Option<ReleaseReason> {
        self.inner
            .as_ref()
            .and_then(|inner| *inner.reason.lock().unwrap())
    }

    /// 幂等释放
    pub async fn release(&self) {
        if let Some(inner) = &self.inner {
            inner.release_with(ReleaseReason::Manual).await;
        }
    }
}
