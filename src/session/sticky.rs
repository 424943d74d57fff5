//! 粘性会话绑定
//!
//! 会话指纹到账号的映射放在存储里，整条对话落在同一账号上。
//! 绑定按 TTL 过期；剩余 TTL 低于续期阈值时在请求路径上顺手续期。
//! 独占账号额外落一条属主摘要键，供运维排查会话归属。

use std::sync::Arc;
use std::time::Duration;

use crate::config::SessionConfig;
use crate::store::{KvStore, StoreError};

pub struct StickyBindings {
    store: Arc<dyn KvStore>,
    config: SessionConfig,
}

impl StickyBindings {
    pub fn new(store: Arc<dyn KvStore>, config: SessionConfig) -> Self {
        Self { store, config }
    }

    pub fn binding_key(session_hash: &str) -> String {
        format!("sticky_session:{}", session_hash)
    }

    fn owner_key(account_id: &str, session_hash: &str) -> String {
        format!("exclusive_session_digest:{}:{}", account_id, session_hash)
    }

    /// 会话当前绑定的账号
    pub async fn bound_account(&self, session_hash: &str) -> Result<Option<String>, StoreError> {
        self.store.get(&Self::binding_key(session_hash)).await
    }

    /// 绑定会话到账号
    pub async fn bind(&self, session_hash: &str, account_id: &str) -> Result<(), StoreError> {
        self.store
            .set(
                &Self::binding_key(session_hash),
                account_id,
                Some(self.config.sticky_ttl()),
            )
            .await?;
        tracing::debug!("[StickySession] 绑定会话 {} 到账号 {}", session_hash, account_id);
        Ok(())
    }

    /// 解绑会话
    pub async fn unbind(&self, session_hash: &str) -> Result<(), StoreError> {
        if self.store.del(&Self::binding_key(session_hash)).await? {
            tracing::debug!("[StickySession] 解绑会话 {}", session_hash);
        }
        Ok(())
    }

    /// 剩余 TTL 低于阈值时续期
    ///
    /// # 返回
    /// 是否实际续期
    pub async fn refresh_if_needed(&self, session_hash: &str) -> Result<bool, StoreError> {
        let key = Self::binding_key(session_hash);
        let Some(remaining) = self.store.ttl(&key).await? else {
            return Ok(false);
        };
        if remaining >= self.config.renewal_threshold() {
            return Ok(false);
        }
        let renewed = self.store.expire(&key, self.config.sticky_ttl()).await?;
        if renewed {
            tracing::debug!(
                "[StickySession] 续期会话 {} (剩余 {}s)",
                session_hash,
                remaining.as_secs()
            );
        }
        Ok(renewed)
    }

    /// 记录独占账号的属主摘要
    pub async fn mark_exclusive_owner(
        &self,
        account_id: &str,
        session_hash: &str,
        digest: &str,
        retention: Duration,
    ) -> Result<(), StoreError> {
        self.store
            .set(
                &Self::owner_key(account_id, session_hash),
                digest,
                Some(retention),
            )
            .await
    }

    pub async fn exclusive_owner_digest(
        &self,
        account_id: &str,
        session_hash: &str,
    ) -> Result<Option<String>, StoreError> {
        self.store
            .get(&Self::owner_key(account_id, session_hash))
            .await
    }
}
