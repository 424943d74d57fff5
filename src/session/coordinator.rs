//! 会话协调器
//!
//! 每个入站请求的准入编排：
//! 1. 构建会话上下文（指纹、会话 id、新旧判定）
//! 2. 申请 API Key 级并发槽位
//! 3. 按粘性与独占规则过滤候选账号并选择一个
//! 4. 申请账号级并发槽位
//! 5. 会话配额准入
//! 6. 摘要校验与持久化
//! 7. 注册 / 续期粘性绑定
//!
//! 第 2 步之后的任何失败都按 LIFO 回滚已取得的资源；释放路径
//! 本身不抛错，存储失败只记录。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::digest::{build_digest, DigestCache, DigestTransition, DigestValidator};
use super::fingerprint::{self, request_fingerprint};
use super::quota::{QuotaDecision, SessionQuotaManager};
use super::signal::ClientSignal;
use super::sticky::StickyBindings;
use crate::concurrency::{ConcurrencyHandle, LimiterRegistry};
use crate::config::CoreConfig;
use crate::error::AdmissionError;
use crate::models::{Account, ChatRequest};
use crate::store::KvStore;

/// 一次请求的会话上下文
#[derive(Debug)]
pub struct SessionContext {
    /// 会话指纹，粘性绑定与配额窗口的键
    pub session_hash: String,
    /// 会话 id，调用方显式提供时优先于指纹
    pub session_id: String,
    pub is_new_session: bool,
    /// 当前的粘性绑定
    pub bound_account: Option<String>,
    /// 摘要校验的请求级缓存
    pub digest_cache: DigestCache,
}

/// 准入请求
#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    pub api_key_id: String,
    /// API Key 级限流配置（JSON 字符串或对象）
    pub api_key_concurrency: Option<serde_json::Value>,
    /// 候选账号，来自外部账号目录
    pub candidates: Vec<Account>,
    pub body: ChatRequest,
}

/// 准入成功后返回的资源凭据
///
/// 持有两级并发槽位；`release` 按 LIFO 顺序释放且幂等。
#[derive(Debug)]
pub struct AdmissionGrant {
    account: Account,
    context: SessionContext,
    quota: QuotaDecision,
    digest: Option<DigestTransition>,
    api_key_handle: ConcurrencyHandle,
    account_handle: ConcurrencyHandle,
}

impl AdmissionGrant {
    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn quota(&self) -> QuotaDecision {
        self.quota
    }

    pub fn digest(&self) -> Option<DigestTransition> {
        self.digest
    }

    pub fn api_key_handle(&self) -> &ConcurrencyHandle {
        &self.api_key_handle
    }

    pub fn account_handle(&self) -> &ConcurrencyHandle {
        &self.account_handle
    }

    /// 按获取的逆序释放全部资源
    pub async fn release(&self) {
        self.account_handle.release().await;
        self.api_key_handle.release().await;
    }
}

/// 会话协调器
///
/// 进程生命周期内构造一次、显式传递；测试各自持有新实例。
pub struct SessionCoordinator {
    store: Arc<dyn KvStore>,
    limiters: LimiterRegistry,
    quota: SessionQuotaManager,
    digests: DigestValidator,
    sticky: StickyBindings,
    /// 同一订阅等级内的轮询索引
    rr_index: AtomicUsize,
}

impl SessionCoordinator {
    pub fn new(store: Arc<dyn KvStore>, config: CoreConfig) -> Self {
        Self {
            limiters: LimiterRegistry::new(Arc::clone(&store), &config),
            quota: SessionQuotaManager::new(Arc::clone(&store)),
            digests: DigestValidator::new(Arc::clone(&store)),
            sticky: StickyBindings::new(Arc::clone(&store), config.session.clone()),
            store,
            rr_index: AtomicUsize::new(0),
        }
    }

    pub fn limiters(&self) -> &LimiterRegistry {
        &self.limiters
    }

    pub fn sticky(&self) -> &StickyBindings {
        &self.sticky
    }

    pub fn quota_manager(&self) -> &SessionQuotaManager {
        &self.quota
    }

    /// 构建会话上下文
    ///
    /// `is_new_session` 为真当且仅当：没有任何非 user 非 system 的
    /// 历史消息、没有粘性绑定、没有摘要记录，且元数据不带续接标记。
    pub async fn build_context(&self, body: &ChatRequest) -> Result<SessionContext, AdmissionError> {
        let session_hash = request_fingerprint(body);
        let session_id = fingerprint::session_id(body, &session_hash);

        let bound_account = self.sticky.bound_account(&session_hash).await?;
        let has_digest_record = self
            .store
            .get(&DigestValidator::digest_key(&session_id))
            .await?
            .is_some();

        let is_new_session = !body.has_assistant_history()
            && bound_account.is_none()
            && !has_digest_record
            && !body.has_resume_indicator();

        tracing::debug!(
            "[Coordinator] 会话 {} (id={}) new={} bound={:?}",
            session_hash,
            session_id,
            is_new_session,
            bound_account
        );

        Ok(SessionContext {
            session_hash,
            session_id,
            is_new_session,
            bound_account,
            digest_cache: DigestCache::new(),
        })
    }

    /// 按会话资格过滤候选账号
    ///
    /// - 新会话：全部可用账号
    /// - 已有会话且绑定到 A：A 加上所有非独占账号
    /// - 已有会话无绑定：剔除全部独占账号
    pub fn filter_eligible<'a>(
        &self,
        ctx: &SessionContext,
        accounts: &'a [Account],
    ) -> Vec<&'a Account> {
        accounts
            .iter()
            .filter(|a| a.is_available())
            .filter(|a| {
                if ctx.is_new_session {
                    return true;
                }
                match &ctx.bound_account {
                    Some(bound) => a.account_id == *bound || !a.exclusive_session_only,
                    None => !a.exclusive_session_only,
                }
            })
            .collect()
    }

    /// 在合格账号中选择一个：绑定账号优先，其余按订阅等级取最优，
    /// 同等级内轮询
    fn select_account<'a>(
        &self,
        ctx: &SessionContext,
        eligible: &[&'a Account],
    ) -> Option<&'a Account> {
        if let Some(bound) = &ctx.bound_account {
            if let Some(account) = eligible.iter().find(|a| &a.account_id == bound) {
                tracing::debug!(
                    "[Coordinator] 复用绑定账号 {} (会话 {})",
                    account.account_id,
                    ctx.session_hash
                );
                return Some(account);
            }
        }

        let best = eligible.iter().map(|a| a.tier_priority()).min()?;
        let top: Vec<&'a Account> = eligible
            .iter()
            .filter(|a| a.tier_priority() == best)
            .copied()
            .collect();
        let index = self.rr_index.fetch_add(1, Ordering::SeqCst) % top.len();
        Some(top[index])
    }

    /// 请求准入
    ///
    /// 成功返回持有全部资源的凭据；失败时已取得的资源按 LIFO 释放。
    pub async fn admit(
        &self,
        request: AdmissionRequest,
        signal: &ClientSignal,
    ) -> Result<AdmissionGrant, AdmissionError> {
        if request.candidates.is_empty() {
            return Err(AdmissionError::InvalidAccountId(
                "候选账号列表为空".to_string(),
            ));
        }

        let mut ctx = self.build_context(&request.body).await?;

        // 绑定账号已从候选列表消失：解绑并重新调度
        if let Some(bound) = ctx.bound_account.clone() {
            if !request.candidates.iter().any(|a| a.account_id == bound) {
                tracing::warn!(
                    "[Coordinator] 绑定账号 {} 已不在候选列表，解绑会话 {}",
                    bound,
                    ctx.session_hash
                );
                self.sticky.unbind(&ctx.session_hash).await?;
                ctx.bound_account = None;
            }
        }

        let api_key_handle = self
            .limiters
            .acquire(
                &request.api_key_id,
                request.api_key_concurrency.as_ref(),
                signal,
            )
            .await?;

        match self.admit_account(&request, &mut ctx, signal).await {
            Ok((account, account_handle, quota, digest)) => {
                self.register_binding(&ctx, &account, &request.body).await;
                Ok(AdmissionGrant {
                    account,
                    context: ctx,
                    quota,
                    digest,
                    api_key_handle,
                    account_handle,
                })
            }
            Err(e) => {
                api_key_handle.release().await;
                Err(e)
            }
        }
    }

    /// 账号选择与账号侧资源获取；失败时回滚账号级槽位
    async fn admit_account(
        &self,
        request: &AdmissionRequest,
        ctx: &mut SessionContext,
        signal: &ClientSignal,
    ) -> Result<
        (
            Account,
            ConcurrencyHandle,
            QuotaDecision,
            Option<DigestTransition>,
        ),
        AdmissionError,
    > {
        let eligible = self.filter_eligible(ctx, &request.candidates);
        if eligible.is_empty() {
            return Err(if ctx.is_new_session {
                AdmissionError::InvalidAccountId("没有可用账号".to_string())
            } else {
                AdmissionError::SessionNotNew
            });
        }

        // 绑定的独占账号先过摘要校验，结果进请求级缓存
        if let Some(bound) = ctx.bound_account.clone() {
            let gate = eligible
                .iter()
                .find(|a| {
                    a.account_id == bound && a.exclusive_session_only && a.enable_message_digest
                })
                .map(|a| (*a).clone());
            if let Some(account) = gate {
                self.digests
                    .validate_and_persist(
                        &ctx.session_id,
                        &request.body.messages,
                        account.session_retention_seconds,
                        &account.account_id,
                        &mut ctx.digest_cache,
                    )
                    .await?;
            }
        }

        let account = match self.select_account(ctx, &eligible) {
            Some(account) => account.clone(),
            None => {
                return Err(AdmissionError::InvalidAccountId(
                    "没有可用账号".to_string(),
                ))
            }
        };

        let account_handle = self
            .limiters
            .acquire(
                &account.account_id,
                account.concurrency_config.as_ref(),
                signal,
            )
            .await?;

        let admitted: Result<(QuotaDecision, Option<DigestTransition>), AdmissionError> = async {
            let quota = self
                .quota
                .admit(
                    &account.account_id,
                    &ctx.session_hash,
                    &account.session_concurrency_config,
                )
                .await?;

            let digest = if account.enable_message_digest {
                Some(
                    self.digests
                        .validate_and_persist(
                            &ctx.session_id,
                            &request.body.messages,
                            account.session_retention_seconds,
                            &account.account_id,
                            &mut ctx.digest_cache,
                        )
                        .await?,
                )
            } else {
                None
            };
            Ok((quota, digest))
        }
        .await;

        match admitted {
            Ok((quota, digest)) => Ok((account, account_handle, quota, digest)),
            Err(e) => {
                account_handle.release().await;
                Err(e)
            }
        }
    }

    /// 选定账号后的绑定注册 / 续期；尽力而为，不影响已完成的准入
    async fn register_binding(&self, ctx: &SessionContext, account: &Account, body: &ChatRequest) {
        if ctx.is_new_session || ctx.bound_account.is_none() {
            if let Err(e) = self.sticky.bind(&ctx.session_hash, &account.account_id).await {
                tracing::warn!(
                    "[Coordinator] 注册绑定失败 (会话 {}): {}",
                    ctx.session_hash,
                    e
                );
            }
            if account.exclusive_session_only && account.enable_message_digest {
                let digest = build_digest(&body.messages);
                if let Err(e) = self
                    .sticky
                    .mark_exclusive_owner(
                        &account.account_id,
                        &ctx.session_hash,
                        &digest,
                        Duration::from_secs(account.session_retention_seconds),
                    )
                    .await
                {
                    tracing::warn!(
                        "[Coordinator] 记录独占属主失败 (会话 {}): {}",
                        ctx.session_hash,
                        e
                    );
                }
            }
            return;
        }

        if let Err(e) = self.sticky.refresh_if_needed(&ctx.session_hash).await {
            tracing::warn!(
                "[Coordinator] 绑定续期失败 (会话 {}): {}",
                ctx.session_hash,
                e
            );
        }
    }
}
