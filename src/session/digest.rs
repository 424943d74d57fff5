//! 会话摘要校验器
//!
//! 每个会话维护一条与消息历史一一对应的摘要链：每条非 system 消息
//! 折叠成一个 9 字符单元（角色前缀 + 8 位十六进制哈希），按序拼接。
//! 新请求的摘要与已记录摘要做公共前缀比较，据此把变更分类为
//! create / refresh / append / rollback / branch，其余一律视为
//! 客户端伪造或重排历史而拒绝。
//!
//! 回滚与分叉只在用户轮合法：只有用户消息之后的助手回复才存在
//! 重新生成的语义。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::error::AdmissionError;
use crate::models::{ChatMessage, MessageContent};
use crate::store::KvStore;

/// 摘要单元长度：1 字符角色前缀 + 8 位十六进制
pub const DIGEST_UNIT_LEN: usize = 9;

const USER_PREFIX: char = '-';
const OTHER_PREFIX: char = '_';

/// 摘要变更的分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAction {
    Create,
    Refresh,
    Append,
    Rollback,
    Branch,
}

/// 一次被接受的摘要变更
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DigestTransition {
    pub action: DigestAction,
    pub old_units: usize,
    pub new_units: usize,
    pub common_units: usize,
}

/// 请求级校验缓存：accountId → 校验结果
///
/// 调度器对多个候选账号求值时避免重复校验。
pub type DigestCache = HashMap<String, Result<DigestTransition, AdmissionError>>;

/// 由消息列表构造摘要
///
/// system 消息不参与；空内容按相对序号加盐哈希，避免相邻空消息
/// 互相碰撞。相同消息序列产生相同摘要。
pub fn build_digest(messages: &[ChatMessage]) -> String {
    let mut digest = String::new();
    let mut index = 0usize;
    for msg in messages {
        if msg.is_system() {
            continue;
        }
        let payload = hashable_payload(msg, index);
        let hash = crc32c::crc32c(payload.as_bytes());
        digest.push(if msg.is_user() { USER_PREFIX } else { OTHER_PREFIX });
        digest.push_str(&format!("{:08x}", hash));
        index += 1;
    }
    digest
}

fn empty_salt(index: usize) -> String {
    format!("__empty_message_{}__", index)
}

/// 消息参与哈希的内容：文本消息取原文，结构化内容取确定性 JSON
fn hashable_payload(msg: &ChatMessage, index: usize) -> String {
    match &msg.content {
        None => empty_salt(index),
        Some(MessageContent::Text(s)) if s.is_empty() => empty_salt(index),
        Some(MessageContent::Text(s)) => s.clone(),
        Some(MessageContent::Parts(parts)) if parts.is_empty() => empty_salt(index),
        Some(MessageContent::Parts(parts)) => serde_json::to_string(parts)
            .unwrap_or_else(|_| format!("__unserializable_message_{}__", index)),
    }
}

pub fn unit_count(digest: &str) -> usize {
    digest.len() / DIGEST_UNIT_LEN
}

fn unit_prefix(digest: &str, index: usize) -> Option<char> {
    digest
        .as_bytes()
        .get(index * DIGEST_UNIT_LEN)
        .map(|b| *b as char)
}

/// 从左到右比较 9 字符单元，返回连续相同的单元数
pub fn common_units(old: &str, new: &str) -> usize {
    old.as_bytes()
        .chunks(DIGEST_UNIT_LEN)
        .zip(new.as_bytes().chunks(DIGEST_UNIT_LEN))
        .take_while(|(a, b)| a == b)
        .count()
}

/// 对摘要变更分类
///
/// # 参数
/// - `old`: 已记录的摘要，None/空串表示首次出现
/// - `new`: 本次请求的摘要
///
/// # 返回
/// 合法变更的分类；非法变更返回对应的违规错误
pub fn classify(old: Option<&str>, new: &str) -> Result<DigestTransition, AdmissionError> {
    let old = old.unwrap_or("");
    let new_n = unit_count(new);

    if old.is_empty() {
        return Ok(DigestTransition {
            action: DigestAction::Create,
            old_units: 0,
            new_units: new_n,
            common_units: 0,
        });
    }

    // 记录损坏（长度不是单元整数倍）时与任何历史都不匹配
    if old.len() % DIGEST_UNIT_LEN != 0 {
        return Err(AdmissionError::SessionContentMismatch);
    }

    let old_n = unit_count(old);
    let common = common_units(old, new);

    if old == new {
        return Ok(DigestTransition {
            action: DigestAction::Refresh,
            old_units: old_n,
            new_units: new_n,
            common_units: common,
        });
    }

    if common == 0 {
        return Err(AdmissionError::SessionContentMismatch);
    }

    if new_n > old_n {
        // 只允许单条追加，且旧摘要必须是新摘要的严格前缀
        if new_n == old_n + 1 && common == old_n {
            return Ok(DigestTransition {
                action: DigestAction::Append,
                old_units: old_n,
                new_units: new_n,
                common_units: common,
            });
        }
        return Err(AdmissionError::SessionAppendViolation);
    }

    if new_n < old_n {
        // 新摘要必须是旧摘要的严格前缀，且截断点停在用户轮
        if common == new_n && unit_prefix(new, new_n - 1) == Some(USER_PREFIX) {
            return Ok(DigestTransition {
                action: DigestAction::Rollback,
                old_units: old_n,
                new_units: new_n,
                common_units: common,
            });
        }
        return Err(AdmissionError::SessionRollbackViolation);
    }

    // 等长且存在分歧：最后一个公共单元必须是用户轮
    if unit_prefix(old, common - 1) == Some(USER_PREFIX) {
        return Ok(DigestTransition {
            action: DigestAction::Branch,
            old_units: old_n,
            new_units: new_n,
            common_units: common,
        });
    }
    Err(AdmissionError::SessionBranchViolation)
}

/// 摘要的存储与请求级缓存
pub struct DigestValidator {
    store: Arc<dyn KvStore>,
}

impl DigestValidator {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn digest_key(session_id: &str) -> String {
        format!("claude:session:digest:{}", session_id)
    }

    /// 校验消息历史并持久化新摘要
    ///
    /// 接受（含 refresh）即写入新摘要并重置 TTL；拒绝时不改动记录。
    /// 后端错误不进缓存，其余结果按账号缓存。
    pub async fn validate_and_persist(
        &self,
        session_id: &str,
        messages: &[ChatMessage],
        retention_seconds: u64,
        account_id: &str,
        cache: &mut DigestCache,
    ) -> Result<DigestTransition, AdmissionError> {
        if let Some(cached) = cache.get(account_id) {
            tracing::debug!("[Digest] {} 命中请求级缓存 ({})", session_id, account_id);
            return cached.clone();
        }

        let result = self
            .validate_inner(session_id, messages, retention_seconds)
            .await;
        if !matches!(result, Err(AdmissionError::Backend(_))) {
            cache.insert(account_id.to_string(), result.clone());
        }
        result
    }

    async fn validate_inner(
        &self,
        session_id: &str,
        messages: &[ChatMessage],
        retention_seconds: u64,
    ) -> Result<DigestTransition, AdmissionError> {
        let new_digest = build_digest(messages);
        let key = Self::digest_key(session_id);
        let old = self.store.get(&key).await?;

        let transition = match classify(old.as_deref(), &new_digest) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(
                    "[Digest] {} 拒绝非法变更 {}: {} units -> {} units",
                    session_id,
                    e.code(),
                    old.as_deref().map(unit_count).unwrap_or(0),
                    unit_count(&new_digest)
                );
                return Err(e);
            }
        };

        self.store
            .set(
                &key,
                &new_digest,
                Some(Duration::from_secs(retention_seconds)),
            )
            .await?;

        tracing::debug!(
            "[Digest] {} {:?}: {} -> {} units (common {})",
            session_id,
            transition.action,
            transition.old_units,
            transition.new_units,
            transition.common_units
        );
        Ok(transition)
    }
}
