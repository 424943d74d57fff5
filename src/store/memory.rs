//! 进程内存储后端
//!
//! dashmap 按键分片，复合操作在条目锁内同步完成，不跨 await 点，
//! 因此与脚本型后端的原子性等价。TTL 为惰性过期：访问时发现
//! 过期即视同不存在并移除。

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::time::Duration;

use super::{KvStore, SessionAdmitOutcome, StoreError};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Int(i64),
    Zset(BTreeMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    /// epoch 毫秒；None 表示不过期
    expires_at: Option<i64>,
}

impl Entry {
    fn fresh(&self, now_ms: i64) -> bool {
        match self.expires_at {
            Some(at) => at > now_ms,
            None => true,
        }
    }
}

/// 内存 KV 存储
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn expiry(ttl: Option<Duration>, now_ms: i64) -> Option<i64> {
        ttl.map(|d| now_ms + d.as_millis() as i64)
    }

    /// 在条目锁内执行 `f`；过期条目先移除再当作不存在处理。
    /// `f` 返回 None 时表示条目应被删除。
    fn with_entry<T>(
        &self,
        key: &str,
        now_ms: i64,
        f: impl FnOnce(Option<Entry>) -> (Option<Entry>, Result<T, StoreError>),
    ) -> Result<T, StoreError> {
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                let current = if occupied.get().fresh(now_ms) {
                    Some(occupied.get().clone())
                } else {
                    None
                };
                let (next, result) = f(current);
                match next {
                    Some(entry) => {
                        occupied.insert(entry);
                    }
                    None => {
                        occupied.remove();
                    }
                }
                result
            }
            MapEntry::Vacant(vacant) => {
                let (next, result) = f(None);
                if let Some(entry) = next {
                    vacant.insert(entry);
                }
                result
            }
        }
    }

    fn zset_of(entry: Option<Entry>, key: &str) -> Result<BTreeMap<String, f64>, StoreError> {
        match entry {
            Some(Entry {
                value: Value::Zset(set),
                ..
            }) => Ok(set),
            Some(_) => Err(StoreError::WrongType {
                key: key.to_string(),
            }),
            None => Ok(BTreeMap::new()),
        }
    }

    /// 当前条目数（含尚未惰性清理的过期条目），测试用
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_entry(key, Self::now_ms(), |entry| match entry {
            Some(e) => match &e.value {
                Value::Str(s) => {
                    let s = s.clone();
                    (Some(e), Ok(Some(s)))
                }
                Value::Int(i) => {
                    let s = i.to_string();
                    (Some(e), Ok(Some(s)))
                }
                Value::Zset(_) => (
                    Some(e),
                    Err(StoreError::WrongType {
                        key: key.to_string(),
                    }),
                ),
            },
            None => (None, Ok(None)),
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let now = Self::now_ms();
        self.with_entry(key, now, |_| {
            (
                Some(Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: Self::expiry(ttl, now),
                }),
                Ok(()),
            )
        })
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        self.with_entry(key, Self::now_ms(), |entry| (None, Ok(entry.is_some())))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Self::now_ms();
        self.with_entry(key, now, |entry| match entry {
            Some(mut e) => {
                e.expires_at = Self::expiry(Some(ttl), now);
                (Some(e), Ok(true))
            }
            None => (None, Ok(false)),
        })
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let now = Self::now_ms();
        self.with_entry(key, now, |entry| match entry {
            Some(e) => {
                let remaining = e
                    .expires_at
                    .map(|at| Duration::from_millis((at - now).max(0) as u64));
                (Some(e), Ok(remaining))
            }
            None => (None, Ok(None)),
        })
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.with_entry(key, Self::now_ms(), |entry| match entry {
            Some(mut e) => match e.value {
                Value::Int(i) => {
                    e.value = Value::Int(i + 1);
                    (Some(e), Ok(i + 1))
                }
                _ => (
                    Some(e),
                    Err(StoreError::WrongType {
                        key: key.to_string(),
                    }),
                ),
            },
            None => (
                Some(Entry {
                    value: Value::Int(1),
                    expires_at: None,
                }),
                Ok(1),
            ),
        })
    }

    async fn decr(&self, key: &str) -> Result<i64, StoreError> {
        self.with_entry(key, Self::now_ms(), |entry| match entry {
            Some(mut e) => match e.value {
                Value::Int(i) => {
                    e.value = Value::Int(i - 1);
                    (Some(e), Ok(i - 1))
                }
                _ => (
                    Some(e),
                    Err(StoreError::WrongType {
                        key: key.to_string(),
                    }),
                ),
            },
            None => (
                Some(Entry {
                    value: Value::Int(-1),
                    expires_at: None,
                }),
                Ok(-1),
            ),
        })
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool, StoreError> {
        self.with_entry(key, Self::now_ms(), |entry| {
            let expires_at = entry.as_ref().and_then(|e| e.expires_at);
            let mut set = match Self::zset_of(entry, key) {
                Ok(set) => set,
                Err(e) => return (None, Err(e)),
            };
            let added = set.insert(member.to_string(), score).is_none();
            (
                Some(Entry {
                    value: Value::Zset(set),
                    expires_at,
                }),
                Ok(added),
            )
        })
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.with_entry(key, Self::now_ms(), |entry| {
            let expires_at = entry.as_ref().and_then(|e| e.expires_at);
            let mut set = match Self::zset_of(entry, key) {
                Ok(set) => set,
                Err(e) => return (None, Err(e)),
            };
            let removed = set.remove(member).is_some();
            if set.is_empty() {
                (None, Ok(removed))
            } else {
                (
                    Some(Entry {
                        value: Value::Zset(set),
                        expires_at,
                    }),
                    Ok(removed),
                )
            }
        })
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        self.with_entry(key, Self::now_ms(), |entry| match entry {
            Some(e) => match &e.value {
                Value::Zset(set) => {
                    let score = set.get(member).copied();
                    (Some(e), Ok(score))
                }
                _ => (
                    Some(e),
                    Err(StoreError::WrongType {
                        key: key.to_string(),
                    }),
                ),
            },
            None => (None, Ok(None)),
        })
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        self.with_entry(key, Self::now_ms(), |entry| match entry {
            Some(e) => match &e.value {
                Value::Zset(set) => {
                    let n = set.len() as u64;
                    (Some(e), Ok(n))
                }
                _ => (
                    Some(e),
                    Err(StoreError::WrongType {
                        key: key.to_string(),
                    }),
                ),
            },
            None => (None, Ok(0)),
        })
    }

    async fn zrange(&self, key: &str) -> Result<Vec<(String, f64)>, StoreError> {
        self.with_entry(key, Self::now_ms(), |entry| match entry {
            Some(e) => match &e.value {
                Value::Zset(set) => {
                    let mut members: Vec<(String, f64)> =
                        set.iter().map(|(m, s)| (m.clone(), *s)).collect();
                    members.sort_by(|a, b| {
                        a.1.partial_cmp(&b.1)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| a.0.cmp(&b.0))
                    });
                    (Some(e), Ok(members))
                }
                _ => (
                    Some(e),
                    Err(StoreError::WrongType {
                        key: key.to_string(),
                    }),
                ),
            },
            None => (None, Ok(Vec::new())),
        })
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError> {
        self.with_entry(key, Self::now_ms(), |entry| {
            let expires_at = entry.as_ref().and_then(|e| e.expires_at);
            let mut set = match Self::zset_of(entry, key) {
                Ok(set) => set,
                Err(e) => return (None, Err(e)),
            };
            let before = set.len();
            set.retain(|_, score| *score < min || *score > max);
            let removed = (before - set.len()) as u64;
            if set.is_empty() {
                (None, Ok(removed))
            } else {
                (
                    Some(Entry {
                        value: Value::Zset(set),
                        expires_at,
                    }),
                    Ok(removed),
                )
            }
        })
    }

    async fn admit_session(
        &self,
        key: &str,
        fingerprint: &str,
        now_ms: i64,
        window: Duration,
        max_sessions: u64,
    ) -> Result<SessionAdmitOutcome, StoreError> {
        let window_ms = window.as_millis() as i64;
        self.with_entry(key, now_ms, |entry| {
            let mut set = match Self::zset_of(entry, key) {
                Ok(set) => set,
                Err(e) => return (None, Err(e)),
            };
            let expires_at = Some(now_ms + window_ms);

            if set.contains_key(fingerprint) {
                set.insert(fingerprint.to_string(), now_ms as f64);
                let current = set.len() as u64;
                return (
                    Some(Entry {
                        value: Value::Zset(set),
                        expires_at,
                    }),
                    Ok(SessionAdmitOutcome::Existing { current }),
                );
            }

            // 清掉窗口外的会话
            let floor = (now_ms - window_ms) as f64;
            set.retain(|_, score| *score > floor);

            let current = set.len() as u64;
            if current >= max_sessions {
                let next = if set.is_empty() {
                    None
                } else {
                    Some(Entry {
                        value: Value::Zset(set),
                        expires_at,
                    })
                };
                return (next, Ok(SessionAdmitOutcome::Rejected { current }));
            }

            set.insert(fingerprint.to_string(), now_ms as f64);
            let current = set.len() as u64;
            (
                Some(Entry {
                    value: Value::Zset(set),
                    expires_at,
                }),
                Ok(SessionAdmitOutcome::Added { current }),
            )
        })
    }

    async fn try_acquire_slot(
        &self,
        key: &str,
        member: &str,
        max: u64,
        lease: Duration,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let lease_ms = lease.as_millis() as i64;
        self.with_entry(key, now_ms, |entry| {
            let mut set = match Self::zset_of(entry, key) {
                Ok(set) => set,
                Err(e) => return (None, Err(e)),
            };
            // 清掉租约已过期的槽位
            set.retain(|_, score| *score > now_ms as f64);

            if (set.len() as u64) < max {
                set.insert(member.to_string(), (now_ms + lease_ms) as f64);
                (
                    Some(Entry {
                        value: Value::Zset(set),
                        // 键 TTL 以最长租约为界
                        expires_at: Some(now_ms + lease_ms),
                    }),
                    Ok(true),
                )
            } else {
                let next = if set.is_empty() {
                    None
                } else {
                    Some(Entry {
                        value: Value::Zset(set),
                        expires_at: Some(now_ms + lease_ms),
                    })
                };
                (next, Ok(false))
            }
        })
    }

    async fn enter_queue(&self, key: &str, idle_ttl: Duration) -> Result<i64, StoreError> {
        let now = Self::now_ms();
        self.with_entry(key, now, |entry| match entry {
            Some(mut e) => match e.value {
                Value::Int(i) => {
                    e.value = Value::Int(i + 1);
                    e.expires_at = Self::expiry(Some(idle_ttl), now);
                    (Some(e), Ok(i + 1))
                }
                _ => (
                    Some(e),
                    Err(StoreError::WrongType {
                        key: key.to_string(),
                    }),
                ),
            },
            None => (
                Some(Entry {
                    value: Value::Int(1),
                    expires_at: Self::expiry(Some(idle_ttl), now),
                }),
                Ok(1),
            ),
        })
    }
}
