//! 会话管理模块
//!
//! 提供以下功能：
//! - 稳定的会话指纹生成（基于请求内容哈希）
//! - 会话摘要哈希链的构建、分类与持久化
//! - 按账号的滑动窗口会话配额
//! - 粘性会话绑定（会话与账号映射）与续期
//! - 客户端终止信号抽象
//! - 会话协调器：过滤候选账号并编排全部资源的获取与释放

pub mod coordinator;
pub mod digest;
pub mod fingerprint;
pub mod quota;
pub mod signal;
pub mod sticky;

pub use coordinator::{AdmissionGrant, AdmissionRequest, SessionContext, SessionCoordinator};
pub use digest::{
    build_digest, classify, common_units, DigestAction, DigestCache, DigestTransition,
    DigestValidator, DIGEST_UNIT_LEN,
};
pub use fingerprint::request_fingerprint;
pub use quota::{QuotaDecision, SessionQuotaConfig, SessionQuotaManager};
pub use signal::{ClientEvent, ClientSignal, ClientWatch};
pub use sticky::StickyBindings;
