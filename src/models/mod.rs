//! 数据模型
//!
//! - 对话补全请求体与消息内容块
//! - 外部账号目录提供的账号描述

mod account;
mod chat;

pub use account::{Account, AccountStatus, Platform};
pub use chat::{ChatMessage, ChatRequest, ContentPart, ImageSource, MessageContent, TypedPart};
