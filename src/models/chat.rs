//! 对话补全请求数据模型
//!
//! 消息内容支持纯文本与结构化内容块两种形态，内容块为带 `type`
//! 标签的联合类型（text / tool_use / tool_result / image），
//! 未识别的块保留原始 JSON 以便确定性序列化。

use serde::{Deserialize, Serialize};

/// 图片来源
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// 已识别的内容块类型
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TypedPart {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: serde_json::Value,
    },
    Image {
        source: ImageSource,
    },
}

/// 内容块：已识别类型或原样保留的未知块
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContentPart {
    Typed(TypedPart),
    Unknown(serde_json::Value),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(MessageContent::Text(text.into())),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: Some(MessageContent::Text(text.into())),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: Some(MessageContent::Text(text.into())),
        }
    }

    pub fn is_system(&self) -> bool {
        self.role == "system"
    }

    pub fn is_user(&self) -> bool {
        self.role == "user"
    }

    /// 提取消息的纯文本内容（忽略非文本块）
    pub fn get_content_text(&self) -> String {
        match &self.content {
            Some(MessageContent::Text(s)) => s.clone(),
            Some(MessageContent::Parts(parts)) => parts
                .iter()
                .filter_map(|p| {
                    if let ContentPart::Typed(TypedPart::Text { text }) = p {
                        Some(text.clone())
                    } else {
                        None
                    }
                })
                .collect::<Vec<_>>()
                .join(""),
            None => String::new(),
        }
    }
}

/// 对话补全请求体
///
/// 只建模核心关心的字段，其余参数原样透传给上游适配层。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: false,
            metadata: None,
            temperature: None,
            max_tokens: None,
        }
    }

    /// 是否已有任何非 user、非 system 的历史消息
    pub fn has_assistant_history(&self) -> bool {
        self.messages
            .iter()
            .any(|m| !m.is_user() && !m.is_system())
    }

    /// 调用方显式提供的会话标识
    ///
    /// 依次尝试 `metadata.session_id`、`metadata.conversation_id`、
    /// `metadata.user_id`，都缺失时返回 None。
    pub fn explicit_session_id(&self) -> Option<String> {
        let meta = self.metadata.as_ref()?;
        for key in ["session_id", "conversation_id", "user_id"] {
            if let Some(v) = meta.get(key).and_then(|v| v.as_str()) {
                let v = v.trim();
                if !v.is_empty() {
                    return Some(v.to_string());
                }
            }
        }
        None
    }

    /// 元数据中是否带有续接会话的标记
    ///
    /// 识别 `resume`、`isResume`、`sessionType ∈ {"resume","existing"}`，
    /// 以及任何 conversation_id / session_id 的出现。
    pub fn has_resume_indicator(&self) -> bool {
        let Some(meta) = self.metadata.as_ref() else {
            return false;
        };
        let truthy = |v: &serde_json::Value| {
            v.as_bool().unwrap_or(false) || v.as_str().map(|s| s == "true").unwrap_or(false)
        };
        if meta.get("resume").map(truthy).unwrap_or(false)
            || meta.get("isResume").map(truthy).unwrap_or(false)
        {
            return true;
        }
        if let Some(t) = meta.get("sessionType").and_then(|v| v.as_str()) {
            if t == "resume" || t == "existing" {
                return true;
            }
        }
        ["conversation_id", "session_id"].iter().any(|k| {
            meta.get(*k)
                .and_then(|v| v.as_str())
                .map(|s| !s.trim().is_empty())
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_part_roundtrip() {
        let raw = r#"[
            {"type": "text", "text": "hello"},
            {"type": "tool_use", "id": "tu_1", "name": "search", "input": {"q": "rust"}},
            {"type": "tool_result", "tool_use_id": "tu_1", "content": "ok"},
            {"type": "thinking", "thinking": "..."}
        ]"#;
        let parts: Vec<ContentPart> = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            parts[0],
            ContentPart::Typed(TypedPart::Text { .. })
        ));
        assert!(matches!(
            parts[1],
            ContentPart::Typed(TypedPart::ToolUse { .. })
        ));
        assert!(matches!(
            parts[2],
            ContentPart::Typed(TypedPart::ToolResult { .. })
        ));
        // 未知块保留原始 JSON
        assert!(matches!(parts[3], ContentPart::Unknown(_)));
    }

    #[test]
    fn test_resume_indicators() {
        let mut req = ChatRequest::new("claude-sonnet-4-5", vec![ChatMessage::user("hi")]);
        assert!(!req.has_resume_indicator());

        req.metadata = Some(serde_json::json!({"resume": true}));
        assert!(req.has_resume_indicator());

        req.metadata = Some(serde_json::json!({"sessionType": "existing"}));
        assert!(req.has_resume_indicator());

        req.metadata = Some(serde_json::json!({"conversation_id": "conv-9"}));
        assert!(req.has_resume_indicator());
        assert_eq!(req.explicit_session_id(), Some("conv-9".to_string()));

        req.metadata = Some(serde_json::json!({"sessionType": "new"}));
        assert!(!req.has_resume_indicator());
    }

    #[test]
    fn test_assistant_history_detection() {
        let req = ChatRequest::new(
            "claude-sonnet-4-5",
            vec![ChatMessage::system("sys"), ChatMessage::user("hi")],
        );
        assert!(!req.has_assistant_history());

        let req = ChatRequest::new(
            "claude-sonnet-4-5",
            vec![
                ChatMessage::user("hi"),
                ChatMessage::assistant("hello"),
                ChatMessage::user("again"),
            ],
        );
        assert!(req.has_assistant_history());
    }
}
