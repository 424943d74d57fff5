//! 会话指纹
//!
//! 根据请求内容生成稳定的会话指纹，作为粘性绑定与滑动窗口的键。
//! 锚定首条有意义的用户消息而非整个消息数组，保证同一会话在
//! 多轮往返与重试之间指纹不变。

use sha2::{Digest, Sha256};

use crate::models::ChatRequest;

/// 锚定消息的最小长度，过短的消息多为探测请求
const MIN_ANCHOR_LEN: usize = 10;

/// 生成稳定的会话指纹
///
/// 策略：模型名称混入首条有意义的用户消息内容，SHA256 取前 16 位。
///
/// # 返回
/// 形如 `sid-{hash前16位}` 的指纹
pub fn request_fingerprint(request: &ChatRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.model.as_bytes());

    let mut content_found = false;
    for msg in &request.messages {
        if !msg.is_user() {
            continue;
        }
        let text = msg.get_content_text();
        let clean_text = text.trim();
        if clean_text.len() > MIN_ANCHOR_LEN && !clean_text.contains("<system-reminder>") {
            hasher.update(clean_text.as_bytes());
            content_found = true;
            break;
        }
    }

    if !content_found {
        // 没有可锚定的内容时退化为对最后一条消息哈希
        if let Some(last) = request.messages.last() {
            hasher.update(last.get_content_text().as_bytes());
        }
    }

    let hash = format!("{:x}", hasher.finalize());
    format!("sid-{}", &hash[..16])
}

/// 请求的会话标识
///
/// 调用方显式提供的 id 优先于指纹。
pub fn session_id(request: &ChatRequest, fingerprint: &str) -> String {
    request
        .explicit_session_id()
        .unwrap_or_else(|| fingerprint.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChatMessage;

    #[test]
    fn test_fingerprint_stability() {
        let request = ChatRequest::new(
            "claude-sonnet-4-5",
            vec![ChatMessage::user("Hello, how are you today?")],
        );
        let fp1 = request_fingerprint(&request);
        let fp2 = request_fingerprint(&request);
        assert_eq!(fp1, fp2, "same request should generate same fingerprint");
        assert!(fp1.starts_with("sid-"));
        assert_eq!(fp1.len(), 4 + 16);
    }

    #[test]
    fn test_fingerprint_stable_across_turns() {
        let first = ChatRequest::new(
            "claude-sonnet-4-5",
            vec![ChatMessage::user("Tell me about lifetimes in Rust")],
        );
        let later = ChatRequest::new(
            "claude-sonnet-4-5",
            vec![
                ChatMessage::user("Tell me about lifetimes in Rust"),
                ChatMessage::assistant("Lifetimes describe..."),
                ChatMessage::user("And what about 'static?"),
            ],
        );
        assert_eq!(request_fingerprint(&first), request_fingerprint(&later));
    }

    #[test]
    fn test_different_content_different_fingerprint() {
        let a = ChatRequest::new(
            "claude-sonnet-4-5",
            vec![ChatMessage::user("Hello, how are you today?")],
        );
        let b = ChatRequest::new(
            "claude-sonnet-4-5",
            vec![ChatMessage::user("What is the weather like today?")],
        );
        assert_ne!(request_fingerprint(&a), request_fingerprint(&b));
    }

    #[test]
    fn test_model_mixes_into_fingerprint() {
        let messages = vec![ChatMessage::user("Hello, how are you today?")];
        let a = ChatRequest::new("claude-sonnet-4-5", messages.clone());
        let b = ChatRequest::new("claude-opus-4-5", messages);
        assert_ne!(request_fingerprint(&a), request_fingerprint(&b));
    }

    #[test]
    fn test_explicit_session_id_preferred() {
        let mut request = ChatRequest::new(
            "claude-sonnet-4-5",
            vec![ChatMessage::user("Hello, how are you today?")],
        );
        let fp = request_fingerprint(&request);
        assert_eq!(session_id(&request, &fp), fp);

        request.metadata = Some(serde_json::json!({"user_id": "user-42"}));
        assert_eq!(session_id(&request, &fp), "user-42");
    }
}
