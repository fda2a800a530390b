// rust_websocket_utils/src/message.rs

//! JSON 文本帧与关闭帧的辅助函数。
//!
//! 业务消息一律以 JSON 文本帧传输，`encode_text` / `decode_text` 负责两者之间的转换；
//! 关闭帧携带数值关闭码与原因文本，`close_message` / `CloseInfo` 负责构造和解析。

use crate::error::WsError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::borrow::Cow;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

pub use tokio_tungstenite::tungstenite::protocol::Message;

/// 将任意可序列化的值编码为一个 WebSocket 文本帧。
pub fn encode_text<T: Serialize>(value: &T) -> Result<Message, WsError> {
    serde_json::to_string(value)
        .map(Message::Text)
        .map_err(|e| WsError::SerializationError(format!("消息序列化为JSON失败: {}", e)))
}

/// 将文本帧内容解析为目标类型。
pub fn decode_text<T: DeserializeOwned>(text: &str) -> Result<T, WsError> {
    serde_json::from_str(text)
        .map_err(|e| WsError::DeserializationError(format!("{} (原始文本长度 {} 字节)", e, text.len())))
}

/// 构造一个带关闭码与原因的关闭帧。
///
/// RFC 6455 规定控制帧负载不超过 125 字节，关闭码占 2 字节，因此原因文本会在字符边界处截断到 123 字节以内。
pub fn close_message(code: u16, reason: impl Into<String>) -> Message {
    let mut reason = reason.into();
    if reason.len() > 123 {
        let mut cut = 123;
        while !reason.is_char_boundary(cut) {
            cut -= 1;
        }
        reason.truncate(cut);
    }
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: Cow::Owned(reason),
    }))
}

/// 对端关闭帧中携带的信息。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    pub fn from_frame(frame: &CloseFrame<'_>) -> Self {
        CloseInfo {
            code: u16::from(frame.code),
            reason: frame.reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Probe {
        content: String,
    }

    #[test]
    fn test_encode_decode_text() {
        let msg = encode_text(&Probe { content: "你好".into() }).expect("编码失败");
        let text = match msg {
            Message::Text(t) => t,
            other => panic!("期望文本帧，实际为 {:?}", other),
        };
        let back: Probe = decode_text(&text).expect("解码失败");
        assert_eq!(back.content, "你好");

        let err = decode_text::<Probe>("{not json").expect_err("非法 JSON 应解码失败");
        assert!(matches!(err, WsError::DeserializationError(_)));
    }

    #[test]
    /// 测试关闭帧的关闭码保持不变，且过长的原因会被截断在字符边界上。
    fn test_close_message_code_and_truncation() {
        let long_reason = "超".repeat(100);
        match close_message(4005, long_reason) {
            Message::Close(Some(frame)) => {
                let info = CloseInfo::from_frame(&frame);
                assert_eq!(info.code, 4005);
                assert!(info.reason.len() <= 123, "原因文本应被截断到 123 字节以内");
                assert!(info.reason.chars().all(|c| c == '超'));
            }
            other => panic!("期望关闭帧，实际为 {:?}", other),
        }
    }
}
