//! WebSocket 文本帧中传输的 JSON 消息定义。
//!
//! 所有消息都以 `type` 字段区分种类 (serde 内部标签)。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// 客户端发往服务端的消息。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        topic: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<Map<String, Value>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    /// 退订可以给出 `topic` + `filter`，也可以直接给出 `subscribed` 回执中的 `room_key`。
    Unsubscribe {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        topic: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<Map<String, Value>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
}

/// 服务端发往客户端的消息。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// 连接被提升为 ACTIVE 后立即发送。
    Welcome {
        connection_id: String,
        heartbeat_interval_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    Subscribed {
        room_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Unsubscribed {
        room_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    /// 房间事件。`payload` 对核心层不透明，一次发布的所有成员共享同一份数据。
    Event {
        room_key: String,
        sequence: u64,
        payload: Arc<Value>,
    },
    Ping {
        timestamp: i64,
    },
    Error {
        error: ErrorBody,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl ServerMessage {
    /// 消息种类名 (与 `type` 字段一致)，用于背压策略中的 "受保护种类" 判断。
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Welcome { .. } => "welcome",
            ServerMessage::Subscribed { .. } => "subscribed",
            ServerMessage::Unsubscribed { .. } => "unsubscribed",
            ServerMessage::Event { .. } => "event",
            ServerMessage::Ping { .. } => "ping",
            ServerMessage::Error { .. } => "error",
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>, request_id: Option<String>) -> Self {
        ServerMessage::Error {
            error: ErrorBody {
                code,
                message: message.into(),
                retry_after: None,
            },
            request_id,
        }
    }
}

/// `error` 消息中的错误体。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    /// 建议的重试等待秒数 (仅限流错误携带)。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// 握手之后通过 `error` 消息返回给客户端的错误码。
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RateLimited,
    InsufficientPermissions,
    InvalidMessage,
    UnknownTopic,
    InvalidFilter,
    NotSubscribed,
    RoomLimitReached,
    ConnectionRoomLimitReached,
    /// 本版本未识别的错误码。
    #[serde(other)]
    Unknown,
}
