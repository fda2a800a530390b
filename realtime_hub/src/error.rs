//! 实时订阅中心的错误类型。
//!
//! 每一类错误都能映射到线上的错误码 (`ErrorCode`) 或关闭码 (`HubCloseCode`)，
//! 由调用方决定是回复 `error` 消息还是关闭连接。

use common_models::enums::HubCloseCode;
use common_models::topics::FilterError;
use common_models::ws_payloads::ErrorCode;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// 握手认证失败的原因。任何一种都会使连接停留在 REJECTED，永远不会进入 ACTIVE。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("令牌参数格式错误: {0}")]
    Malformed(String),
    #[error("令牌签名不匹配")]
    InvalidSignature,
    #[error("令牌已于 {expires_at} 过期")]
    Expired { expires_at: i64 },
    #[error("nonce 已被使用")]
    Replayed,
    #[error("令牌权限不足: {0}")]
    InsufficientPermissions(String),
}

impl AuthError {
    pub fn close_code(&self) -> HubCloseCode {
        match self {
            AuthError::Malformed(_) | AuthError::InvalidSignature => HubCloseCode::InvalidToken,
            AuthError::Expired { .. } => HubCloseCode::ExpiredToken,
            AuthError::Replayed => HubCloseCode::ReplayedNonce,
            AuthError::InsufficientPermissions(_) => HubCloseCode::InsufficientPermissions,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AuthError::Malformed(_) => "MALFORMED",
            AuthError::InvalidSignature => "INVALID_SIGNATURE",
            AuthError::Expired { .. } => "EXPIRED",
            AuthError::Replayed => "REPLAYED",
            AuthError::InsufficientPermissions(_) => "INSUFFICIENT_PERMISSIONS",
        }
    }
}

/// 签发令牌时的策略拒绝。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenIssueError {
    #[error("未知主题: {0}")]
    UnknownTopic(String),
    #[error("主题 {0} 只向已登录用户开放")]
    UserRequired(String),
}

/// 被限流的操作。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateOp {
    Connect,
    Subscribe,
}

/// 限流维度。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitScope {
    Ip,
    User,
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{op:?} 操作在 {scope:?} 维度上超出频率限制，{retry_after:?} 后可重试")]
pub struct RateLimitError {
    pub op: RateOp,
    pub scope: LimitScope,
    pub retry_after: Duration,
}

impl RateLimitError {
    /// 向上取整的重试秒数，至少为 1。
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_secs() + u64::from(self.retry_after.subsec_nanos() > 0);
        secs.max(1)
    }
}

/// 订阅/退订请求失败的原因。连接本身保持 ACTIVE。
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SubscribeError {
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error("无权订阅主题 {0}")]
    Forbidden(String),
    #[error(transparent)]
    RateLimited(#[from] RateLimitError),
    #[error("房间总数已达上限 {0}")]
    RoomLimitReached(usize),
    #[error("单连接订阅数已达上限 {0}")]
    ConnectionRoomLimitReached(usize),
    #[error("未订阅房间 {0}")]
    NotSubscribed(String),
    #[error("连接不处于 ACTIVE 状态")]
    NotActive,
    #[error("退订请求既没有 room_key 也没有 topic")]
    MissingTarget,
}

impl SubscribeError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            SubscribeError::Filter(FilterError::UnknownTopic(_)) => ErrorCode::UnknownTopic,
            SubscribeError::Filter(_) => ErrorCode::InvalidFilter,
            SubscribeError::Forbidden(_) => ErrorCode::InsufficientPermissions,
            SubscribeError::RateLimited(_) => ErrorCode::RateLimited,
            SubscribeError::RoomLimitReached(_) => ErrorCode::RoomLimitReached,
            SubscribeError::ConnectionRoomLimitReached(_) => ErrorCode::ConnectionRoomLimitReached,
            SubscribeError::NotSubscribed(_) => ErrorCode::NotSubscribed,
            SubscribeError::NotActive | SubscribeError::MissingTarget => ErrorCode::InvalidMessage,
        }
    }

    /// 是否计入连接的协议错误次数。
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, SubscribeError::Filter(_) | SubscribeError::MissingTarget)
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            SubscribeError::RateLimited(e) => Some(e.retry_after_secs()),
            _ => None,
        }
    }
}

/// 客户端消息无法解析。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("无法解析的消息: {0}")]
    Malformed(String),
    #[error("不支持二进制帧")]
    BinaryFrame,
}

/// 连接注册表错误。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("连接数已达上限 {0}")]
    AtCapacity(usize),
    #[error("非法的状态迁移: {from} -> {to}")]
    IllegalTransition {
        from: common_models::enums::ConnectionState,
        to: common_models::enums::ConnectionState,
    },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("读取配置文件 {path:?} 失败: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("解析配置文件 {path:?} 失败: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("配置无效: {0}")]
    Invalid(String),
}

/// 应用的主要错误类型
#[derive(Error, Debug)]
pub enum AppError {
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),

    #[error("WebSocket 服务错误: {0}")]
    WebSocket(#[from] rust_websocket_utils::error::WsError),

    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_error_close_codes() {
        assert_eq!(AuthError::InvalidSignature.close_code().code(), 4001);
        assert_eq!(AuthError::Malformed("x".into()).close_code().code(), 4001);
        assert_eq!(AuthError::Expired { expires_at: 1 }.close_code().code(), 4002);
        assert_eq!(AuthError::Replayed.close_code().code(), 4003);
        assert_eq!(AuthError::InsufficientPermissions("p".into()).close_code().code(), 4006);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let e = RateLimitError {
            op: RateOp::Subscribe,
            scope: LimitScope::User,
            retry_after: Duration::from_millis(1_200),
        };
        assert_eq!(e.retry_after_secs(), 2);
        let e = RateLimitError { retry_after: Duration::from_millis(10), ..e };
        assert_eq!(e.retry_after_secs(), 1, "重试提示至少为 1 秒");
    }

    #[test]
    fn test_subscribe_error_codes() {
        let unknown = SubscribeError::from(FilterError::UnknownTopic("x".into()));
        assert_eq!(unknown.error_code(), ErrorCode::UnknownTopic);
        assert!(unknown.is_protocol_error());
        let limited = SubscribeError::RateLimited(RateLimitError {
            op: RateOp::Subscribe,
            scope: LimitScope::Ip,
            retry_after: Duration::from_secs(3),
        });
        assert_eq!(limited.error_code(), ErrorCode::RateLimited);
        assert_eq!(limited.retry_after_secs(), Some(3));
        assert!(!limited.is_protocol_error(), "限流不应计入协议错误");
    }
}
