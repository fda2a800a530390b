//! 通用枚举模块。
//!
//! 本模块定义了实时订阅中心服务端与客户端之间共享的通用枚举类型：
//! 连接生命周期状态 (`ConnectionState`) 与应用自定义的 WebSocket 关闭码 (`HubCloseCode`)。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 单个 WebSocket 连接在服务端的生命周期状态。
///
/// 合法的状态迁移只有：
/// `Connecting -> Authenticating -> Active -> Closing -> Closed`，
/// 以及 `Authenticating -> Rejected -> Closed`。
/// 状态一旦前进便不可回退，也不能跳过中间状态。
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum ConnectionState {
    /// TCP/WebSocket 握手已完成，尚未开始校验令牌。
    Connecting = 0,
    /// 正在校验握手携带的令牌。
    Authenticating = 1,
    /// 认证成功，可以订阅并接收事件。
    Active = 2,
    /// 已决定关闭，正在发送关闭帧并清理资源。
    Closing = 3,
    /// 终态。
    Closed = 4,
    /// 认证失败。
    Rejected = 5,
}

impl ConnectionState {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Connecting),
            1 => Some(Self::Authenticating),
            2 => Some(Self::Active),
            3 => Some(Self::Closing),
            4 => Some(Self::Closed),
            5 => Some(Self::Rejected),
            _ => None,
        }
    }

    /// 判断 `self -> next` 是否是一次合法迁移。
    pub const fn can_transition_to(self, next: ConnectionState) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Authenticating)
                | (Self::Authenticating, Self::Active)
                | (Self::Authenticating, Self::Rejected)
                | (Self::Active, Self::Closing)
                | (Self::Closing, Self::Closed)
                | (Self::Rejected, Self::Closed)
        )
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "CONNECTING",
            Self::Authenticating => "AUTHENTICATING",
            Self::Active => "ACTIVE",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
            Self::Rejected => "REJECTED",
        };
        f.write_str(name)
    }
}

/// 服务端在关闭连接时使用的关闭码。
///
/// 1000/1001 为 RFC 6455 标准码，4001 及以上为本应用的自定义码。
/// 客户端的重连策略依赖这些码来区分 "换令牌重连"、"退避后重连" 与 "不再重连"。
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HubCloseCode {
    /// 1000：正常关闭。
    Normal,
    /// 1001：服务端关停或客户端离开。
    GoingAway,
    /// 4001：令牌格式错误或签名不匹配。
    InvalidToken,
    /// 4002：令牌已过期。
    ExpiredToken,
    /// 4003：nonce 已被使用过 (重放)。
    ReplayedNonce,
    /// 4004：连接频率超限。
    RateLimited,
    /// 4005：心跳超时。
    HeartbeatTimeout,
    /// 4006：令牌声明的房间超出用户权限。
    InsufficientPermissions,
    /// 4007：服务端连接数已满。
    ServerAtCapacity,
    /// 4008：客户端连续发送非法消息。
    ProtocolViolation,
}

impl HubCloseCode {
    pub const fn code(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::GoingAway => 1001,
            Self::InvalidToken => 4001,
            Self::ExpiredToken => 4002,
            Self::ReplayedNonce => 4003,
            Self::RateLimited => 4004,
            Self::HeartbeatTimeout => 4005,
            Self::InsufficientPermissions => 4006,
            Self::ServerAtCapacity => 4007,
            Self::ProtocolViolation => 4008,
        }
    }

    pub const fn from_code(code: u16) -> Option<Self> {
        match code {
            1000 => Some(Self::Normal),
            1001 => Some(Self::GoingAway),
            4001 => Some(Self::InvalidToken),
            4002 => Some(Self::ExpiredToken),
            4003 => Some(Self::ReplayedNonce),
            4004 => Some(Self::RateLimited),
            4005 => Some(Self::HeartbeatTimeout),
            4006 => Some(Self::InsufficientPermissions),
            4007 => Some(Self::ServerAtCapacity),
            4008 => Some(Self::ProtocolViolation),
            _ => None,
        }
    }

    /// 与 serde 序列化结果一致的名称，例如 `INVALID_TOKEN`。
    pub const fn name(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::GoingAway => "GOING_AWAY",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::ExpiredToken => "EXPIRED_TOKEN",
            Self::ReplayedNonce => "REPLAYED_NONCE",
            Self::RateLimited => "RATE_LIMITED",
            Self::HeartbeatTimeout => "HEARTBEAT_TIMEOUT",
            Self::InsufficientPermissions => "INSUFFICIENT_PERMISSIONS",
            Self::ServerAtCapacity => "SERVER_AT_CAPACITY",
            Self::ProtocolViolation => "PROTOCOL_VIOLATION",
        }
    }

    /// 关闭帧中附带的默认原因文本。
    pub const fn default_reason(self) -> &'static str {
        match self {
            Self::Normal => "normal closure",
            Self::GoingAway => "going away",
            Self::InvalidToken => "invalid token",
            Self::ExpiredToken => "token expired",
            Self::ReplayedNonce => "nonce already used",
            Self::RateLimited => "rate limited",
            Self::HeartbeatTimeout => "heartbeat timeout",
            Self::InsufficientPermissions => "insufficient permissions",
            Self::ServerAtCapacity => "server at capacity",
            Self::ProtocolViolation => "protocol violation",
        }
    }

    /// 该关闭码是否意味着当前令牌已不可再用 (客户端需要换新令牌)。
    pub const fn requires_fresh_token(self) -> bool {
        matches!(
            self,
            Self::InvalidToken | Self::ExpiredToken | Self::ReplayedNonce
        )
    }
}

impl fmt::Display for HubCloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.name())
    }
}
