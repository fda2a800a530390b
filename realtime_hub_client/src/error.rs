//! 客户端错误类型。

use common_models::topics::FilterError;
use rust_websocket_utils::error::WsError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("传输错误: {0}")]
    Transport(#[from] WsError),

    #[error("获取令牌失败: {0}")]
    Token(String),

    #[error("订阅参数无效: {0}")]
    InvalidSubscription(#[from] FilterError),

    #[error("无效的服务端地址: {0}")]
    InvalidUrl(String),

    #[error("等待 welcome 超时")]
    HandshakeTimeout,

    /// 连接建立后超过时限没有收到任何服务端消息，视为半开连接。
    #[error("超过 {0:?} 未收到服务端消息")]
    IdleTimeout(Duration),

    /// 客户端已关闭或重连循环已放弃。
    #[error("客户端已停止")]
    Stopped,
}
