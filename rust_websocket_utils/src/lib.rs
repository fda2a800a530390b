//! `rust_websocket_utils` 是一个提供 WebSocket 通信实用功能的 Rust Crate。
//! 它封装了 `tokio-tungstenite` 的细节，供实时订阅中心的服务端与客户端共同使用。
//!
//! 主要模块包括：
//! - `message`: JSON 文本帧的编解码、关闭帧的构造与解析。
//! - `error`: 库中统一使用的错误类型 `WsError`。
//! - `server`: 服务端监听循环，握手阶段捕获请求路径、查询参数与对端地址。
//! - `client`: 客户端连接与消息收发辅助函数。

pub mod client;
pub mod error;
pub mod message;
pub mod server;

pub use error::WsError;
pub use message::CloseInfo;
