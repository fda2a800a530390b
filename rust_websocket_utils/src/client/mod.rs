// rust_websocket_utils/src/client/mod.rs

//! WebSocket 客户端模块。
//!
//! `transport` 子模块提供连接服务器、发送 JSON 消息以及逐条接收并解析消息的函数。
//! 重连、退避与订阅重放等策略不在这一层，由上层的客户端 crate 负责。

pub mod transport;
