// rust_websocket_utils/src/server/mod.rs

//! WebSocket 服务端模块。
//!
//! 主要职责包括：
//! - **服务器启动与监听**: 在指定地址上接受 TCP 连接，并为每个连接派生独立任务完成 WebSocket 握手。
//! - **握手信息捕获**: 在握手回调中记录请求路径与查询参数 (令牌等认证信息通过查询参数传递)，
//!   路径不匹配时直接以 HTTP 404 拒绝升级。
//! - **优雅关闭**: 监听循环可以在外部关闭信号到来时退出。

pub mod transport;
