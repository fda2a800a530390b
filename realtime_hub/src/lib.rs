//! `realtime_hub` 实时订阅中心服务端核心库。
//!
//! 主要模块包括：
//! - `api`: 管理 HTTP 接口 (状态查询、房间列表、测试广播、令牌签发)。
//! - `config`: 应用配置的加载、环境变量覆盖与校验。
//! - `error`: 应用特定的错误类型。
//! - `state`: 所有组件组成的全局共享状态。
//! - `ws_server`: WebSocket 服务端，包括握手认证、限流、连接与房间管理、心跳检测和广播。

pub mod api;
pub mod config;
pub mod error;
pub mod state;
pub mod ws_server;
