//! `common_models` 公共模型库 crate。
//!
//! 本 crate 集中定义了实时订阅中心 (`realtime_hub`) 服务端与
//! 客户端 (`realtime_hub_client`) 之间共享的线上数据结构：
//!
//! - **WebSocket 消息 (`ws_payloads`)**: 客户端→服务端的 `subscribe` / `unsubscribe` / `pong`，
//!   以及服务端→客户端的 `welcome` / `subscribed` / `event` / `ping` / `error` 等消息。
//! - **主题与过滤器 (`topics`)**: 已知主题的枚举、每个主题的强类型过滤器，以及规范化的房间键 (`RoomKey`)。
//! - **通用枚举 (`enums`)**: 连接状态机状态、应用自定义关闭码。
//! - **认证 (`auth`)**: 令牌签发接口返回的 `TokenGrant` 及握手查询参数名。
//! - **管理接口 (`management`)**: `/status`、`/rooms`、`/broadcast/test` 的请求与响应体。
//!
//! 所有模型都派生 `Serialize` / `Deserialize` / `Debug` / `Clone`，以保证两端结构一致。

pub mod auth;
pub mod enums;
pub mod management;
pub mod topics;
pub mod ws_payloads;

pub use auth::{TokenGrant, TokenRequest};
pub use enums::{ConnectionState, HubCloseCode};
pub use topics::{FilterError, RoomKey, Subscription, Topic};
pub use ws_payloads::{ClientMessage, ErrorBody, ErrorCode, ServerMessage};
