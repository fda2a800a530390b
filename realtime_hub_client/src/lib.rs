//! `realtime_hub_client` 客户端库。
//!
//! [`ClientReconnector`] 维护到实时订阅中心的一条连接：连接断开后按指数退避重连，
//! 每次重连都会获取新令牌，并按原顺序恢复之前的全部订阅。
//!
//! - `backoff`: 重连延迟策略。
//! - `token_source`: 令牌获取的抽象。
//! - `subscriptions`: 当前订阅的记录。
//! - `reconnector`: 重连主循环与对外句柄。

pub mod backoff;
pub mod error;
pub mod reconnector;
pub mod subscriptions;
pub mod token_source;

pub use backoff::Backoff;
pub use error::ClientError;
pub use reconnector::{ClientEvent, ClientReconnector, ConnectionStatus, ReconnectorConfig};
pub use token_source::{FnTokenProvider, TokenProvider};
