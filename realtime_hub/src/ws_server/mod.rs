//! WebSocket 服务端逻辑模块。

pub mod authenticator;
pub mod broadcaster;
pub mod client_session;
pub mod connection_manager;
pub mod heartbeat_monitor;
pub mod message_router;
pub mod nonce_cache;
pub mod outbound_queue;
pub mod rate_limiter;
pub mod room_manager;
pub mod service;
pub mod stats;
pub mod token_signer;
