//! 负责处理 ACTIVE 连接发来的文本消息，并根据消息类型进行分发处理。
//!
//! 失败的请求以 `error` 消息回复，连接保持 ACTIVE；无法解析的消息、二进制帧与非法过滤器
//! 计入连接的协议错误次数，达到阈值后以 4008 关闭连接。

use crate::error::{ProtocolError, SubscribeError};
use crate::state::HubState;
use crate::ws_server::client_session::ClientSession;
use crate::ws_server::room_manager::SubscribeOutcome;
use common_models::enums::HubCloseCode;
use common_models::topics::{RoomKey, Subscription};
use common_models::ws_payloads::{ClientMessage, ErrorBody, ErrorCode, ServerMessage};
use log::{debug, warn};
use rust_websocket_utils::message::decode_text;
use serde_json::{Map, Value};

/// 处理一条文本消息。
pub async fn handle_text(state: &HubState, session: &ClientSession, text: &str) {
    let message: ClientMessage = match decode_text(text) {
        Ok(m) => m,
        Err(e) => {
            record_protocol_error(state, session, ProtocolError::Malformed(e.to_string()));
            return;
        }
    };
    debug!("[消息路由] 连接 {} 收到消息: {:?}", session.connection_id, message);

    match message {
        ClientMessage::Subscribe { topic, filter, request_id } => {
            let filter = filter.unwrap_or_default();
            match subscribe(state, session, &topic, &filter) {
                Ok(room_key) => {
                    session.send(ServerMessage::Subscribed {
                        room_key: room_key.to_string(),
                        request_id,
                    });
                }
                Err(e) => reply_error(state, session, e, request_id),
            }
        }
        ClientMessage::Unsubscribe { topic, filter, room_key, request_id } => {
            match unsubscribe(state, session, topic.as_deref(), filter, room_key.as_deref()) {
                Ok(room_key) => {
                    session.send(ServerMessage::Unsubscribed {
                        room_key: room_key.to_string(),
                        request_id,
                    });
                }
                Err(e) => reply_error(state, session, e, request_id),
            }
        }
        ClientMessage::Pong { .. } => session.touch_pong().await,
    }
}

/// 二进制帧不属于协议的一部分。
pub fn handle_binary(state: &HubState, session: &ClientSession) {
    record_protocol_error(state, session, ProtocolError::BinaryFrame);
}

fn subscribe(
    state: &HubState,
    session: &ClientSession,
    topic: &str,
    filter: &Map<String, Value>,
) -> Result<RoomKey, SubscribeError> {
    let user_id = session.user_id();
    state
        .rate_limiter
        .check_subscribe(session.addr.ip(), user_id.as_deref())?;
    let subscription = Subscription::parse(topic, filter)?;
    if !session.may_subscribe(subscription.topic()) {
        return Err(SubscribeError::Forbidden(subscription.topic().to_string()));
    }
    let (key, outcome) = state.rooms.subscribe(session, &subscription)?;
    if outcome == SubscribeOutcome::AlreadySubscribed {
        debug!("[消息路由] 连接 {} 重复订阅 {}，保持原状", session.connection_id, key);
    }
    Ok(key)
}

fn unsubscribe(
    state: &HubState,
    session: &ClientSession,
    topic: Option<&str>,
    filter: Option<Map<String, Value>>,
    room_key: Option<&str>,
) -> Result<RoomKey, SubscribeError> {
    let subscription = match (room_key, topic) {
        (Some(raw), _) => RoomKey::parse(raw)?,
        (None, Some(topic)) => Subscription::parse(topic, &filter.unwrap_or_default())?,
        (None, None) => return Err(SubscribeError::MissingTarget),
    };
    let key = subscription.room_key();
    state.rooms.unsubscribe(session, &key)?;
    Ok(key)
}

fn reply_error(state: &HubState, session: &ClientSession, error: SubscribeError, request_id: Option<String>) {
    match &error {
        SubscribeError::RateLimited(e) => warn!(
            "[消息路由] 连接 {} (addr={}) 订阅被限流: {}",
            session.connection_id, session.addr, e
        ),
        other => debug!("[消息路由] 连接 {} 的请求失败: {}", session.connection_id, other),
    }
    session.send(ServerMessage::Error {
        error: ErrorBody {
            code: error.error_code(),
            message: error.to_string(),
            retry_after: error.retry_after_secs(),
        },
        request_id,
    });
    if error.is_protocol_error() {
        bump_protocol_errors(state, session);
    }
}

fn record_protocol_error(state: &HubState, session: &ClientSession, error: ProtocolError) {
    debug!("[消息路由] 连接 {} 协议错误: {}", session.connection_id, error);
    session.send(ServerMessage::error(ErrorCode::InvalidMessage, error.to_string(), None));
    bump_protocol_errors(state, session);
}

fn bump_protocol_errors(state: &HubState, session: &ClientSession) {
    let count = session.record_protocol_error();
    let threshold = state.config.limits.protocol_error_threshold;
    if count >= threshold {
        warn!(
            "[消息路由] 连接 {} (addr={}) 累计 {} 次协议错误，关闭连接",
            session.connection_id, session.addr, count
        );
        state.connections.close(
            session,
            HubCloseCode::ProtocolViolation,
            HubCloseCode::ProtocolViolation.default_reason(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, BucketConfig};
    use crate::ws_server::outbound_queue::Outbound;
    use crate::ws_server::token_signer::TokenClaims;
    use common_models::enums::ConnectionState;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn state() -> Arc<HubState> {
        let mut config = AppConfig::default();
        config.auth.secret = "router-test-secret".into();
        config.limits.protocol_error_threshold = 3;
        config.rate_limit.subscribe_per_user = BucketConfig { capacity: 5, refill_per_second: 0.1 };
        HubState::new(config).expect("创建状态失败")
    }

    fn active(state: &HubState, sub: Option<&str>, rooms: &[&str]) -> Arc<ClientSession> {
        let s = state.connections.register("127.0.0.1:9000".parse().expect("地址解析失败")).expect("注册失败");
        state.connections.begin_auth(&s).expect("迁移失败");
        let claims = TokenClaims {
            sub: sub.map(str::to_string),
            rooms: rooms.iter().map(|r| r.to_string()).collect(),
            meta: BTreeMap::new(),
            iat: 0,
            exp: 600,
            kid: "k1".into(),
            nonce: "n".into(),
        };
        state.connections.activate(&s, claims).expect("激活失败");
        s
    }

    fn next_message(s: &ClientSession) -> ServerMessage {
        match s.outbound().try_pop() {
            Some(Outbound::Message(m)) => m,
            other => panic!("期望一条消息，实际为 {:?}", other),
        }
    }

    fn error_code(msg: ServerMessage) -> ErrorCode {
        match msg {
            ServerMessage::Error { error, .. } => error.code,
            other => panic!("期望 error 消息，实际为 {:?}", other),
        }
    }

    #[tokio::test]
    /// 测试订阅返回回执并携带 request_id；重复订阅同样得到回执。
    async fn test_subscribe_and_resubscribe() {
        let st = state();
        let s = active(&st, Some("u1"), &[]);
        let text = r#"{"type":"subscribe","topic":"odds_updates","filter":{"sport":"mlb"},"request_id":"r1"}"#;
        handle_text(&st, &s, text).await;
        assert_eq!(
            next_message(&s),
            ServerMessage::Subscribed { room_key: "odds_updates:{sport=MLB}".into(), request_id: Some("r1".into()) }
        );
        handle_text(&st, &s, text).await;
        assert!(matches!(next_message(&s), ServerMessage::Subscribed { .. }));
        assert_eq!(st.rooms.room_counts().get("odds_updates:{sport=MLB}"), Some(&1));
    }

    #[tokio::test]
    async fn test_unsubscribe_by_room_key_and_by_filter() {
        let st = state();
        let s = active(&st, Some("u1"), &[]);
        handle_text(&st, &s, r#"{"type":"subscribe","topic":"game_updates","filter":{"game_id":"g1"}}"#).await;
        handle_text(&st, &s, r#"{"type":"subscribe","topic":"system_status"}"#).await;
        next_message(&s);
        next_message(&s);

        handle_text(&st, &s, r#"{"type":"unsubscribe","room_key":"game_updates:{game_id=g1}"}"#).await;
        assert_eq!(
            next_message(&s),
            ServerMessage::Unsubscribed { room_key: "game_updates:{game_id=g1}".into(), request_id: None }
        );
        handle_text(&st, &s, r#"{"type":"unsubscribe","topic":"system_status","request_id":"x"}"#).await;
        assert!(matches!(next_message(&s), ServerMessage::Unsubscribed { .. }));
        handle_text(&st, &s, r#"{"type":"unsubscribe","topic":"system_status"}"#).await;
        assert_eq!(error_code(next_message(&s)), ErrorCode::NotSubscribed);
        assert!(st.rooms.is_empty());
    }

    #[tokio::test]
    /// 测试权限检查：匿名连接不能订阅 predictions，rooms 声明限定了可订阅主题。
    async fn test_permissions() {
        let st = state();
        let anon = active(&st, None, &[]);
        handle_text(&st, &anon, r#"{"type":"subscribe","topic":"predictions"}"#).await;
        assert_eq!(error_code(next_message(&anon)), ErrorCode::InsufficientPermissions);

        let scoped = active(&st, Some("u2"), &["odds_updates"]);
        handle_text(&st, &scoped, r#"{"type":"subscribe","topic":"game_updates"}"#).await;
        assert_eq!(error_code(next_message(&scoped)), ErrorCode::InsufficientPermissions);
        handle_text(&st, &scoped, r#"{"type":"subscribe","topic":"odds_updates"}"#).await;
        assert!(matches!(next_message(&scoped), ServerMessage::Subscribed { .. }));
        assert_eq!(scoped.state(), ConnectionState::Active, "权限错误不会关闭连接");
    }

    #[tokio::test]
    async fn test_subscribe_rate_limit_reports_retry_after() {
        let st = state();
        let s = active(&st, Some("u1"), &[]);
        for _ in 0..5 {
            handle_text(&st, &s, r#"{"type":"subscribe","topic":"system_status"}"#).await;
            next_message(&s);
        }
        handle_text(&st, &s, r#"{"type":"subscribe","topic":"system_status"}"#).await;
        match next_message(&s) {
            ServerMessage::Error { error, .. } => {
                assert_eq!(error.code, ErrorCode::RateLimited);
                assert_eq!(error.retry_after, Some(10));
            }
            other => panic!("期望限流错误，实际为 {:?}", other),
        }
    }

    #[tokio::test]
    /// 测试协议错误累计达到阈值后以 4008 关闭连接。
    async fn test_protocol_errors_close_connection() {
        let st = state();
        let s = active(&st, Some("u1"), &[]);
        handle_text(&st, &s, "not json").await;
        assert_eq!(error_code(next_message(&s)), ErrorCode::InvalidMessage);
        handle_text(&st, &s, r#"{"type":"subscribe","topic":"odds_updates","filter":{"color":"red"}}"#).await;
        assert_eq!(error_code(next_message(&s)), ErrorCode::InvalidFilter);
        assert_eq!(s.state(), ConnectionState::Active);

        handle_binary(&st, &s);
        assert_eq!(s.state(), ConnectionState::Closing);
        assert!(matches!(s.outbound().try_pop(), Some(Outbound::Close { code: 4008, .. })));
    }

    #[tokio::test]
    async fn test_pong_refreshes_liveness() {
        let st = state();
        let s = active(&st, None, &[]);
        let before = s.last_pong().await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        handle_text(&st, &s, r#"{"type":"pong","timestamp":1}"#).await;
        assert!(s.last_pong().await > before);
        assert!(s.outbound().try_pop().is_none(), "pong 不需要回复");
    }
}
