use crate::error::RegistryError;
use crate::ws_server::outbound_queue::{BackpressurePolicy, Outbound, OutboundQueue, PushOutcome};
use crate::ws_server::token_signer::TokenClaims;
use chrono::{DateTime, Utc};
use common_models::enums::ConnectionState;
use common_models::topics::{RoomKey, Topic};
use common_models::ws_payloads::ServerMessage;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use uuid::Uuid;

/// 代表一个已连接的 WebSocket 客户端会话
#[derive(Debug)]
pub struct ClientSession {
    /// 由服务端生成的唯一连接标识
    pub connection_id: Uuid,
    /// 客户端的 IP 地址和端口
    pub addr: SocketAddr,
    /// 会话创建的时间戳
    pub created_at: DateTime<Utc>,
    /// 最后一次收到 pong (应用层或 WebSocket 层) 的时间，用于心跳机制
    pub last_pong_at: Arc<RwLock<DateTime<Utc>>>,
    state: AtomicU8,
    /// 认证通过后写入，之后不再改变
    claims: parking_lot::RwLock<Option<TokenClaims>>,
    /// 当前订阅的房间。修改成员关系时先持有此锁，再获取房间锁。
    pub(crate) rooms: parking_lot::Mutex<HashSet<RoomKey>>,
    outbound: Arc<OutboundQueue>,
    protocol_errors: AtomicU32,
    shutdown: watch::Sender<bool>,
}

impl ClientSession {
    /// 创建一个新的 ClientSession 实例，初始状态为 CONNECTING
    pub fn new(addr: SocketAddr, policy: Arc<BackpressurePolicy>) -> Self {
        let now = Utc::now();
        let (shutdown, _) = watch::channel(false);
        Self {
            connection_id: Uuid::new_v4(),
            addr,
            created_at: now,
            last_pong_at: Arc::new(RwLock::new(now)),
            state: AtomicU8::new(ConnectionState::Connecting.as_u8()),
            claims: parking_lot::RwLock::new(None),
            rooms: parking_lot::Mutex::new(HashSet::new()),
            outbound: Arc::new(OutboundQueue::new(policy)),
            protocol_errors: AtomicU32::new(0),
            shutdown,
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire)).unwrap_or(ConnectionState::Closed)
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    /// 以 CAS 的方式完成一次状态迁移。当前状态不是 `from` 或迁移不合法时失败。
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> Result<(), RegistryError> {
        if !from.can_transition_to(to) {
            return Err(RegistryError::IllegalTransition { from, to });
        }
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| RegistryError::IllegalTransition {
                from: ConnectionState::from_u8(actual).unwrap_or(ConnectionState::Closed),
                to,
            })
    }

    pub(crate) fn set_claims(&self, claims: TokenClaims) {
        *self.claims.write() = Some(claims);
    }

    pub fn claims(&self) -> Option<TokenClaims> {
        self.claims.read().clone()
    }

    pub fn user_id(&self) -> Option<String> {
        self.claims.read().as_ref().and_then(|c| c.sub.clone())
    }

    /// 没有声明 (尚未认证) 的连接不能订阅任何主题。
    pub fn may_subscribe(&self, topic: Topic) -> bool {
        self.claims.read().as_ref().is_some_and(|c| c.permits(topic))
    }

    pub fn outbound(&self) -> &Arc<OutboundQueue> {
        &self.outbound
    }

    pub fn send(&self, msg: ServerMessage) -> PushOutcome {
        self.outbound.push(msg)
    }

    pub fn send_critical(&self, item: Outbound) -> bool {
        self.outbound.push_critical(item)
    }

    pub async fn touch_pong(&self) {
        self.touch_pong_at(Utc::now()).await;
    }

    pub async fn touch_pong_at(&self, at: DateTime<Utc>) {
        let mut last = self.last_pong_at.write().await;
        if at > *last {
            *last = at;
        }
    }

    pub async fn last_pong(&self) -> DateTime<Utc> {
        *self.last_pong_at.read().await
    }

    /// 返回累计的协议错误次数。
    pub fn record_protocol_error(&self) -> u32 {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn signal_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }

    pub fn subscribed_rooms(&self) -> Vec<RoomKey> {
        let mut rooms: Vec<RoomKey> = self.rooms.lock().iter().cloned().collect();
        rooms.sort();
        rooms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackpressureConfig;

    fn session() -> ClientSession {
        let policy = Arc::new(BackpressurePolicy::from_config(&BackpressureConfig::default()));
        ClientSession::new("127.0.0.1:9000".parse().expect("地址解析失败"), policy)
    }

    #[test]
    /// 测试状态迁移只能沿合法路径前进。
    fn test_state_transitions() {
        let s = session();
        assert_eq!(s.state(), ConnectionState::Connecting);
        assert!(s.transition(ConnectionState::Connecting, ConnectionState::Active).is_err(), "不能跳过认证");
        s.transition(ConnectionState::Connecting, ConnectionState::Authenticating).expect("迁移失败");
        s.transition(ConnectionState::Authenticating, ConnectionState::Active).expect("迁移失败");
        assert!(
            s.transition(ConnectionState::Authenticating, ConnectionState::Rejected).is_err(),
            "当前状态已不是 AUTHENTICATING"
        );
        assert!(s.is_active());
        s.transition(ConnectionState::Active, ConnectionState::Closing).expect("迁移失败");
        assert!(s.transition(ConnectionState::Closing, ConnectionState::Active).is_err(), "状态不可回退");
    }

    #[tokio::test]
    async fn test_touch_pong_is_monotonic() {
        let s = session();
        let later = s.created_at + chrono::Duration::seconds(30);
        s.touch_pong_at(later).await;
        s.touch_pong_at(s.created_at).await;
        assert_eq!(s.last_pong().await, later);
    }

    #[test]
    fn test_unauthenticated_session_cannot_subscribe() {
        let s = session();
        assert!(!s.may_subscribe(Topic::SystemStatus));
        assert!(s.user_id().is_none());
    }

    #[test]
    fn test_shutdown_signal() {
        let s = session();
        let rx = s.subscribe_shutdown();
        assert!(!*rx.borrow());
        s.signal_shutdown();
        assert!(*rx.borrow());
        assert!(*s.subscribe_shutdown().borrow(), "之后订阅的接收端也能看到关闭信号");
    }
}
