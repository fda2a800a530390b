//! WebSocket 连接管理。
//!
//! `ConnectionManager` 是所有连接的注册表：负责容量控制、状态迁移、关闭与最终清理。
//! 关闭连接时先迁移状态，再立即清理房间成员关系，最后通知读写任务退出，
//! 因此连接进入 CLOSED 时不会残留任何房间成员关系。

use crate::error::RegistryError;
use crate::ws_server::client_session::ClientSession;
use crate::ws_server::outbound_queue::{BackpressurePolicy, Outbound};
use crate::ws_server::room_manager::RoomManager;
use crate::ws_server::stats::StatsCounters;
use crate::ws_server::token_signer::TokenClaims;
use common_models::enums::{ConnectionState, HubCloseCode};
use dashmap::DashMap;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// 管理所有已注册的 WebSocket 客户端会话
pub struct ConnectionManager {
    /// Key: connection_id，Value: 会话的共享引用
    clients: DashMap<Uuid, Arc<ClientSession>>,
    /// 已注册的连接数，用于容量控制 (在插入之前预留)
    registered: AtomicUsize,
    max_connections: usize,
    rooms: Arc<RoomManager>,
    stats: Arc<StatsCounters>,
    policy: Arc<BackpressurePolicy>,
}

impl ConnectionManager {
    pub fn new(
        max_connections: usize,
        rooms: Arc<RoomManager>,
        stats: Arc<StatsCounters>,
        policy: Arc<BackpressurePolicy>,
    ) -> Self {
        Self {
            clients: DashMap::new(),
            registered: AtomicUsize::new(0),
            max_connections,
            rooms,
            stats,
            policy,
        }
    }

    /// 注册一个刚完成 WebSocket 握手的连接，状态为 CONNECTING。
    pub fn register(&self, addr: SocketAddr) -> Result<Arc<ClientSession>, RegistryError> {
        if self
            .registered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_connections).then_some(n + 1)
            })
            .is_err()
        {
            warn!("[连接管理] 连接数已达上限 {}，拒绝来自 {} 的连接", self.max_connections, addr);
            self.stats.record_rejected(HubCloseCode::ServerAtCapacity);
            return Err(RegistryError::AtCapacity(self.max_connections));
        }
        let session = Arc::new(ClientSession::new(addr, self.policy.clone()));
        self.clients.insert(session.connection_id, Arc::clone(&session));
        debug!(
            "[连接管理] 新连接已注册: id={}, addr={}, 当前连接总数: {}",
            session.connection_id,
            addr,
            self.clients.len()
        );
        Ok(session)
    }

    pub fn begin_auth(&self, session: &ClientSession) -> Result<(), RegistryError> {
        session.transition(ConnectionState::Connecting, ConnectionState::Authenticating)
    }

    /// 认证成功：写入声明并提升为 ACTIVE。
    pub fn activate(&self, session: &ClientSession, claims: TokenClaims) -> Result<(), RegistryError> {
        let subject = claims.subject().to_string();
        session.set_claims(claims);
        session.transition(ConnectionState::Authenticating, ConnectionState::Active)?;
        self.stats.record_accepted();
        info!(
            "[连接管理] 连接 {} (addr={}, subject={}) 认证通过，进入 ACTIVE",
            session.connection_id, session.addr, subject
        );
        Ok(())
    }

    /// 认证失败：AUTHENTICATING -> REJECTED，并排入关闭帧。
    pub fn reject(&self, session: &ClientSession, code: HubCloseCode, reason: impl Into<String>) -> bool {
        if session
            .transition(ConnectionState::Authenticating, ConnectionState::Rejected)
            .is_err()
        {
            return false;
        }
        let reason = reason.into();
        warn!(
            "[连接管理] 拒绝连接 {} (addr={}): {} ({})",
            session.connection_id, session.addr, code, reason
        );
        session.send_critical(Outbound::Close { code: code.code(), reason });
        session.signal_shutdown();
        self.stats.record_rejected(code);
        true
    }

    /// 关闭一个 ACTIVE 连接 (认证中的连接按拒绝处理)。
    ///
    /// 房间成员关系在这里立即清理，之后的广播不会再送达该连接。
    /// 返回 `false` 表示连接已经在关闭或已关闭。
    pub fn close(&self, session: &ClientSession, code: HubCloseCode, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        match session.state() {
            ConnectionState::Authenticating => return self.reject(session, code, reason),
            ConnectionState::Active => {}
            _ => return false,
        }
        if session
            .transition(ConnectionState::Active, ConnectionState::Closing)
            .is_err()
        {
            return false;
        }
        session.send_critical(Outbound::Close { code: code.code(), reason: reason.clone() });
        let left = self.rooms.remove_connection(session);
        session.signal_shutdown();
        info!(
            "[连接管理] 关闭连接 {} (addr={}): {} ({})，已离开 {} 个房间",
            session.connection_id, session.addr, code, reason, left
        );
        true
    }

    /// 连接的读写任务都结束后调用：再次清理房间、进入 CLOSED 并从注册表移除。可重复调用。
    pub fn finalize(&self, session: &ClientSession) -> bool {
        match session.state() {
            ConnectionState::Connecting => {
                // 握手后立即出错的连接，沿合法路径走到 REJECTED
                let _ = self.begin_auth(session);
                self.reject(session, HubCloseCode::GoingAway, HubCloseCode::GoingAway.default_reason());
            }
            ConnectionState::Authenticating | ConnectionState::Active => {
                self.close(session, HubCloseCode::GoingAway, HubCloseCode::GoingAway.default_reason());
            }
            _ => {}
        }
        self.rooms.remove_connection(session);
        session.outbound().close();
        for from in [ConnectionState::Closing, ConnectionState::Rejected] {
            if session.transition(from, ConnectionState::Closed).is_ok() {
                break;
            }
        }

        match self.clients.remove(&session.connection_id) {
            Some(_) => {
                self.registered.fetch_sub(1, Ordering::AcqRel);
                self.stats.record_closed();
                debug!(
                    "[连接管理] 连接 {} 已清理完毕，剩余连接数: {}",
                    session.connection_id,
                    self.clients.len()
                );
                true
            }
            None => false,
        }
    }

    /// 根据 connection_id 获取一个客户端会话的引用
    pub fn get(&self, id: &Uuid) -> Option<Arc<ClientSession>> {
        self.clients.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// 所有已注册会话的快照
    pub fn all_sessions(&self) -> Vec<Arc<ClientSession>> {
        self.clients.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    pub fn active_sessions(&self) -> Vec<Arc<ClientSession>> {
        self.clients
            .iter()
            .filter(|entry| entry.value().is_active())
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// 以给定关闭码关闭所有连接，返回实际发起关闭的数量。
    pub fn close_all(&self, code: HubCloseCode) -> usize {
        let sessions = self.all_sessions();
        let closed = sessions
            .iter()
            .filter(|s| self.close(s, code, code.default_reason()))
            .count();
        info!("[连接管理] 已向 {} 个连接发起关闭 ({})", closed, code);
        closed
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn active_len(&self) -> usize {
        self.clients.iter().filter(|entry| entry.value().is_active()).count()
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackpressureConfig;
    use common_models::topics::Subscription;
    use serde_json::Map;
    use std::collections::BTreeMap;

    fn manager(max: usize) -> ConnectionManager {
        ConnectionManager::new(
            max,
            Arc::new(RoomManager::new(100, 10)),
            Arc::new(StatsCounters::new()),
            Arc::new(BackpressurePolicy::from_config(&BackpressureConfig::default())),
        )
    }

    fn claims(sub: Option<&str>) -> TokenClaims {
        TokenClaims {
            sub: sub.map(str::to_string),
            rooms: vec![],
            meta: BTreeMap::new(),
            iat: 0,
            exp: 600,
            kid: "k1".into(),
            nonce: "n".into(),
        }
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().expect("地址解析失败")
    }

    fn activated(m: &ConnectionManager) -> Arc<ClientSession> {
        let s = m.register(addr()).expect("注册失败");
        m.begin_auth(&s).expect("迁移失败");
        m.activate(&s, claims(Some("u1"))).expect("激活失败");
        s
    }

    #[test]
    /// 测试容量上限：超出时拒绝新连接，已有连接不受影响；清理后名额被释放。
    fn test_capacity() {
        let m = manager(2);
        let a = m.register(addr()).expect("注册失败");
        let _b = m.register(addr()).expect("注册失败");
        assert_eq!(m.register(addr()).map(|_| ()), Err(RegistryError::AtCapacity(2)));
        assert_eq!(m.len(), 2);
        assert!(m.finalize(&a));
        assert!(m.register(addr()).is_ok(), "清理后应释放名额");
    }

    #[test]
    /// 测试关闭会立即清理房间成员关系并排入关闭帧。
    fn test_close_cleans_rooms_immediately() {
        let m = manager(10);
        let s = activated(&m);
        let sub = Subscription::parse("system_status", &Map::new()).expect("解析失败");
        let (key, _) = m.rooms().subscribe(&s, &sub).expect("订阅失败");
        let shutdown = s.subscribe_shutdown();

        assert!(m.close(&s, HubCloseCode::HeartbeatTimeout, "heartbeat timeout"));
        assert!(!m.close(&s, HubCloseCode::Normal, "again"), "重复关闭应被忽略");
        assert_eq!(s.state(), ConnectionState::Closing);
        assert!(m.rooms().members(&key).is_empty());
        assert!(*shutdown.borrow());
        assert!(matches!(s.outbound().try_pop(), Some(Outbound::Close { code: 4005, .. })));

        assert!(m.finalize(&s));
        assert!(!m.finalize(&s), "finalize 可重复调用");
        assert_eq!(s.state(), ConnectionState::Closed);
        assert!(m.get(&s.connection_id).is_none());
    }

    #[test]
    fn test_reject_path() {
        let m = manager(10);
        let s = m.register(addr()).expect("注册失败");
        m.begin_auth(&s).expect("迁移失败");
        assert!(m.reject(&s, HubCloseCode::ExpiredToken, "token expired"));
        assert_eq!(s.state(), ConnectionState::Rejected);
        assert!(m.activate(&s, claims(None)).is_err(), "被拒绝的连接永远不能进入 ACTIVE");
        assert!(m.finalize(&s));
        assert_eq!(s.state(), ConnectionState::Closed);
        let stats = m.stats.snapshot();
        assert_eq!(stats.connections_rejected, 1);
        assert_eq!(stats.rejected_by_reason.get("EXPIRED_TOKEN"), Some(&1));
    }

    #[test]
    fn test_close_all_and_counts() {
        let m = manager(10);
        let a = activated(&m);
        let _b = activated(&m);
        let pending = m.register(addr()).expect("注册失败");
        assert_eq!(m.active_len(), 2);
        assert_eq!(m.close_all(HubCloseCode::GoingAway), 2, "CONNECTING 状态的连接不计入");
        assert_eq!(m.active_len(), 0);
        assert!(matches!(a.outbound().try_pop(), Some(Outbound::Close { code: 1001, .. })));
        assert!(m.finalize(&pending));
        assert_eq!(pending.state(), ConnectionState::Closed);
    }
}
