//! 房间管理模块。
//!
//! 房间以规范化的 `RoomKey` 为键，按需创建，最后一个成员离开时销毁。
//! 每个房间有自己的互斥锁，保护成员集合与房间序列号；发布时在房间锁内分配序列号并
//! 非阻塞地写入各成员的出站队列，因此同一房间的事件对每个成员都按发布顺序到达。
//!
//! 锁顺序：会话的 `rooms` 锁 -> 房间锁 -> 房间表分片锁。
//! 任何路径都不会在持有分片锁时等待房间锁。

use crate::error::SubscribeError;
use crate::ws_server::client_session::ClientSession;
use crate::ws_server::outbound_queue::OutboundQueue;
use common_models::enums::ConnectionState;
use common_models::topics::{FilterError, RoomKey, Subscription};
use common_models::ws_payloads::ServerMessage;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Room {
    members: HashMap<Uuid, Arc<OutboundQueue>>,
    /// 上一次发布使用的序列号，首个事件为 1
    last_sequence: u64,
    /// 已从房间表中摘除。加入时遇到已摘除的房间需要重新查找
    retired: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Joined,
    /// 已经订阅过，成员关系不变
    AlreadySubscribed,
}

/// 一次房间发布的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    pub sequence: u64,
    /// 成功写入出站队列的成员数
    pub delivered: usize,
    /// 因背压被丢弃的消息数 (包括被淘汰的旧消息)
    pub dropped: u64,
}

pub struct RoomManager {
    rooms: DashMap<RoomKey, Arc<Mutex<Room>>>,
    room_count: AtomicUsize,
    max_rooms: usize,
    max_rooms_per_connection: usize,
}

impl RoomManager {
    pub fn new(max_rooms: usize, max_rooms_per_connection: usize) -> Self {
        info!(
            "[房间管理] 初始化完成。房间总数上限: {}，单连接订阅上限: {}",
            max_rooms, max_rooms_per_connection
        );
        Self {
            rooms: DashMap::new(),
            room_count: AtomicUsize::new(0),
            max_rooms,
            max_rooms_per_connection,
        }
    }

    /// 把 (topic, filter) 解析为规范化的房间键，不修改任何状态。
    pub fn resolve(topic: &str, filter: &Map<String, Value>) -> Result<RoomKey, FilterError> {
        Subscription::parse(topic, filter).map(|s| s.room_key())
    }

    /// 把会话加入订阅对应的房间。重复订阅是幂等的。
    pub fn subscribe(
        &self,
        session: &ClientSession,
        subscription: &Subscription,
    ) -> Result<(RoomKey, SubscribeOutcome), SubscribeError> {
        let key = subscription.room_key();
        let mut joined = session.rooms.lock();
        // 在会话锁内检查状态：连接关闭时先迁移状态再清理房间，两者不会交错
        if session.state() != ConnectionState::Active {
            return Err(SubscribeError::NotActive);
        }
        if joined.contains(&key) {
            return Ok((key, SubscribeOutcome::AlreadySubscribed));
        }
        if joined.len() >= self.max_rooms_per_connection {
            return Err(SubscribeError::ConnectionRoomLimitReached(self.max_rooms_per_connection));
        }
        self.join(&key, session.connection_id, session.outbound().clone())?;
        joined.insert(key.clone());
        debug!("[房间管理] 连接 {} 加入房间 {}", session.connection_id, key);
        Ok((key, SubscribeOutcome::Joined))
    }

    fn join(&self, key: &RoomKey, id: Uuid, queue: Arc<OutboundQueue>) -> Result<(), SubscribeError> {
        loop {
            let room = match self.rooms.entry(key.clone()) {
                Entry::Occupied(e) => e.get().clone(),
                Entry::Vacant(v) => {
                    let reserved = self
                        .room_count
                        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < self.max_rooms).then_some(n + 1))
                        .is_ok();
                    if !reserved {
                        warn!("[房间管理] 房间总数已达上限 {}，拒绝创建 {}", self.max_rooms, key);
                        return Err(SubscribeError::RoomLimitReached(self.max_rooms));
                    }
                    debug!("[房间管理] 创建房间 {}", key);
                    v.insert(Arc::new(Mutex::new(Room::default()))).clone()
                }
            };
            let mut guard = room.lock();
            if guard.retired {
                continue;
            }
            guard.members.insert(id, queue);
            return Ok(());
        }
    }

    /// 退订单个房间。
    pub fn unsubscribe(&self, session: &ClientSession, key: &RoomKey) -> Result<(), SubscribeError> {
        let mut joined = session.rooms.lock();
        if !joined.remove(key) {
            return Err(SubscribeError::NotSubscribed(key.to_string()));
        }
        self.leave(key, session.connection_id);
        debug!("[房间管理] 连接 {} 离开房间 {}", session.connection_id, key);
        Ok(())
    }

    /// 把连接从它所在的所有房间中移除，返回移除的房间数。可重复调用。
    pub fn remove_connection(&self, session: &ClientSession) -> usize {
        let mut joined = session.rooms.lock();
        let keys: Vec<RoomKey> = joined.drain().collect();
        for key in &keys {
            self.leave(key, session.connection_id);
        }
        if !keys.is_empty() {
            debug!("[房间管理] 连接 {} 已从 {} 个房间中移除", session.connection_id, keys.len());
        }
        keys.len()
    }

    fn leave(&self, key: &RoomKey, id: Uuid) -> bool {
        let Some(room) = self.rooms.get(key).map(|r| r.value().clone()) else {
            return false;
        };
        let mut guard = room.lock();
        let removed = guard.members.remove(&id).is_some();
        if guard.members.is_empty() && !guard.retired {
            guard.retired = true;
            if self.rooms.remove_if(key, |_, current| Arc::ptr_eq(current, &room)).is_some() {
                self.room_count.fetch_sub(1, Ordering::AcqRel);
                debug!("[房间管理] 房间 {} 已无成员，已销毁", key);
            }
        }
        removed
    }

    /// 向房间的所有成员发布事件。房间不存在时返回 `None`。
    pub fn publish(&self, key: &RoomKey, payload: Arc<Value>) -> Option<PublishReceipt> {
        let room = self.rooms.get(key).map(|r| r.value().clone())?;
        let mut guard = room.lock();
        if guard.retired || guard.members.is_empty() {
            return None;
        }
        guard.last_sequence += 1;
        let sequence = guard.last_sequence;
        let mut delivered = 0;
        let mut dropped = 0;
        for queue in guard.members.values() {
            let outcome = queue.push(ServerMessage::Event {
                room_key: key.to_string(),
                sequence,
                payload: payload.clone(),
            });
            // 正在关闭的连接 (PushOutcome::Closed) 既不算送达也不算丢弃
            if outcome.is_queued() {
                delivered += 1;
            }
            dropped += outcome.dropped_count();
        }
        Some(PublishReceipt {
            sequence,
            delivered,
            dropped,
        })
    }

    pub fn members(&self, key: &RoomKey) -> HashSet<Uuid> {
        match self.rooms.get(key).map(|r| r.value().clone()) {
            Some(room) => room.lock().members.keys().copied().collect(),
            None => HashSet::new(),
        }
    }

    /// 每个房间的成员数，按房间键排序。
    pub fn room_counts(&self) -> BTreeMap<String, usize> {
        let snapshot: Vec<(RoomKey, Arc<Mutex<Room>>)> = self
            .rooms
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        snapshot
            .into_iter()
            .map(|(key, room)| (key.to_string(), room.lock().members.len()))
            .filter(|(_, n)| *n > 0)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.room_count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackpressureConfig;
    use crate::ws_server::outbound_queue::{BackpressurePolicy, Outbound};
    use serde_json::json;

    fn active_session() -> ClientSession {
        let policy = Arc::new(BackpressurePolicy::from_config(&BackpressureConfig::default()));
        let s = ClientSession::new("127.0.0.1:9000".parse().expect("地址解析失败"), policy);
        s.transition(ConnectionState::Connecting, ConnectionState::Authenticating).expect("迁移失败");
        s.transition(ConnectionState::Authenticating, ConnectionState::Active).expect("迁移失败");
        s
    }

    fn sub(topic: &str, filter: Value) -> Subscription {
        let map = filter.as_object().cloned().unwrap_or_default();
        Subscription::parse(topic, &map).expect("订阅解析失败")
    }

    fn drain_sequences(s: &ClientSession) -> Vec<u64> {
        let mut out = Vec::new();
        while let Some(item) = s.outbound().try_pop() {
            if let Outbound::Message(ServerMessage::Event { sequence, .. }) = item {
                out.push(sequence);
            }
        }
        out
    }

    #[test]
    /// 测试重复订阅是幂等的，且只有一个成员关系。
    fn test_subscribe_is_idempotent() {
        let rooms = RoomManager::new(10, 10);
        let s = active_session();
        let mlb = sub("odds_updates", json!({"sport": "mlb"}));
        let (key, first) = rooms.subscribe(&s, &mlb).expect("订阅失败");
        let (again, second) = rooms.subscribe(&s, &mlb).expect("重复订阅失败");
        assert_eq!(key, again);
        assert_eq!((first, second), (SubscribeOutcome::Joined, SubscribeOutcome::AlreadySubscribed));
        assert_eq!(rooms.members(&key).len(), 1);
        assert_eq!(s.room_count(), 1);
        assert_eq!(key.as_str(), "odds_updates:{sport=MLB}");
    }

    #[test]
    fn test_non_active_session_cannot_subscribe() {
        let rooms = RoomManager::new(10, 10);
        let policy = Arc::new(BackpressurePolicy::from_config(&BackpressureConfig::default()));
        let s = ClientSession::new("127.0.0.1:9000".parse().expect("地址解析失败"), policy);
        assert_eq!(
            rooms.subscribe(&s, &sub("system_status", json!({}))),
            Err(SubscribeError::NotActive)
        );
        assert!(rooms.is_empty());
    }

    #[test]
    /// 测试最后一个成员离开后房间被销毁，之后的发布不会送达任何人。
    fn test_room_lifecycle() {
        let rooms = RoomManager::new(10, 10);
        let a = active_session();
        let b = active_session();
        let games = sub("game_updates", json!({"game_id": "g1"}));
        let (key, _) = rooms.subscribe(&a, &games).expect("订阅失败");
        rooms.subscribe(&b, &games).expect("订阅失败");
        assert_eq!(rooms.len(), 1);

        rooms.unsubscribe(&a, &key).expect("退订失败");
        assert_eq!(rooms.members(&key), HashSet::from([b.connection_id]));
        assert_eq!(
            rooms.unsubscribe(&a, &key),
            Err(SubscribeError::NotSubscribed(key.to_string()))
        );

        assert_eq!(rooms.remove_connection(&b), 1);
        assert_eq!(rooms.remove_connection(&b), 0, "重复清理不应出错");
        assert!(rooms.is_empty());
        assert!(rooms.publish(&key, Arc::new(json!({}))).is_none());
    }

    #[test]
    fn test_room_limits() {
        let rooms = RoomManager::new(2, 2);
        let a = active_session();
        rooms.subscribe(&a, &sub("odds_updates", json!({"sport": "NBA"}))).expect("订阅失败");
        rooms.subscribe(&a, &sub("odds_updates", json!({"sport": "NFL"}))).expect("订阅失败");
        assert_eq!(
            rooms.subscribe(&a, &sub("odds_updates", json!({"sport": "NHL"}))),
            Err(SubscribeError::ConnectionRoomLimitReached(2))
        );
        let b = active_session();
        assert_eq!(
            rooms.subscribe(&b, &sub("system_status", json!({}))),
            Err(SubscribeError::RoomLimitReached(2))
        );
        assert!(rooms.subscribe(&b, &sub("odds_updates", json!({"sport": "nba"}))).is_ok(), "加入已有房间不受房间总数限制");
    }

    #[test]
    /// 测试房间序列号单调递增，所有成员收到相同顺序。
    fn test_publish_sequences() {
        let rooms = RoomManager::new(10, 10);
        let a = active_session();
        let b = active_session();
        let status = sub("system_status", json!({}));
        let (key, _) = rooms.subscribe(&a, &status).expect("订阅失败");
        rooms.subscribe(&b, &status).expect("订阅失败");
        for i in 1..=3 {
            let receipt = rooms.publish(&key, Arc::new(json!({ "i": i }))).expect("房间应存在");
            assert_eq!(receipt.sequence, i);
            assert_eq!(receipt.delivered, 2);
        }
        assert_eq!(drain_sequences(&a), vec![1, 2, 3]);
        assert_eq!(drain_sequences(&b), vec![1, 2, 3]);
        assert_eq!(rooms.room_counts().get(key.as_str()), Some(&2));
    }

    #[test]
    /// 测试慢消费者的队列溢出只影响它自己。
    fn test_slow_member_does_not_affect_others() {
        let rooms = RoomManager::new(10, 10);
        let policy = Arc::new(BackpressurePolicy::from_config(&BackpressureConfig {
            queue_capacity: 2,
            ..BackpressureConfig::default()
        }));
        let slow = ClientSession::new("127.0.0.1:9001".parse().expect("地址解析失败"), policy);
        slow.transition(ConnectionState::Connecting, ConnectionState::Authenticating).expect("迁移失败");
        slow.transition(ConnectionState::Authenticating, ConnectionState::Active).expect("迁移失败");
        let fast = active_session();
        let status = sub("system_status", json!({}));
        let (key, _) = rooms.subscribe(&slow, &status).expect("订阅失败");
        rooms.subscribe(&fast, &status).expect("订阅失败");

        let mut dropped = 0;
        for _ in 0..5 {
            dropped += rooms.publish(&key, Arc::new(json!({}))).expect("房间应存在").dropped;
        }
        assert_eq!(dropped, 3);
        assert_eq!(drain_sequences(&slow), vec![4, 5], "慢消费者只保留最新的事件");
        assert_eq!(drain_sequences(&fast), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_resolve_is_pure() {
        let key = RoomManager::resolve("prop_updates", &Map::new()).expect("解析失败");
        assert_eq!(key.as_str(), "prop_updates:{}");
        assert!(RoomManager::resolve("weather", &Map::new()).is_err());
    }

    #[test]
    /// 竞争测试：并发订阅与退订同一房间后，成员关系与房间计数保持一致。
    fn test_concurrent_join_and_leave() {
        let rooms = Arc::new(RoomManager::new(100, 10));
        let status = sub("system_status", json!({}));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let rooms = rooms.clone();
                let status = status.clone();
                std::thread::spawn(move || {
                    let s = active_session();
                    for _ in 0..200 {
                        let (key, _) = rooms.subscribe(&s, &status).expect("订阅失败");
                        rooms.unsubscribe(&s, &key).expect("退订失败");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("线程 panic");
        }
        assert!(rooms.is_empty(), "所有成员离开后不应残留房间");
        assert!(rooms.room_counts().is_empty());
    }
}
