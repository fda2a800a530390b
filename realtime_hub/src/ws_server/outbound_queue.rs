//! 每个连接的出站队列。
//!
//! 队列分两条通道：
//! - critical：关闭帧、心跳 ping 等控制消息，不受容量限制，也不会被丢弃；
//! - normal：其余消息，容量有限，满了之后按背压策略淘汰。
//!
//! 生产者 (房间广播、消息路由、心跳) 只做非阻塞的入队；唯一的消费者是连接自己的写任务。

use crate::config::BackpressureConfig;
use common_models::ws_payloads::ServerMessage;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// 写任务从队列中取出的条目。
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    /// 发送关闭帧后写任务结束。
    Close { code: u16, reason: String },
}

/// 普通消息入队的结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// 已入队，但为此淘汰了一条旧消息。
    QueuedWithEviction,
    /// 队列已满且没有可淘汰的消息，新消息被丢弃。
    Dropped,
    /// 连接正在关闭，不再接收普通消息。
    Closed,
}

impl PushOutcome {
    pub fn is_queued(self) -> bool {
        matches!(self, PushOutcome::Queued | PushOutcome::QueuedWithEviction)
    }

    pub fn dropped_count(self) -> u64 {
        match self {
            PushOutcome::QueuedWithEviction | PushOutcome::Dropped => 1,
            PushOutcome::Queued | PushOutcome::Closed => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackpressurePolicy {
    capacity: usize,
    protected_kinds: HashSet<String>,
}

impl BackpressurePolicy {
    pub fn new(capacity: usize, protected_kinds: impl IntoIterator<Item = String>) -> Self {
        Self {
            capacity: capacity.max(1),
            protected_kinds: protected_kinds.into_iter().collect(),
        }
    }

    pub fn from_config(config: &BackpressureConfig) -> Self {
        Self::new(config.queue_capacity, config.protected_kinds.iter().cloned())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_droppable(&self, msg: &ServerMessage) -> bool {
        !self.protected_kinds.contains(msg.kind())
    }
}

#[derive(Debug, Default)]
struct Lanes {
    critical: VecDeque<Outbound>,
    normal: VecDeque<ServerMessage>,
    /// 不再接收普通消息。
    closed: bool,
    /// 关闭帧已入队，之后的控制消息也不再接收。
    close_queued: bool,
}

#[derive(Debug)]
pub struct OutboundQueue {
    lanes: Mutex<Lanes>,
    notify: Notify,
    policy: Arc<BackpressurePolicy>,
    dropped: AtomicU64,
}

impl OutboundQueue {
    pub fn new(policy: Arc<BackpressurePolicy>) -> Self {
        Self {
            lanes: Mutex::new(Lanes::default()),
            notify: Notify::new(),
            policy,
            dropped: AtomicU64::new(0),
        }
    }

    /// 普通消息入队，从不阻塞。
    pub fn push(&self, msg: ServerMessage) -> PushOutcome {
        let outcome = {
            let mut lanes = self.lanes.lock();
            if lanes.closed {
                return PushOutcome::Closed;
            }
            if lanes.normal.len() < self.policy.capacity {
                lanes.normal.push_back(msg);
                PushOutcome::Queued
            } else if let Some(pos) = lanes.normal.iter().position(|m| self.policy.is_droppable(m)) {
                lanes.normal.remove(pos);
                lanes.normal.push_back(msg);
                PushOutcome::QueuedWithEviction
            } else if self.policy.is_droppable(&msg) {
                PushOutcome::Dropped
            } else {
                lanes.normal.pop_front();
                lanes.normal.push_back(msg);
                PushOutcome::QueuedWithEviction
            }
        };
        let dropped = outcome.dropped_count();
        if dropped > 0 {
            self.dropped.fetch_add(dropped, Ordering::Relaxed);
        }
        if outcome.is_queued() {
            self.notify.notify_one();
        }
        outcome
    }

    /// 控制消息入队。关闭帧入队之后返回 `false`。
    pub fn push_critical(&self, item: Outbound) -> bool {
        {
            let mut lanes = self.lanes.lock();
            if lanes.close_queued {
                return false;
            }
            if matches!(item, Outbound::Close { .. }) {
                lanes.closed = true;
                lanes.close_queued = true;
            }
            lanes.critical.push_back(item);
        }
        self.notify.notify_one();
        true
    }

    /// 停止接收普通消息。已入队的消息仍会被取出，之后 `pop` 返回 `None`。
    pub fn close(&self) {
        self.lanes.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lanes.lock().closed
    }

    /// 非阻塞地取出下一条，critical 通道优先。
    pub fn try_pop(&self) -> Option<Outbound> {
        let mut lanes = self.lanes.lock();
        lanes
            .critical
            .pop_front()
            .or_else(|| lanes.normal.pop_front().map(Outbound::Message))
    }

    /// 等待下一条。队列已关闭且为空时返回 `None`。
    pub async fn pop(&self) -> Option<Outbound> {
        loop {
            {
                let mut lanes = self.lanes.lock();
                if let Some(item) = lanes.critical.pop_front() {
                    return Some(item);
                }
                if let Some(msg) = lanes.normal.pop_front() {
                    return Some(Outbound::Message(msg));
                }
                if lanes.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        let lanes = self.lanes.lock();
        lanes.critical.len() + lanes.normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn queue(capacity: usize) -> OutboundQueue {
        let policy = BackpressurePolicy::from_config(&BackpressureConfig {
            queue_capacity: capacity,
            ..BackpressureConfig::default()
        });
        OutboundQueue::new(Arc::new(policy))
    }

    fn event(seq: u64) -> ServerMessage {
        ServerMessage::Event {
            room_key: "system_status:{}".into(),
            sequence: seq,
            payload: Arc::new(json!({ "n": seq })),
        }
    }

    fn subscribed(key: &str) -> ServerMessage {
        ServerMessage::Subscribed { room_key: key.into(), request_id: None }
    }

    fn sequence_of(item: Option<Outbound>) -> Option<u64> {
        match item {
            Some(Outbound::Message(ServerMessage::Event { sequence, .. })) => Some(sequence),
            _ => None,
        }
    }

    #[test]
    /// 测试队列满时淘汰最旧的事件，保留受保护的回执。
    fn test_full_queue_evicts_oldest_droppable() {
        let q = queue(3);
        assert_eq!(q.push(subscribed("a")), PushOutcome::Queued);
        assert_eq!(q.push(event(1)), PushOutcome::Queued);
        assert_eq!(q.push(event(2)), PushOutcome::Queued);
        assert_eq!(q.push(event(3)), PushOutcome::QueuedWithEviction);
        assert_eq!(q.dropped_count(), 1);

        assert!(matches!(q.try_pop(), Some(Outbound::Message(ServerMessage::Subscribed { .. }))));
        assert_eq!(sequence_of(q.try_pop()), Some(2), "事件 1 应被淘汰");
        assert_eq!(sequence_of(q.try_pop()), Some(3));
        assert!(q.try_pop().is_none());
    }

    #[test]
    fn test_protected_only_queue() {
        let q = queue(2);
        q.push(subscribed("a"));
        q.push(subscribed("b"));
        assert_eq!(q.push(event(1)), PushOutcome::Dropped, "没有可淘汰的消息时丢弃新事件");
        assert_eq!(q.push(subscribed("c")), PushOutcome::QueuedWithEviction, "受保护的新消息挤掉最旧的一条");
        assert_eq!(q.dropped_count(), 2);
        assert_eq!(q.len(), 2);
        match q.try_pop() {
            Some(Outbound::Message(ServerMessage::Subscribed { room_key, .. })) => assert_eq!(room_key, "b"),
            other => panic!("期望 subscribed b，实际为 {:?}", other),
        }
    }

    #[test]
    /// 测试控制消息优先，并且关闭帧之后不再接收任何消息。
    fn test_critical_lane_and_close() {
        let q = queue(4);
        q.push(event(1));
        assert!(q.push_critical(Outbound::Message(ServerMessage::Ping { timestamp: 7 })));
        assert!(matches!(q.try_pop(), Some(Outbound::Message(ServerMessage::Ping { .. }))));

        assert!(q.push_critical(Outbound::Close { code: 4005, reason: "heartbeat timeout".into() }));
        assert!(!q.push_critical(Outbound::Message(ServerMessage::Ping { timestamp: 8 })));
        assert_eq!(q.push(event(2)), PushOutcome::Closed);
        assert!(matches!(q.try_pop(), Some(Outbound::Close { code: 4005, .. })));
        assert_eq!(sequence_of(q.try_pop()), Some(1));
    }

    #[tokio::test]
    async fn test_pop_waits_and_ends_after_close() {
        let q = Arc::new(queue(4));
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(item) = q.pop().await {
                    seen.push(sequence_of(Some(item)));
                }
                seen
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.push(event(1));
        q.push(event(2));
        q.close();
        let seen = tokio::time::timeout(Duration::from_secs(2), consumer)
            .await
            .expect("消费者应在队列关闭后结束")
            .expect("消费者任务 panic");
        assert_eq!(seen, vec![Some(1), Some(2)]);
    }
}
