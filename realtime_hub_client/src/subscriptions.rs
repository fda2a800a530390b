//! 订阅记录：保存当前有效的订阅，重连后按原顺序重新发送。

use common_models::topics::{RoomKey, Subscription};
use common_models::ws_payloads::ClientMessage;

/// 按房间键去重、按首次订阅顺序排列的订阅列表。
#[derive(Debug, Default, Clone)]
pub struct SubscriptionLedger {
    entries: Vec<(RoomKey, Subscription)>,
}

impl SubscriptionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一项订阅。已存在时返回 `false`，顺序不变。
    pub fn insert(&mut self, subscription: Subscription) -> bool {
        let key = subscription.room_key();
        if self.contains(&key) {
            return false;
        }
        self.entries.push((key, subscription));
        true
    }

    pub fn remove(&mut self, key: &RoomKey) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| k != key);
        self.entries.len() != before
    }

    pub fn contains(&self, key: &RoomKey) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn room_keys(&self) -> impl Iterator<Item = &RoomKey> {
        self.entries.iter().map(|(k, _)| k)
    }

    /// 恢复订阅时依次发送的消息。
    pub fn replay_messages(&self) -> Vec<ClientMessage> {
        self.entries
            .iter()
            .map(|(_, subscription)| subscribe_message(subscription))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn subscribe_message(subscription: &Subscription) -> ClientMessage {
    let filter = subscription.filter_map();
    ClientMessage::Subscribe {
        topic: subscription.topic().to_string(),
        filter: (!filter.is_empty()).then_some(filter),
        request_id: None,
    }
}
