//! 广播器：把业务事件投递给匹配房间的所有成员。
//!
//! 上游 (行情、比分、预测等服务) 只与这里交互。多节点部署时，跨节点分发应接在这一层之上。

use crate::ws_server::room_manager::RoomManager;
use crate::ws_server::stats::StatsCounters;
use common_models::topics::{FilterError, RoomKey, Subscription};
use log::debug;
use serde_json::{Map, Value};
use std::sync::Arc;

/// 一次发布的投递结果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub room_key: RoomKey,
    /// 房间不存在 (无订阅者) 时为 `None`
    pub sequence: Option<u64>,
    pub delivered: usize,
    pub dropped: u64,
}

pub struct Broadcaster {
    rooms: Arc<RoomManager>,
    stats: Arc<StatsCounters>,
}

impl Broadcaster {
    pub fn new(rooms: Arc<RoomManager>, stats: Arc<StatsCounters>) -> Self {
        Self { rooms, stats }
    }

    /// 按 (topic, filter) 发布。filter 的解析规则与客户端订阅时相同。
    pub fn publish(&self, topic: &str, filter: &Map<String, Value>, payload: Value) -> Result<PublishReport, FilterError> {
        let subscription = Subscription::parse(topic, filter)?;
        Ok(self.publish_to(&subscription, payload))
    }

    pub fn publish_to(&self, subscription: &Subscription, payload: Value) -> PublishReport {
        self.publish_room(&subscription.room_key(), Arc::new(payload))
    }

    /// 向指定房间发布。payload 由所有成员共享，不做复制。
    pub fn publish_room(&self, key: &RoomKey, payload: Arc<Value>) -> PublishReport {
        match self.rooms.publish(key, payload) {
            Some(receipt) => {
                self.stats.record_broadcast(receipt.delivered);
                self.stats.record_drops(receipt.dropped);
                debug!(
                    "[广播器] 房间 {} 第 {} 号事件已投递给 {} 个成员 (丢弃 {})",
                    key, receipt.sequence, receipt.delivered, receipt.dropped
                );
                PublishReport {
                    room_key: key.clone(),
                    sequence: Some(receipt.sequence),
                    delivered: receipt.delivered,
                    dropped: receipt.dropped,
                }
            }
            None => {
                debug!("[广播器] 房间 {} 没有订阅者，事件被忽略", key);
                PublishReport {
                    room_key: key.clone(),
                    sequence: None,
                    delivered: 0,
                    dropped: 0,
                }
            }
        }
    }
}
