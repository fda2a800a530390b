//! 管理 HTTP 接口 (`/status`、`/rooms`、`/broadcast/test`) 的请求与响应体。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// 服务端累计统计计数器的快照。
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub connections_closed: u64,
    /// 按拒绝原因 (关闭码名称) 细分的拒绝次数。
    #[serde(default)]
    pub rejected_by_reason: BTreeMap<String, u64>,
    pub heartbeat_timeouts: u64,
    pub broadcasts: u64,
    pub messages_delivered: u64,
    pub backpressure_drops: u64,
}

/// `GET /status` 响应体。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StatusResponse {
    pub connections: usize,
    pub active_connections: usize,
    pub rooms: usize,
    pub uptime_seconds: u64,
    pub stats: HubStats,
}

/// `GET /rooms` 响应体：房间键 → 成员数。
pub type RoomsResponse = BTreeMap<String, usize>;

/// `POST /broadcast/test` 请求体。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TestBroadcastRequest {
    pub topic: String,
    #[serde(default)]
    pub filter: Option<Map<String, Value>>,
    pub payload: Value,
}

/// `POST /broadcast/test` 响应体。房间不存在时 `sequence` 为空、`delivered` 为 0。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TestBroadcastResponse {
    pub room_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    pub delivered: usize,
}

/// 管理接口的错误响应体。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ApiErrorBody {
    pub error: String,
}
