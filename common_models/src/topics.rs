//! 主题、强类型过滤器与房间键。
//!
//! 客户端在 `subscribe` 消息中以字符串形式给出 `topic` 和 `filter`，
//! 服务端在订阅时一次性地把它们解析为 [`Subscription`] 枚举 (每个主题一种过滤器结构)，
//! 再规范化为 [`RoomKey`]。发布路径只处理已经解析好的 `Subscription`，不再做字符串分派。
//!
//! 房间键格式为 `topic:{k1=v1,k2=v2}`：字段按字典序排列、缺省字段省略，
//! 因此过滤器字段的书写顺序不影响结果。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// 已知的订阅主题。
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    OddsUpdates,
    PropUpdates,
    GameUpdates,
    Predictions,
    SystemStatus,
}

impl Topic {
    pub const ALL: [Topic; 5] = [
        Topic::OddsUpdates,
        Topic::PropUpdates,
        Topic::GameUpdates,
        Topic::Predictions,
        Topic::SystemStatus,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Topic::OddsUpdates => "odds_updates",
            Topic::PropUpdates => "prop_updates",
            Topic::GameUpdates => "game_updates",
            Topic::Predictions => "predictions",
            Topic::SystemStatus => "system_status",
        }
    }

    /// 该主题允许出现的过滤器字段 (已排序)。
    pub const fn filter_fields(self) -> &'static [&'static str] {
        match self {
            Topic::OddsUpdates => &["game_id", "sport", "sportsbook"],
            Topic::PropUpdates => &["market", "player_id", "sport"],
            Topic::GameUpdates => &["game_id", "sport"],
            Topic::Predictions => &["model", "sport"],
            Topic::SystemStatus => &[],
        }
    }

    /// 模型预测只向已登录用户开放。
    pub const fn requires_user(self) -> bool {
        matches!(self, Topic::Predictions)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| FilterError::UnknownTopic(s.to_string()))
    }
}

/// 解析主题或过滤器失败的原因。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("未知主题: {0}")]
    UnknownTopic(String),
    #[error("主题 {topic} 不支持过滤字段 {field}")]
    UnknownField { topic: Topic, field: String },
    #[error("过滤字段 {field} 的值无效: {reason}")]
    InvalidValue { field: String, reason: &'static str },
    #[error("无法解析房间键: {0}")]
    MalformedRoomKey(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct OddsFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sport: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sportsbook: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PropFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sport: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct GameFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sport: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PredictionFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sport: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// 一次已解析的订阅：主题 + 对应的强类型过滤器。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subscription {
    OddsUpdates(OddsFilter),
    PropUpdates(PropFilter),
    GameUpdates(GameFilter),
    Predictions(PredictionFilter),
    SystemStatus,
}

impl Subscription {
    /// 从线上的 `topic` 字符串与 `filter` 对象解析订阅。
    ///
    /// 字段值可以是字符串、数字或布尔值，统一转换为去除首尾空白的字符串；
    /// `null` 与空字符串视为未设置；`sport` 统一转为大写。
    pub fn parse(topic: &str, filter: &Map<String, Value>) -> Result<Self, FilterError> {
        let topic: Topic = topic.parse()?;
        let mut fields = normalize_fields(topic, filter)?;
        let mut take = |name: &str| fields.remove(name);

        Ok(match topic {
            Topic::OddsUpdates => Subscription::OddsUpdates(OddsFilter {
                sport: take("sport"),
                game_id: take("game_id"),
                sportsbook: take("sportsbook"),
            }),
            Topic::PropUpdates => Subscription::PropUpdates(PropFilter {
                sport: take("sport"),
                player_id: take("player_id"),
                market: take("market"),
            }),
            Topic::GameUpdates => Subscription::GameUpdates(GameFilter {
                sport: take("sport"),
                game_id: take("game_id"),
            }),
            Topic::Predictions => Subscription::Predictions(PredictionFilter {
                sport: take("sport"),
                model: take("model"),
            }),
            Topic::SystemStatus => Subscription::SystemStatus,
        })
    }

    pub fn topic(&self) -> Topic {
        match self {
            Subscription::OddsUpdates(_) => Topic::OddsUpdates,
            Subscription::PropUpdates(_) => Topic::PropUpdates,
            Subscription::GameUpdates(_) => Topic::GameUpdates,
            Subscription::Predictions(_) => Topic::Predictions,
            Subscription::SystemStatus => Topic::SystemStatus,
        }
    }

    /// 已设置的过滤字段，按字段名排序。
    pub fn fields(&self) -> BTreeMap<&'static str, &str> {
        let pairs: Vec<(&'static str, Option<&String>)> = match self {
            Subscription::OddsUpdates(f) => vec![
                ("sport", f.sport.as_ref()),
                ("game_id", f.game_id.as_ref()),
                ("sportsbook", f.sportsbook.as_ref()),
            ],
            Subscription::PropUpdates(f) => vec![
                ("sport", f.sport.as_ref()),
                ("player_id", f.player_id.as_ref()),
                ("market", f.market.as_ref()),
            ],
            Subscription::GameUpdates(f) => vec![
                ("sport", f.sport.as_ref()),
                ("game_id", f.game_id.as_ref()),
            ],
            Subscription::Predictions(f) => vec![
                ("sport", f.sport.as_ref()),
                ("model", f.model.as_ref()),
            ],
            Subscription::SystemStatus => Vec::new(),
        };
        pairs
            .into_iter()
            .filter_map(|(name, value)| value.map(|v| (name, v.as_str())))
            .collect()
    }

    /// 规范化的房间键。相同的 (topic, filter) 无论字段顺序如何都得到同一个键。
    pub fn room_key(&self) -> RoomKey {
        let body = self
            .fields()
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        RoomKey(format!("{}:{{{}}}", self.topic().as_str(), body))
    }

    /// 转回线上的 `filter` JSON 对象，供客户端重放订阅时使用。
    pub fn filter_map(&self) -> Map<String, Value> {
        self.fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect()
    }
}

fn normalize_fields(
    topic: Topic,
    filter: &Map<String, Value>,
) -> Result<BTreeMap<String, String>, FilterError> {
    let allowed = topic.filter_fields();
    let mut out = BTreeMap::new();
    for (field, raw) in filter {
        if !allowed.contains(&field.as_str()) {
            return Err(FilterError::UnknownField {
                topic,
                field: field.clone(),
            });
        }
        let text = match raw {
            Value::Null => continue,
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Array(_) | Value::Object(_) => {
                return Err(FilterError::InvalidValue {
                    field: field.clone(),
                    reason: "必须是标量",
                });
            }
        };
        if text.is_empty() {
            continue;
        }
        // 这些字符是房间键的分隔符
        if text.contains([',', '=', '{', '}']) {
            return Err(FilterError::InvalidValue {
                field: field.clone(),
                reason: "包含保留字符",
            });
        }
        let text = if field == "sport" {
            text.to_uppercase()
        } else {
            text
        };
        out.insert(field.clone(), text);
    }
    Ok(out)
}

/// 规范化的房间键，例如 `odds_updates:{sport=MLB}`。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct RoomKey(String);

impl RoomKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 解析客户端传回的房间键 (例如按 `room_key` 退订)，并重新规范化。
    pub fn parse(raw: &str) -> Result<Subscription, FilterError> {
        let malformed = || FilterError::MalformedRoomKey(raw.to_string());
        let (topic, rest) = raw.split_once(':').ok_or_else(malformed)?;
        let body = rest
            .strip_prefix('{')
            .and_then(|r| r.strip_suffix('}'))
            .ok_or_else(malformed)?;
        let mut filter = Map::new();
        for pair in body.split(',').filter(|p| !p.is_empty()) {
            let (k, v) = pair.split_once('=').ok_or_else(malformed)?;
            filter.insert(k.to_string(), Value::String(v.to_string()));
        }
        Subscription::parse(topic, &filter)
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RoomKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
