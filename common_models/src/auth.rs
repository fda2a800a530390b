//! 令牌签发相关的共享结构。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 握手 URL 中携带令牌各字段的查询参数名。
pub const QUERY_TOKEN: &str = "token";
pub const QUERY_SIGNATURE: &str = "signature";
pub const QUERY_NONCE: &str = "nonce";
pub const QUERY_EXPIRES: &str = "expires";

/// 令牌签发接口的返回体，字段名与认证器在握手时期待的参数一一对应。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub token: String,
    pub signature: String,
    pub nonce: String,
    /// 过期时间 (Unix 秒)。
    pub expires_at: i64,
}

impl TokenGrant {
    /// 握手 URL 的查询参数对。
    pub fn query_pairs(&self) -> [(&'static str, String); 4] {
        [
            (QUERY_TOKEN, self.token.clone()),
            (QUERY_SIGNATURE, self.signature.clone()),
            (QUERY_NONCE, self.nonce.clone()),
            (QUERY_EXPIRES, self.expires_at.to_string()),
        ]
    }

    pub fn is_expired_at(&self, now_unix: i64) -> bool {
        now_unix >= self.expires_at
    }
}

/// `POST /auth/token` 的请求体。
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// 申请可订阅的主题名列表。
    #[serde(default)]
    pub rooms: Vec<String>,
    #[serde(default)]
    pub client_meta: BTreeMap<String, String>,
}
