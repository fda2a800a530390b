//! 令牌签发器。
//!
//! 令牌 (`token`) 是 base64url 编码的 JSON 声明；签名是对
//! `token.nonce.expires_at.subject` 计算的 HMAC-SHA256，同样以 base64url 编码。
//! `subject` 为用户 ID，匿名令牌为 `anonymous`。
//!
//! 签发器持有一个按 `kid` 索引的密钥环：`rotate` 切换当前签名密钥，
//! 旧密钥在 `retire` 之前仍可用于校验，从而允许平滑轮换。

use crate::error::TokenIssueError;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use common_models::auth::TokenGrant;
use common_models::topics::Topic;
use hmac::{Hmac, Mac};
use log::{debug, info, warn};
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::{BTreeMap, HashMap};

type HmacSha256 = Hmac<Sha256>;

/// 匿名令牌签名时使用的 subject。
pub const ANONYMOUS_SUBJECT: &str = "anonymous";

/// 令牌中携带的声明。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// 允许订阅的主题名。为空表示不额外限制 (仍受主题自身的登录要求约束)。
    #[serde(default)]
    pub rooms: Vec<String>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    pub iat: i64,
    pub exp: i64,
    pub kid: String,
    pub nonce: String,
}

impl TokenClaims {
    pub fn subject(&self) -> &str {
        self.sub.as_deref().unwrap_or(ANONYMOUS_SUBJECT)
    }

    /// 持有此令牌的连接能否订阅 `topic`。
    pub fn permits(&self, topic: Topic) -> bool {
        if topic.requires_user() && self.sub.is_none() {
            return false;
        }
        self.rooms.is_empty() || self.rooms.iter().any(|r| r == topic.as_str())
    }
}

struct KeyRing {
    active: String,
    keys: HashMap<String, Vec<u8>>,
}

pub struct TokenSigner {
    ring: RwLock<KeyRing>,
    ttl_seconds: i64,
}

impl TokenSigner {
    pub fn new(key_id: impl Into<String>, secret: impl AsRef<[u8]>, ttl_seconds: u64) -> Self {
        let key_id = key_id.into();
        let mut keys = HashMap::new();
        keys.insert(key_id.clone(), secret.as_ref().to_vec());
        Self {
            ring: RwLock::new(KeyRing { active: key_id, keys }),
            ttl_seconds: i64::try_from(ttl_seconds).unwrap_or(i64::MAX),
        }
    }

    pub fn ttl_seconds(&self) -> i64 {
        self.ttl_seconds
    }

    pub fn active_key_id(&self) -> String {
        self.ring.read().active.clone()
    }

    /// 以新密钥作为当前签名密钥。之前的密钥继续参与校验。
    pub fn rotate(&self, key_id: impl Into<String>, secret: impl AsRef<[u8]>) {
        let key_id = key_id.into();
        let mut ring = self.ring.write();
        ring.keys.insert(key_id.clone(), secret.as_ref().to_vec());
        info!("[令牌签发] 签名密钥已轮换: {} -> {}", ring.active, key_id);
        ring.active = key_id;
    }

    /// 移除一个非当前的密钥。用它签发的令牌此后都会校验失败。
    pub fn retire(&self, key_id: &str) -> bool {
        let mut ring = self.ring.write();
        if ring.active == key_id {
            warn!("[令牌签发] 拒绝移除当前正在使用的签名密钥 {}", key_id);
            return false;
        }
        ring.keys.remove(key_id).is_some()
    }

    pub fn issue(
        &self,
        user_id: Option<&str>,
        requested_rooms: &[String],
        client_meta: BTreeMap<String, String>,
    ) -> Result<TokenGrant, TokenIssueError> {
        self.issue_at(user_id, requested_rooms, client_meta, Utc::now().timestamp())
    }

    /// 在给定时间 (Unix 秒) 签发令牌。
    pub fn issue_at(
        &self,
        user_id: Option<&str>,
        requested_rooms: &[String],
        client_meta: BTreeMap<String, String>,
        now: i64,
    ) -> Result<TokenGrant, TokenIssueError> {
        let user_id = user_id.map(str::trim).filter(|u| !u.is_empty());
        let mut rooms: Vec<String> = Vec::with_capacity(requested_rooms.len());
        for name in requested_rooms {
            let topic: Topic = name
                .parse()
                .map_err(|_| TokenIssueError::UnknownTopic(name.clone()))?;
            if topic.requires_user() && user_id.is_none() {
                return Err(TokenIssueError::UserRequired(name.clone()));
            }
            if !rooms.iter().any(|r| r == topic.as_str()) {
                rooms.push(topic.as_str().to_string());
            }
        }

        let mut nonce_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = hex::encode(nonce_bytes);
        let expires_at = now.saturating_add(self.ttl_seconds);

        let ring = self.ring.read();
        let claims = TokenClaims {
            sub: user_id.map(str::to_string),
            rooms,
            meta: client_meta,
            iat: now,
            exp: expires_at,
            kid: ring.active.clone(),
            nonce: nonce.clone(),
        };
        // 声明只包含字符串与整数，序列化不会失败
        let claims_json = serde_json::to_vec(&claims).unwrap_or_default();
        let token = URL_SAFE_NO_PAD.encode(claims_json);
        let key = ring.keys.get(&ring.active).map(Vec::as_slice).unwrap_or_default();
        let signature = URL_SAFE_NO_PAD.encode(compute_mac(key, &token, &nonce, expires_at, claims.subject()));
        debug!(
            "[令牌签发] 为 {} 签发令牌 (kid={}, 过期于 {})",
            claims.subject(),
            claims.kid,
            expires_at
        );
        Ok(TokenGrant {
            token,
            signature,
            nonce,
            expires_at,
        })
    }

    /// 以常数时间比较校验签名。`kid` 未知或已被移除时返回 `false`。
    pub fn verify_signature(
        &self,
        kid: &str,
        token: &str,
        nonce: &str,
        expires_at: i64,
        subject: &str,
        signature: &str,
    ) -> bool {
        let Ok(provided) = URL_SAFE_NO_PAD.decode(signature) else {
            return false;
        };
        let ring = self.ring.read();
        let Some(key) = ring.keys.get(kid) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
            return false;
        };
        mac.update(signing_input(token, nonce, expires_at, subject).as_bytes());
        mac.verify_slice(&provided).is_ok()
    }
}

/// 从 base64url 令牌中解出声明。
pub fn decode_claims(token: &str) -> Option<TokenClaims> {
    let bytes = URL_SAFE_NO_PAD.decode(token).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn signing_input(token: &str, nonce: &str, expires_at: i64, subject: &str) -> String {
    format!("{}.{}.{}.{}", token, nonce, expires_at, subject)
}

fn compute_mac(key: &[u8], token: &str, nonce: &str, expires_at: i64, subject: &str) -> Vec<u8> {
    match HmacSha256::new_from_slice(key) {
        Ok(mut mac) => {
            mac.update(signing_input(token, nonce, expires_at, subject).as_bytes());
            mac.finalize().into_bytes().to_vec()
        }
        // HMAC 接受任意长度的密钥
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn signer() -> TokenSigner {
        TokenSigner::new("k1", b"unit-test-secret", 600)
    }

    fn verify(s: &TokenSigner, grant: &TokenGrant) -> bool {
        let claims = decode_claims(&grant.token).expect("令牌应能解出声明");
        s.verify_signature(
            &claims.kid,
            &grant.token,
            &grant.nonce,
            grant.expires_at,
            claims.subject(),
            &grant.signature,
        )
    }

    #[test]
    /// 测试签发出的令牌字段自洽，且签名可以被校验。
    fn test_issue_and_verify() {
        let s = signer();
        let grant = s
            .issue_at(Some("u1"), &["odds_updates".into()], BTreeMap::new(), NOW)
            .expect("签发令牌失败");
        assert_eq!(grant.expires_at, NOW + 600);
        assert_eq!(grant.nonce.len(), 32, "nonce 应为 16 字节的十六进制");

        let claims = decode_claims(&grant.token).expect("解出声明失败");
        assert_eq!(claims.sub.as_deref(), Some("u1"));
        assert_eq!(claims.nonce, grant.nonce);
        assert_eq!(claims.exp, grant.expires_at);
        assert!(verify(&s, &grant));
    }

    #[test]
    /// 测试篡改任意一个字段都会导致签名校验失败。
    fn test_tampering_breaks_signature() {
        let s = signer();
        let grant = s.issue_at(None, &[], BTreeMap::new(), NOW).expect("签发令牌失败");
        let claims = decode_claims(&grant.token).expect("解出声明失败");

        assert!(!s.verify_signature("k1", &grant.token, "other-nonce", grant.expires_at, ANONYMOUS_SUBJECT, &grant.signature));
        assert!(!s.verify_signature("k1", &grant.token, &grant.nonce, grant.expires_at + 1, ANONYMOUS_SUBJECT, &grant.signature));
        assert!(!s.verify_signature("k1", &grant.token, &grant.nonce, grant.expires_at, "u1", &grant.signature));
        assert!(!s.verify_signature("k1", &grant.token, &grant.nonce, grant.expires_at, claims.subject(), "bm90LWEtc2ln"));

        let forged = TokenSigner::new("k1", b"another-secret", 600);
        assert!(!verify(&forged, &grant), "不同密钥不应校验通过");
    }

    #[test]
    /// 测试密钥轮换：旧密钥在移除前继续有效，移除后失效。
    fn test_key_rotation() {
        let s = signer();
        let old = s.issue_at(Some("u1"), &[], BTreeMap::new(), NOW).expect("签发令牌失败");
        s.rotate("k2", b"second-secret");
        assert_eq!(s.active_key_id(), "k2");
        let new = s.issue_at(Some("u1"), &[], BTreeMap::new(), NOW).expect("签发令牌失败");
        assert_eq!(decode_claims(&new.token).map(|c| c.kid).as_deref(), Some("k2"));

        assert!(verify(&s, &old), "轮换后旧令牌在旧密钥被移除前仍然有效");
        assert!(verify(&s, &new));
        assert!(!s.retire("k2"), "不能移除当前密钥");
        assert!(s.retire("k1"));
        assert!(!verify(&s, &old), "旧密钥被移除后旧令牌应失效");
    }

    #[test]
    /// 测试签发时的主题策略。
    fn test_issue_policy() {
        let s = signer();
        assert_eq!(
            s.issue_at(None, &["weather".into()], BTreeMap::new(), NOW),
            Err(TokenIssueError::UnknownTopic("weather".into()))
        );
        assert_eq!(
            s.issue_at(Some("  "), &["predictions".into()], BTreeMap::new(), NOW),
            Err(TokenIssueError::UserRequired("predictions".into())),
            "空白用户名视为匿名"
        );
        let grant = s
            .issue_at(Some("u1"), &["predictions".into(), "predictions".into()], BTreeMap::new(), NOW)
            .expect("登录用户应能申请 predictions");
        let claims = decode_claims(&grant.token).expect("解出声明失败");
        assert_eq!(claims.rooms, vec!["predictions".to_string()], "重复的主题应被去重");
        assert!(claims.permits(Topic::Predictions));
        assert!(!claims.permits(Topic::OddsUpdates), "非空 rooms 限定了可订阅主题");
    }

    #[test]
    fn test_anonymous_permissions() {
        let claims = TokenClaims {
            sub: None,
            rooms: vec![],
            meta: BTreeMap::new(),
            iat: NOW,
            exp: NOW + 600,
            kid: "k1".into(),
            nonce: "n".into(),
        };
        assert!(claims.permits(Topic::OddsUpdates));
        assert!(!claims.permits(Topic::Predictions), "匿名用户不能订阅 predictions");
        assert_eq!(claims.subject(), ANONYMOUS_SUBJECT);
    }
}
