//! 握手认证器。
//!
//! 认证分为两步：
//! - `verify`：只读检查 (格式、签名、声明一致性、过期、权限、nonce 是否已用)；
//! - `commit`：把 nonce 原子地写入缓存。并发提交同一 nonce 时只有一个成功，其余得到 `Replayed`。
//!
//! 服务层在两步之间执行按用户的连接限流，被限流的尝试不会消耗 nonce。

use crate::error::AuthError;
use crate::ws_server::nonce_cache::NonceCache;
use crate::ws_server::token_signer::{decode_claims, TokenClaims, TokenSigner};
use common_models::auth::{QUERY_EXPIRES, QUERY_NONCE, QUERY_SIGNATURE, QUERY_TOKEN};
use common_models::topics::Topic;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;

/// 握手 URL 中携带的令牌参数。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeParams {
    pub token: String,
    pub signature: String,
    pub nonce: String,
    pub expires_at: i64,
}

impl HandshakeParams {
    pub fn from_query(query: &HashMap<String, String>) -> Result<Self, AuthError> {
        let field = |name: &str| {
            query
                .get(name)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| AuthError::Malformed(format!("缺少参数 {}", name)))
        };
        let expires = field(QUERY_EXPIRES)?;
        let expires_at = expires
            .parse::<i64>()
            .map_err(|_| AuthError::Malformed(format!("参数 {} 不是整数", QUERY_EXPIRES)))?;
        Ok(Self {
            token: field(QUERY_TOKEN)?,
            signature: field(QUERY_SIGNATURE)?,
            nonce: field(QUERY_NONCE)?,
            expires_at,
        })
    }
}

pub struct Authenticator {
    signer: Arc<TokenSigner>,
    nonces: NonceCache,
    leeway_seconds: i64,
}

impl Authenticator {
    pub fn new(signer: Arc<TokenSigner>, leeway_seconds: u64) -> Self {
        Self {
            signer,
            nonces: NonceCache::new(),
            leeway_seconds: i64::try_from(leeway_seconds).unwrap_or(0),
        }
    }

    pub fn signer(&self) -> &Arc<TokenSigner> {
        &self.signer
    }

    /// 只读校验，不修改 nonce 缓存。
    pub fn verify(&self, params: &HandshakeParams, now: i64) -> Result<TokenClaims, AuthError> {
        let claims = decode_claims(&params.token)
            .ok_or_else(|| AuthError::Malformed("令牌无法解码".to_string()))?;

        if !self.signer.verify_signature(
            &claims.kid,
            &params.token,
            &params.nonce,
            params.expires_at,
            claims.subject(),
            &params.signature,
        ) {
            return Err(AuthError::InvalidSignature);
        }

        if claims.nonce != params.nonce || claims.exp != params.expires_at {
            return Err(AuthError::Malformed("令牌声明与握手参数不一致".to_string()));
        }

        if now > claims.exp.saturating_add(self.leeway_seconds) {
            return Err(AuthError::Expired { expires_at: claims.exp });
        }

        for room in &claims.rooms {
            match room.parse::<Topic>() {
                Ok(topic) if topic.requires_user() && claims.sub.is_none() => {
                    return Err(AuthError::InsufficientPermissions(format!("匿名令牌不能订阅 {}", room)));
                }
                Ok(_) => {}
                Err(_) => return Err(AuthError::InsufficientPermissions(format!("未知主题 {}", room))),
            }
        }

        if self.nonces.contains(&claims.nonce, now) {
            return Err(AuthError::Replayed);
        }
        Ok(claims)
    }

    /// 消耗令牌的 nonce。缓存保留到 `exp + leeway` 这一秒 (含)，与 `verify` 的过期判断对齐。
    pub fn commit(&self, claims: &TokenClaims, now: i64) -> Result<(), AuthError> {
        let keep_until = claims.exp.saturating_add(self.leeway_seconds);
        if self.nonces.insert_if_absent(&claims.nonce, keep_until, now) {
            debug!("[认证器] nonce {} 已登记，保留至 {}", claims.nonce, keep_until);
            Ok(())
        } else {
            warn!("[认证器] 检测到重放的 nonce {} (subject={})", claims.nonce, claims.subject());
            Err(AuthError::Replayed)
        }
    }

    /// `verify` + `commit`。
    pub fn validate(&self, params: &HandshakeParams, now: i64) -> Result<TokenClaims, AuthError> {
        let claims = self.verify(params, now)?;
        self.commit(&claims, now)?;
        Ok(claims)
    }

    pub fn purge_nonces(&self, now: i64) -> usize {
        self.nonces.purge_expired(now)
    }

    pub fn nonce_count(&self) -> usize {
        self.nonces.len()
    }
}
