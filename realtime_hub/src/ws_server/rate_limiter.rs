//! 令牌桶限流器。
//!
//! 每个 (操作, 维度) 组合各有一张 `DashMap<String, TokenBucket>`，键为 IP 或用户 ID。
//! 桶按经过的时间连续补充令牌，取令牌与补充在同一分片写锁内完成。

use crate::config::{BucketConfig, RateLimitConfig};
use crate::error::{LimitScope, RateLimitError, RateOp};
use dashmap::DashMap;
use log::{debug, warn};
use std::net::IpAddr;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(config: &BucketConfig, now: Instant) -> Self {
        Self {
            tokens: f64::from(config.capacity),
            last_refill: now,
        }
    }

    fn refill(&mut self, config: &BucketConfig, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * config.refill_per_second)
            .min(f64::from(config.capacity));
        self.last_refill = now;
    }

    /// 取一个令牌；不足时返回还需等待的时间。
    fn try_take(&mut self, config: &BucketConfig, now: Instant) -> Result<(), Duration> {
        self.refill(config, now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let needed = 1.0 - self.tokens;
            Err(Duration::try_from_secs_f64(needed / config.refill_per_second).unwrap_or(Duration::MAX))
        }
    }

    fn give_back(&mut self, config: &BucketConfig) {
        self.tokens = (self.tokens + 1.0).min(f64::from(config.capacity));
    }

    fn is_full(&self, config: &BucketConfig) -> bool {
        self.tokens >= f64::from(config.capacity)
    }
}

struct Limiter {
    config: BucketConfig,
    buckets: DashMap<String, TokenBucket>,
}

impl Limiter {
    fn new(config: BucketConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    fn check(&self, key: &str, now: Instant) -> Result<(), Duration> {
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::full(&self.config, now));
        bucket.try_take(&self.config, now)
    }

    /// 归还一个此前取走的令牌。
    fn refund(&self, key: &str) {
        if let Some(mut bucket) = self.buckets.get_mut(key) {
            bucket.give_back(&self.config);
        }
    }

    /// 清除空闲超过 `idle_ttl` 且已补满的桶。补满的桶与新建的桶等价。
    fn cleanup(&self, now: Instant, idle_ttl: Duration) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            let idle = now.saturating_duration_since(bucket.last_refill);
            if idle < idle_ttl {
                return true;
            }
            let mut projected = bucket.clone();
            projected.refill(&self.config, now);
            !projected.is_full(&self.config)
        });
        before.saturating_sub(self.buckets.len())
    }

    fn len(&self) -> usize {
        self.buckets.len()
    }
}

pub struct RateLimiter {
    enabled: bool,
    idle_ttl: Duration,
    connect_ip: Limiter,
    connect_user: Limiter,
    subscribe_ip: Limiter,
    subscribe_user: Limiter,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        if !config.enabled {
            warn!("[限流器] 限流已在配置中关闭，所有请求都将放行");
        }
        Self {
            enabled: config.enabled,
            idle_ttl: Duration::from_secs(config.idle_bucket_ttl_seconds),
            connect_ip: Limiter::new(config.connect_per_ip),
            connect_user: Limiter::new(config.connect_per_user),
            subscribe_ip: Limiter::new(config.subscribe_per_ip),
            subscribe_user: Limiter::new(config.subscribe_per_user),
        }
    }

    fn limiter(&self, op: RateOp, scope: LimitScope) -> &Limiter {
        match (op, scope) {
            (RateOp::Connect, LimitScope::Ip) => &self.connect_ip,
            (RateOp::Connect, LimitScope::User) => &self.connect_user,
            (RateOp::Subscribe, LimitScope::Ip) => &self.subscribe_ip,
            (RateOp::Subscribe, LimitScope::User) => &self.subscribe_user,
        }
    }

    pub fn check(&self, op: RateOp, scope: LimitScope, key: &str, now: Instant) -> Result<(), RateLimitError> {
        if !self.enabled {
            return Ok(());
        }
        self.limiter(op, scope).check(key, now).map_err(|retry_after| {
            debug!("[限流器] {:?}/{:?} 键 {} 被限流，{:?} 后可重试", op, scope, key, retry_after);
            RateLimitError { op, scope, retry_after }
        })
    }

    pub fn check_connect_ip(&self, ip: IpAddr) -> Result<(), RateLimitError> {
        self.check_connect_ip_at(ip, Instant::now())
    }

    pub fn check_connect_ip_at(&self, ip: IpAddr, now: Instant) -> Result<(), RateLimitError> {
        self.check(RateOp::Connect, LimitScope::Ip, &ip.to_string(), now)
    }

    pub fn check_connect_user(&self, user_id: &str) -> Result<(), RateLimitError> {
        self.check_connect_user_at(user_id, Instant::now())
    }

    pub fn check_connect_user_at(&self, user_id: &str, now: Instant) -> Result<(), RateLimitError> {
        self.check(RateOp::Connect, LimitScope::User, user_id, now)
    }

    pub fn check_subscribe(&self, ip: IpAddr, user_id: Option<&str>) -> Result<(), RateLimitError> {
        self.check_subscribe_at(ip, user_id, Instant::now())
    }

    /// 先检查 IP 维度，再检查用户维度 (匿名连接只有 IP 维度)。
    /// 用户维度拒绝时归还已取走的 IP 令牌，被拒绝的请求不消耗任何一个桶。
    pub fn check_subscribe_at(&self, ip: IpAddr, user_id: Option<&str>, now: Instant) -> Result<(), RateLimitError> {
        let ip_key = ip.to_string();
        self.check(RateOp::Subscribe, LimitScope::Ip, &ip_key, now)?;
        if let Some(user) = user_id {
            if let Err(e) = self.check(RateOp::Subscribe, LimitScope::User, user, now) {
                self.subscribe_ip.refund(&ip_key);
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    pub fn cleanup_at(&self, now: Instant) -> usize {
        let removed = self.connect_ip.cleanup(now, self.idle_ttl)
            + self.connect_user.cleanup(now, self.idle_ttl)
            + self.subscribe_ip.cleanup(now, self.idle_ttl)
            + self.subscribe_user.cleanup(now, self.idle_ttl);
        if removed > 0 {
            debug!("[限流器] 清理了 {} 个空闲令牌桶", removed);
        }
        removed
    }

    pub fn bucket_count(&self) -> usize {
        self.connect_ip.len() + self.connect_user.len() + self.subscribe_ip.len() + self.subscribe_user.len()
    }
}
