//! 全局共享状态。
//!
//! 所有组件在启动时按配置创建一次，以 `Arc<HubState>` 的形式在 WebSocket 服务、
//! 心跳监视器、后台维护任务与管理 HTTP 接口之间共享。

use crate::config::AppConfig;
use crate::error::ConfigError;
use crate::ws_server::authenticator::Authenticator;
use crate::ws_server::broadcaster::Broadcaster;
use crate::ws_server::connection_manager::ConnectionManager;
use crate::ws_server::heartbeat_monitor::HeartbeatMonitor;
use crate::ws_server::outbound_queue::BackpressurePolicy;
use crate::ws_server::rate_limiter::RateLimiter;
use crate::ws_server::room_manager::RoomManager;
use crate::ws_server::stats::StatsCounters;
use crate::ws_server::token_signer::TokenSigner;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

pub struct HubState {
    pub config: AppConfig,
    pub signer: Arc<TokenSigner>,
    pub authenticator: Authenticator,
    pub rate_limiter: RateLimiter,
    pub rooms: Arc<RoomManager>,
    pub connections: Arc<ConnectionManager>,
    pub broadcaster: Broadcaster,
    pub stats: Arc<StatsCounters>,
    pub started_at: DateTime<Utc>,
}

impl HubState {
    /// 校验配置并创建所有组件。
    pub fn new(config: AppConfig) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let signer = Arc::new(TokenSigner::new(
            config.auth.key_id.clone(),
            config.auth.secret.as_bytes(),
            config.auth.token_ttl_seconds,
        ));
        let stats = Arc::new(StatsCounters::new());
        let rooms = Arc::new(RoomManager::new(
            config.limits.max_rooms,
            config.limits.max_rooms_per_connection,
        ));
        let policy = Arc::new(BackpressurePolicy::from_config(&config.backpressure));
        let connections = Arc::new(ConnectionManager::new(
            config.limits.max_connections,
            rooms.clone(),
            stats.clone(),
            policy,
        ));
        Ok(Arc::new(Self {
            authenticator: Authenticator::new(signer.clone(), config.auth.clock_leeway_seconds),
            rate_limiter: RateLimiter::new(&config.rate_limit),
            broadcaster: Broadcaster::new(rooms.clone(), stats.clone()),
            signer,
            rooms,
            connections,
            stats,
            started_at: Utc::now(),
            config,
        }))
    }

    pub fn heartbeat_monitor(&self) -> HeartbeatMonitor {
        HeartbeatMonitor::new(
            self.connections.clone(),
            self.stats.clone(),
            Duration::from_millis(self.config.heartbeat.timeout_ms),
            Duration::from_millis(self.config.heartbeat.interval_ms),
        )
    }

    pub fn uptime_seconds(&self) -> u64 {
        u64::try_from(Utc::now().signed_duration_since(self.started_at).num_seconds()).unwrap_or(0)
    }

    /// 清理过期 nonce 与空闲令牌桶，由后台维护任务定期调用。
    pub fn run_maintenance(&self) -> (usize, usize) {
        let nonces = self.authenticator.purge_nonces(Utc::now().timestamp());
        let buckets = self.rate_limiter.cleanup();
        (nonces, buckets)
    }
}
