//! 心跳监视器模块。
//!
//! 定期检查所有 ACTIVE 连接的活跃状态：对仍然存活的连接发送应用层 `ping`，
//! 对超过超时阈值仍未回复 `pong` 的连接以 4005 关闭。关闭时房间成员关系会被立即清理。

use crate::ws_server::connection_manager::ConnectionManager;
use crate::ws_server::outbound_queue::Outbound;
use crate::ws_server::stats::StatsCounters;
use chrono::{DateTime, Utc};
use common_models::enums::HubCloseCode;
use common_models::ws_payloads::ServerMessage;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

/// 一轮检查的结果
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub pinged: usize,
    pub reaped: usize,
}

/// `HeartbeatMonitor` 持有连接管理器的共享引用，
/// 以及客户端超时阈值与检查周期。
pub struct HeartbeatMonitor {
    connection_manager: Arc<ConnectionManager>,
    stats: Arc<StatsCounters>,
    /// 距离上一次 pong 超过此时长的连接被判定为失联
    client_timeout_duration: Duration,
    /// 检查周期，同时也是 ping 的发送周期
    check_interval: Duration,
}

impl HeartbeatMonitor {
    pub fn new(
        connection_manager: Arc<ConnectionManager>,
        stats: Arc<StatsCounters>,
        client_timeout_duration: Duration,
        check_interval: Duration,
    ) -> Self {
        info!(
            "[心跳监视器] 正在创建 HeartbeatMonitor 实例。客户端超时阈值: {:?}，检查周期: {:?}",
            client_timeout_duration, check_interval
        );
        Self {
            connection_manager,
            stats,
            client_timeout_duration,
            check_interval,
        }
    }

    /// 后台运行循环，直到 `shutdown` 变为 `true` 或发送端被丢弃。
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "[心跳监视器] 后台运行循环已启动，将按 {:?} 的周期检查客户端连接状态。",
            self.check_interval
        );
        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval 的第一次 tick 立即完成，跳过它
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep(Utc::now()).await;
                    debug!("[心跳监视器] 本轮检查完成: {:?}", report);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("[心跳监视器] 收到关闭信号，后台运行循环退出。");
                        break;
                    }
                }
            }
        }
    }

    /// 以给定时间执行一轮检查。
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let sessions = self.connection_manager.active_sessions();
        let mut report = SweepReport::default();
        if sessions.is_empty() {
            return report;
        }

        let timeout = chrono::Duration::from_std(self.client_timeout_duration).unwrap_or_else(|e| {
            warn!(
                "[心跳监视器] 无法转换超时阈值 {:?}: {}，本轮使用 60 秒",
                self.client_timeout_duration, e
            );
            chrono::Duration::seconds(60)
        });

        for session in &sessions {
            let last_pong = session.last_pong().await;
            let silent_for = now.signed_duration_since(last_pong);
            if silent_for >= timeout {
                warn!(
                    "[心跳监视器] 客户端 {} (ID: {}) 已超时！最后一次 pong: {} ，已沉默 {} 秒。将以 4005 关闭。",
                    session.addr,
                    session.connection_id,
                    last_pong,
                    silent_for.num_seconds()
                );
                if self.connection_manager.close(
                    session,
                    HubCloseCode::HeartbeatTimeout,
                    HubCloseCode::HeartbeatTimeout.default_reason(),
                ) {
                    self.stats.record_heartbeat_timeout();
                    report.reaped += 1;
                }
            } else if session.send_critical(Outbound::Message(ServerMessage::Ping {
                timestamp: now.timestamp_millis(),
            })) {
                report.pinged += 1;
            }
        }
        report
    }
}
