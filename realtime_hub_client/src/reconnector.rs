//! 断线重连客户端。
//!
//! 后台任务负责：获取令牌、连接并等待 `welcome`、按顺序恢复订阅、转发事件、回复 `ping`。
//! 连接建立后，超过两个心跳周期没有收到任何服务端消息即视为连接已断开。
//! 连接断开后按 [`Backoff`] 等待再重连；连续失败达到上限时发出 `PersistentFailure` 并停止。
//! 只有调用 [`ClientReconnector::close`] 才会正常结束，不再重连。

use crate::backoff::Backoff;
use crate::error::ClientError;
use crate::subscriptions::{subscribe_message, SubscriptionLedger};
use crate::token_source::TokenProvider;
use chrono::Utc;
use common_models::enums::HubCloseCode;
use common_models::topics::{RoomKey, Subscription};
use common_models::ws_payloads::{ClientMessage, ErrorBody, ServerMessage};
use common_models::TokenGrant;
use log::{debug, info, warn};
use rust_websocket_utils::client::transport::{connect_client, receive_message, ClientConnection, Incoming};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use url::Url;

const CLOSE_GRACE: Duration = Duration::from_secs(2);
/// 服务端未声明心跳周期时使用的值
const FALLBACK_HEARTBEAT: Duration = Duration::from_secs(30);
/// 允许连续错过的心跳周期数
const MISSED_HEARTBEATS: u32 = 2;

#[derive(Debug, Clone)]
pub struct ReconnectorConfig {
    /// 不含查询参数的服务端地址，例如 `ws://127.0.0.1:8088/ws/connect`
    pub url: String,
    pub backoff: Backoff,
    /// 连接建立后等待 `welcome` 的最长时间
    pub welcome_timeout: Duration,
}

impl ReconnectorConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            backoff: Backoff::default(),
            welcome_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    /// 正在退避等待下一次重连
    Reconnecting,
    /// 已由调用方关闭
    Closed,
    /// 连续失败次数达到上限，已放弃
    Failed,
}

/// 交给调用方的事件。
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected {
        connection_id: String,
    },
    Subscribed {
        room_key: String,
        request_id: Option<String>,
    },
    Unsubscribed {
        room_key: String,
        request_id: Option<String>,
    },
    Event {
        room_key: String,
        sequence: u64,
        payload: Arc<Value>,
    },
    ServerError {
        error: ErrorBody,
        request_id: Option<String>,
    },
    Disconnected {
        code: Option<u16>,
        reason: String,
    },
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    PersistentFailure {
        attempts: u32,
    },
}

enum Command {
    Subscribe(Subscription),
    Unsubscribe(RoomKey),
    Close,
}

/// 后台重连任务的句柄。
pub struct ClientReconnector {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    task: JoinHandle<()>,
}

impl ClientReconnector {
    /// 启动后台任务，返回句柄与事件接收端。
    pub fn spawn(
        config: ReconnectorConfig,
        provider: Arc<dyn TokenProvider>,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
        let supervisor = Supervisor {
            config,
            provider,
            commands: command_rx,
            events: event_tx,
            status: status_tx,
            ledger: SubscriptionLedger::new(),
        };
        let task = tokio::spawn(supervisor.run());
        let handle = Self {
            commands: command_tx,
            status: status_rx,
            task,
        };
        (handle, event_rx)
    }

    /// 订阅。断线期间的订阅会在重连后发送。
    pub fn subscribe(&self, topic: &str, filter: Map<String, Value>) -> Result<RoomKey, ClientError> {
        let subscription = Subscription::parse(topic, &filter)?;
        let key = subscription.room_key();
        self.send(Command::Subscribe(subscription))?;
        Ok(key)
    }

    pub fn unsubscribe(&self, key: &RoomKey) -> Result<(), ClientError> {
        self.send(Command::Unsubscribe(key.clone()))
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// 以 1000 关闭连接并等待后台任务结束。
    pub async fn close(self) -> Result<(), ClientError> {
        // 任务可能已因连续失败而退出
        let _ = self.commands.send(Command::Close);
        self.task.await.map_err(|_| ClientError::Stopped)
    }

    fn send(&self, command: Command) -> Result<(), ClientError> {
        self.commands.send(command).map_err(|_| ClientError::Stopped)
    }
}

/// 一次连接尝试的结果
enum Attempt {
    /// 未能进入 ACTIVE
    Failed,
    /// 收到过 `welcome`，之后连接断开
    SessionEnded,
    /// 调用方要求关闭
    Stopped,
}

struct Supervisor {
    config: ReconnectorConfig,
    provider: Arc<dyn TokenProvider>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ClientEvent>,
    status: watch::Sender<ConnectionStatus>,
    ledger: SubscriptionLedger,
}

impl Supervisor {
    async fn run(mut self) {
        let mut failures: u32 = 0;
        let mut spare_grant: Option<TokenGrant> = None;
        loop {
            match self.attempt(&mut spare_grant).await {
                Attempt::Stopped => {
                    self.status.send_replace(ConnectionStatus::Closed);
                    info!("[重连客户端] 已按调用方要求关闭。");
                    return;
                }
                Attempt::SessionEnded => failures = 0,
                Attempt::Failed => {
                    failures += 1;
                    if self.config.backoff.exhausted(failures) {
                        warn!("[重连客户端] 连续 {} 次连接失败，停止重连。", failures);
                        self.emit(ClientEvent::PersistentFailure { attempts: failures });
                        self.status.send_replace(ConnectionStatus::Failed);
                        return;
                    }
                }
            }

            let delay = self.config.backoff.delay(failures);
            info!("[重连客户端] {:?} 后进行第 {} 次重连", delay, failures + 1);
            self.emit(ClientEvent::Reconnecting {
                attempt: failures + 1,
                delay,
            });
            self.status.send_replace(ConnectionStatus::Reconnecting);
            if !self.wait_backoff(delay).await {
                self.status.send_replace(ConnectionStatus::Closed);
                return;
            }
        }
    }

    async fn attempt(&mut self, spare_grant: &mut Option<TokenGrant>) -> Attempt {
        self.status.send_replace(ConnectionStatus::Connecting);
        let now = Utc::now().timestamp();
        let grant = match spare_grant.take().filter(|g| !g.is_expired_at(now)) {
            Some(grant) => grant,
            None => match self.provider.fetch().await {
                Ok(grant) => grant,
                Err(e) => {
                    warn!("[重连客户端] 获取令牌失败: {}", e);
                    return Attempt::Failed;
                }
            },
        };
        let url = match handshake_url(&self.config.url, &grant) {
            Ok(url) => url,
            Err(e) => {
                warn!("[重连客户端] {}", e);
                return Attempt::Failed;
            }
        };

        let mut conn = match connect_client(&url).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("[重连客户端] 连接失败: {}", e);
                // 握手没有到达服务端，令牌仍可使用
                *spare_grant = Some(grant);
                return Attempt::Failed;
            }
        };

        let first = timeout(
            self.config.welcome_timeout,
            receive_message::<ServerMessage>(&mut conn.ws_receiver),
        )
        .await;
        let heartbeat = match first {
            Ok(Ok(Incoming::Message(ServerMessage::Welcome {
                connection_id,
                heartbeat_interval_ms,
                ..
            }))) => {
                info!("[重连客户端] 连接已建立: connection_id={}", connection_id);
                self.status.send_replace(ConnectionStatus::Connected);
                self.emit(ClientEvent::Connected { connection_id });
                heartbeat_interval_ms
            }
            Ok(Ok(Incoming::Closed(info))) => {
                let (code, reason) = info.map(|i| (Some(i.code), i.reason)).unwrap_or((None, String::new()));
                warn!("[重连客户端] 认证阶段被关闭: code={:?} reason={}", code, reason);
                if grant_reusable_after(code) {
                    *spare_grant = Some(grant);
                }
                self.emit(ClientEvent::Disconnected { code, reason });
                return Attempt::Failed;
            }
            Ok(Ok(other)) => {
                warn!("[重连客户端] 期望 welcome，实际收到 {:?}", other);
                return Attempt::Failed;
            }
            Ok(Err(e)) => {
                warn!("[重连客户端] 等待 welcome 时出错: {}", e);
                return Attempt::Failed;
            }
            Err(_) => {
                warn!("[重连客户端] {}", ClientError::HandshakeTimeout);
                return Attempt::Failed;
            }
        };

        for message in self.ledger.replay_messages() {
            if let Err(e) = conn.send_json(&message).await {
                warn!("[重连客户端] 恢复订阅失败: {}", e);
                break;
            }
        }
        debug!("[重连客户端] 已重新发送 {} 项订阅", self.ledger.len());
        self.run_session(conn, idle_limit(heartbeat)).await
    }

    async fn run_session(&mut self, mut conn: ClientConnection, idle: Duration) -> Attempt {
        let watchdog = tokio::time::sleep(idle);
        tokio::pin!(watchdog);
        loop {
            tokio::select! {
                _ = &mut watchdog => {
                    let e = ClientError::IdleTimeout(idle);
                    warn!("[重连客户端] {}，判定连接已断开", e);
                    self.emit(ClientEvent::Disconnected { code: None, reason: e.to_string() });
                    return Attempt::SessionEnded;
                }
                command = self.commands.recv() => match command {
                    Some(Command::Subscribe(subscription)) => {
                        let message = subscribe_message(&subscription);
                        self.ledger.insert(subscription);
                        if let Err(e) = conn.send_json(&message).await {
                            debug!("[重连客户端] 发送订阅失败，等待连接断开后重放: {}", e);
                        }
                    }
                    Some(Command::Unsubscribe(key)) => {
                        self.ledger.remove(&key);
                        let message = ClientMessage::Unsubscribe {
                            topic: None,
                            filter: None,
                            room_key: Some(key.to_string()),
                            request_id: None,
                        };
                        if let Err(e) = conn.send_json(&message).await {
                            debug!("[重连客户端] 发送退订失败: {}", e);
                        }
                    }
                    Some(Command::Close) | None => {
                        self.close_gracefully(conn).await;
                        return Attempt::Stopped;
                    }
                },
                incoming = receive_message::<ServerMessage>(&mut conn.ws_receiver) => match incoming {
                    Ok(Incoming::Message(message)) => {
                        watchdog.as_mut().reset(Instant::now() + idle);
                        self.dispatch(&mut conn, message).await;
                    }
                    Ok(Incoming::Pong) => watchdog.as_mut().reset(Instant::now() + idle),
                    Ok(Incoming::Closed(info)) => {
                        let (code, reason) = info.map(|i| (Some(i.code), i.reason)).unwrap_or((None, String::new()));
                        warn!("[重连客户端] 连接已断开: code={:?} reason={}", code, reason);
                        self.emit(ClientEvent::Disconnected { code, reason });
                        return Attempt::SessionEnded;
                    }
                    Err(e) => {
                        warn!("[重连客户端] 接收失败: {}", e);
                        self.emit(ClientEvent::Disconnected { code: None, reason: e.to_string() });
                        return Attempt::SessionEnded;
                    }
                },
            }
        }
    }

    async fn dispatch(&mut self, conn: &mut ClientConnection, message: ServerMessage) {
        match message {
            ServerMessage::Event { room_key, sequence, payload } => {
                self.emit(ClientEvent::Event { room_key, sequence, payload });
            }
            ServerMessage::Ping { timestamp } => {
                let pong = ClientMessage::Pong { timestamp: Some(timestamp) };
                if let Err(e) = conn.send_json(&pong).await {
                    debug!("[重连客户端] 回复 pong 失败: {}", e);
                }
            }
            ServerMessage::Subscribed { room_key, request_id } => {
                self.emit(ClientEvent::Subscribed { room_key, request_id });
            }
            ServerMessage::Unsubscribed { room_key, request_id } => {
                self.emit(ClientEvent::Unsubscribed { room_key, request_id });
            }
            ServerMessage::Error { error, request_id } => {
                debug!("[重连客户端] 服务端返回错误: {:?}", error);
                self.emit(ClientEvent::ServerError { error, request_id });
            }
            ServerMessage::Welcome { .. } => debug!("[重连客户端] 忽略重复的 welcome"),
        }
    }

    async fn close_gracefully(&mut self, mut conn: ClientConnection) {
        let code = HubCloseCode::Normal;
        if let Err(e) = conn.send_close(code.code(), "client closing").await {
            debug!("[重连客户端] 发送关闭帧失败: {}", e);
        }
        let _ = timeout(CLOSE_GRACE, async {
            loop {
                match receive_message::<ServerMessage>(&mut conn.ws_receiver).await {
                    Ok(Incoming::Closed(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        self.emit(ClientEvent::Disconnected {
            code: Some(code.code()),
            reason: "client closing".to_string(),
        });
    }

    /// 退避等待期间继续接收订阅变更。返回 `false` 表示调用方要求关闭。
    async fn wait_backoff(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    Some(Command::Subscribe(subscription)) => {
                        self.ledger.insert(subscription);
                    }
                    Some(Command::Unsubscribe(key)) => {
                        self.ledger.remove(&key);
                    }
                    Some(Command::Close) | None => return false,
                },
            }
        }
    }

    fn emit(&self, event: ClientEvent) {
        // 调用方丢弃接收端时事件被忽略
        let _ = self.events.send(event);
    }
}

/// 连接在多长时间内没有任何消息就视为已断开。服务端每个心跳周期至少发送一次 `ping`。
fn idle_limit(heartbeat_interval_ms: u64) -> Duration {
    let interval = match heartbeat_interval_ms {
        0 => FALLBACK_HEARTBEAT,
        ms => Duration::from_millis(ms),
    };
    interval.saturating_mul(MISSED_HEARTBEATS)
}

/// 认证阶段被关闭后令牌能否再次使用。
/// 限流与容量拒绝发生在 nonce 被消耗之前，其余情况都换新令牌。
fn grant_reusable_after(code: Option<u16>) -> bool {
    matches!(
        code.and_then(HubCloseCode::from_code),
        Some(HubCloseCode::RateLimited | HubCloseCode::ServerAtCapacity)
    )
}

fn handshake_url(base: &str, grant: &TokenGrant) -> Result<String, ClientError> {
    let mut url = Url::parse(base).map_err(|e| ClientError::InvalidUrl(format!("{}: {}", base, e)))?;
    {
        let mut query = url.query_pairs_mut();
        for (name, value) in grant.query_pairs() {
            query.append_pair(name, &value);
        }
    }
    Ok(url.to_string())
}
