//! WebSocket 服务端核心服务：监听、握手认证与每个连接的读写任务。
//!
//! 每个连接由两个任务组成：
//! - 写任务：独占发送端，按顺序取出出站队列中的消息写入套接字，遇到关闭帧后结束；
//! - 读任务 (即连接处理任务本身)：认证、读取客户端消息并交给消息路由。
//!
//! 房间锁内只做非阻塞入队，网络写入全部发生在写任务中。

use crate::error::AppError;
use crate::state::HubState;
use crate::ws_server::authenticator::HandshakeParams;
use crate::ws_server::client_session::ClientSession;
use crate::ws_server::message_router;
use crate::ws_server::outbound_queue::Outbound;
use anyhow::{Context, Result};
use chrono::Utc;
use common_models::enums::HubCloseCode;
use common_models::ws_payloads::ServerMessage;
use futures_util::stream::SplitStream;
use futures_util::{Sink, SinkExt, StreamExt};
use log::{debug, error, info, warn};
use rust_websocket_utils::message::{close_message, encode_text, Message};
use rust_websocket_utils::server::transport::{HandshakeRequest, ServerTransport, WsStream};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

/// 发出关闭帧后等待对端回应关闭帧的时间
const CLOSE_GRACE: Duration = Duration::from_secs(2);
/// 读循环结束后等待写任务退出的时间，超时后强制终止写任务
const WRITER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
/// 关停时等待现有连接清理完毕的时间
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// WebSocket 服务结构体，持有全局共享状态。
pub struct WsService {
    state: Arc<HubState>,
}

impl WsService {
    pub fn new(state: Arc<HubState>) -> Self {
        info!("[WsService] 新实例已创建。");
        Self { state }
    }

    /// 按配置绑定地址并运行，直到 `shutdown` 变为 `true`。
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let ws = &self.state.config.websocket;
        let listen_addr = format!("{}:{}", ws.host, ws.port);
        info!("[WsService] 正在启动 WebSocket 服务: {} (路径 {})", listen_addr, ws.path);
        let listener = TcpListener::bind(&listen_addr)
            .await
            .with_context(|| format!("绑定 WebSocket 监听地址 {} 失败", listen_addr))?;
        self.serve(listener, shutdown)
            .await
            .context("WebSocket 服务运行失败")
    }

    /// 在已绑定的监听器上运行。关闭信号到来后停止接受新连接，以 1001 关闭所有现有连接。
    pub async fn serve(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<(), AppError> {
        let state = Arc::clone(&self.state);
        let handshake_timeout = Duration::from_millis(self.state.config.websocket.handshake_timeout_ms);
        let on_connect = move |ws: WsStream, request: HandshakeRequest| {
            let state = Arc::clone(&state);
            async move { handle_connection(state, ws, request).await }
        };
        let stop = async move { wait_for_shutdown(&mut shutdown).await };

        let result = ServerTransport::serve(
            listener,
            Some(self.state.config.websocket.path.clone()),
            handshake_timeout,
            on_connect,
            stop,
        )
        .await;

        let closing = self.state.connections.close_all(HubCloseCode::GoingAway);
        info!("[WsService] 监听循环已退出，正在等待 {} 个连接完成关闭...", closing);
        let drained = timeout(SHUTDOWN_DRAIN_TIMEOUT, async {
            while !self.state.connections.is_empty() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                "[WsService] 关停等待超时，仍有 {} 个连接未清理完毕",
                self.state.connections.len()
            );
        }
        result.map_err(AppError::from)
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// 处理一个已完成 WebSocket 握手的连接，直到它彻底关闭。
async fn handle_connection(state: Arc<HubState>, mut ws: WsStream, request: HandshakeRequest) {
    let peer = request.peer_addr;

    if let Err(e) = state.rate_limiter.check_connect_ip(peer.ip()) {
        warn!("[WsService] 来自 {} 的连接过于频繁: {}", peer, e);
        state.stats.record_rejected(HubCloseCode::RateLimited);
        close_unregistered(&mut ws, HubCloseCode::RateLimited, format!("retry_after={}", e.retry_after_secs())).await;
        return;
    }

    let session = match state.connections.register(peer) {
        Ok(session) => session,
        Err(e) => {
            warn!("[WsService] 无法接纳来自 {} 的连接: {}", peer, e);
            close_unregistered(
                &mut ws,
                HubCloseCode::ServerAtCapacity,
                HubCloseCode::ServerAtCapacity.default_reason().to_string(),
            )
            .await;
            return;
        }
    };
    info!("[WsService] 新客户端连接: SessionID={}, Addr={}", session.connection_id, peer);

    let write_timeout = Duration::from_millis(state.config.websocket.write_timeout_ms);
    let (sink, mut stream) = ws.split();
    let writer = tokio::spawn(write_loop(Arc::clone(&session), sink, write_timeout));

    if authenticate(&state, &session, &request) {
        let mut shutdown = session.subscribe_shutdown();
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => {
                debug!("[WsService] SessionID {}: 收到关闭信号，读循环结束", session.connection_id);
            }
            _ = read_loop(&state, &session, &mut stream) => {}
        }
    }

    // 读循环因对端断开或传输错误结束时，在这里补发关闭
    state
        .connections
        .close(&session, HubCloseCode::Normal, HubCloseCode::Normal.default_reason());

    // 等待对端回应关闭帧，完成关闭握手
    let _ = timeout(CLOSE_GRACE, async {
        while let Some(Ok(frame)) = stream.next().await {
            if frame.is_close() {
                break;
            }
        }
    })
    .await;

    join_writer(session.connection_id, writer, WRITER_JOIN_TIMEOUT).await;

    state.connections.finalize(&session);
    info!(
        "[WsService] SessionID {} (Addr: {}) 的连接处理已全部结束",
        session.connection_id, peer
    );
}

/// 握手认证。成功时连接进入 ACTIVE 并收到 `welcome`；失败时连接进入 REJECTED，关闭帧已排队。
fn authenticate(state: &HubState, session: &ClientSession, request: &HandshakeRequest) -> bool {
    if state.connections.begin_auth(session).is_err() {
        return false;
    }
    let now = Utc::now().timestamp();
    let verified = HandshakeParams::from_query(&request.query).and_then(|params| state.authenticator.verify(&params, now));
    let claims = match verified {
        Ok(claims) => claims,
        Err(e) => {
            warn!("[WsService] SessionID {}: 令牌校验失败: {}", session.connection_id, e);
            state.connections.reject(session, e.close_code(), e.label());
            return false;
        }
    };

    if let Some(user) = claims.sub.as_deref() {
        if let Err(e) = state.rate_limiter.check_connect_user(user) {
            warn!("[WsService] 用户 {} 连接过于频繁: {}", user, e);
            state
                .connections
                .reject(session, HubCloseCode::RateLimited, format!("retry_after={}", e.retry_after_secs()));
            return false;
        }
    }

    if let Err(e) = state.authenticator.commit(&claims, now) {
        state.connections.reject(session, e.close_code(), e.label());
        return false;
    }

    let user_id = claims.sub.clone();
    if let Err(e) = state.connections.activate(session, claims) {
        warn!("[WsService] SessionID {}: 无法激活连接: {}", session.connection_id, e);
        return false;
    }
    session.send(ServerMessage::Welcome {
        connection_id: session.connection_id.to_string(),
        heartbeat_interval_ms: state.config.heartbeat.interval_ms,
        user_id,
    });
    true
}

async fn read_loop(state: &HubState, session: &ClientSession, stream: &mut SplitStream<WsStream>) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => message_router::handle_text(state, session, &text).await,
            Ok(Message::Binary(_)) => message_router::handle_binary(state, session),
            Ok(Message::Pong(_)) => session.touch_pong().await,
            Ok(Message::Close(frame)) => {
                info!(
                    "[WsService] SessionID {}: 客户端主动关闭连接: {:?}",
                    session.connection_id, frame
                );
                state
                    .connections
                    .close(session, HubCloseCode::Normal, HubCloseCode::Normal.default_reason());
                return;
            }
            // Ping 由底层库自动回应
            Ok(Message::Ping(_)) | Ok(Message::Frame(_)) => {}
            Err(e) => {
                debug!("[WsService] SessionID {}: 读取失败，连接可能已断开: {}", session.connection_id, e);
                return;
            }
        }
    }
    debug!("[WsService] SessionID {}: 对端已断开 (接收流结束)", session.connection_id);
}

/// 等待写任务退出；超过 `limit` 仍未退出时终止它，使其持有的发送端随之释放。
/// 返回写任务是否自行结束。
async fn join_writer(connection_id: Uuid, mut writer: JoinHandle<()>, limit: Duration) -> bool {
    match timeout(limit, &mut writer).await {
        Ok(Ok(())) => {
            debug!("[WsService] SessionID {}: 写任务已结束", connection_id);
            true
        }
        Ok(Err(e)) => {
            error!("[WsService] SessionID {}: 写任务异常退出: {:?}", connection_id, e);
            true
        }
        Err(_) => {
            warn!("[WsService] SessionID {}: 等待写任务退出超时，强制终止", connection_id);
            writer.abort();
            false
        }
    }
}

/// 写任务：依次发送出站队列中的消息，发送关闭帧后、写入失败或单帧写入超过 `write_timeout` 时结束。
async fn write_loop<S>(session: Arc<ClientSession>, mut sink: S, write_timeout: Duration)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    while let Some(item) = session.outbound().pop().await {
        match item {
            Outbound::Message(msg) => {
                let frame = match encode_text(&msg) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!("[SenderTask {}] 消息编码失败: {}", session.connection_id, e);
                        continue;
                    }
                };
                match timeout(write_timeout, sink.send(frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!("[SenderTask {}] 发送失败，连接可能已断开: {}", session.connection_id, e);
                        session.signal_shutdown();
                        break;
                    }
                    Err(_) => {
                        warn!(
                            "[SenderTask {}] 写入超过 {:?} 未完成，对端可能已停止读取",
                            session.connection_id, write_timeout
                        );
                        session.signal_shutdown();
                        break;
                    }
                }
            }
            Outbound::Close { code, reason } => {
                debug!("[SenderTask {}] 发送关闭帧 {} ({})", session.connection_id, code, reason);
                match timeout(write_timeout, sink.send(close_message(code, reason))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("[SenderTask {}] 关闭帧发送失败: {}", session.connection_id, e),
                    Err(_) => debug!("[SenderTask {}] 关闭帧写入超时", session.connection_id),
                }
                break;
            }
        }
    }
    session.outbound().close();
}

/// 尚未注册的连接 (限流或容量已满) 直接发送关闭帧，并等待对端回应。
async fn close_unregistered(ws: &mut WsStream, code: HubCloseCode, reason: String) {
    match timeout(CLOSE_GRACE, ws.send(close_message(code.code(), reason))).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            debug!("[WsService] 发送关闭帧失败: {}", e);
            return;
        }
        Err(_) => {
            debug!("[WsService] 发送关闭帧超时");
            return;
        }
    }
    let _ = timeout(CLOSE_GRACE, async {
        while let Some(Ok(frame)) = ws.next().await {
            if frame.is_close() {
                break;
            }
        }
    })
    .await;
}
