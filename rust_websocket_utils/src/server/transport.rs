// rust_websocket_utils/src/server/transport.rs

//! 包含服务端 WebSocket 监听、接受连接和握手逻辑。

use crate::error::WsError;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::{WebSocketStream, accept_hdr_async};

/// `WsStream` 是一个类型别名，代表经过 WebSocket 握手后的 TCP 流。
pub type WsStream = WebSocketStream<TcpStream>;

/// TCP 建立后完成升级握手的默认时限。
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// 握手阶段从 HTTP 升级请求中捕获的信息。
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    pub peer_addr: SocketAddr,
    pub path: String,
    /// 已做 URL 解码的查询参数。同名参数只保留第一个。
    pub query: HashMap<String, String>,
}

impl HandshakeRequest {
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }
}

/// 解析查询字符串 (不含 `?`)。
pub fn parse_query(raw: Option<&str>) -> HashMap<String, String> {
    let mut out = HashMap::new();
    if let Some(raw) = raw {
        for (k, v) in url::form_urlencoded::parse(raw.as_bytes()) {
            out.entry(k.into_owned()).or_insert_with(|| v.into_owned());
        }
    }
    out
}

/// `ServerTransport` 结构体负责处理 WebSocket 服务端的监听和连接接受。
pub struct ServerTransport;

impl ServerTransport {
    /// 绑定地址并持续接受连接，直到进程结束。
    pub async fn start<F, Fut>(addr: SocketAddr, path: Option<String>, on_connect: F) -> Result<(), WsError>
    where
        F: Fn(WsStream, HandshakeRequest) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(&addr).await.map_err(WsError::TcpBindError)?;
        Self::serve(listener, path, DEFAULT_HANDSHAKE_TIMEOUT, on_connect, std::future::pending()).await
    }

    /// 在已绑定的监听器上接受连接。
    ///
    /// 每个 TCP 连接都在独立的 Tokio 任务中完成 WebSocket 握手，握手成功后调用 `on_connect`。
    /// 如果给出了 `path`，请求路径不一致的升级请求会被以 HTTP 404 拒绝。
    /// 未能在 `handshake_timeout` 内完成握手的 TCP 连接会被直接丢弃。
    /// `shutdown` 完成后停止接受新连接并返回，已建立的连接不受影响。
    pub async fn serve<F, Fut, S>(
        listener: TcpListener,
        path: Option<String>,
        handshake_timeout: Duration,
        on_connect: F,
        shutdown: S,
    ) -> Result<(), WsError>
    where
        F: Fn(WsStream, HandshakeRequest) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        S: Future<Output = ()> + Send,
    {
        let local = listener.local_addr().map_err(WsError::IoError)?;
        info!("[WsTransport] WebSocket 服务器正在监听地址: {} (路径: {:?})", local, path);

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("[WsTransport] 收到关闭信号，停止接受新连接。");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((tcp_stream, peer_addr)) => {
                        debug!("[WsTransport] 从 {} 接受了新的 TCP 连接", peer_addr);
                        let on_connect_callback = on_connect.clone();
                        let expected_path = path.clone();
                        tokio::spawn(async move {
                            let upgrade = handshake(tcp_stream, peer_addr, expected_path.as_deref());
                            match timeout(handshake_timeout, upgrade).await {
                                Ok(Ok((ws_stream, request))) => on_connect_callback(ws_stream, request).await,
                                Ok(Err(e)) => warn!("[WsTransport] 与 {} 的 WebSocket 握手失败: {}", peer_addr, e),
                                Err(_) => warn!(
                                    "[WsTransport] 与 {} 的 WebSocket 握手超时 ({:?})，已断开",
                                    peer_addr, handshake_timeout
                                ),
                            }
                        });
                    }
                    Err(e) => {
                        // 通常是文件描述符耗尽等暂时性错误，记录后继续监听
                        error!("[WsTransport] 接受 TCP 连接失败: {}。服务器将继续运行。", e);
                    }
                }
            }
        }
    }
}

async fn handshake(
    tcp_stream: TcpStream,
    peer_addr: SocketAddr,
    expected_path: Option<&str>,
) -> Result<(WsStream, HandshakeRequest), WsError> {
    let mut captured: Option<(String, Option<String>)> = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        let uri = req.uri();
        captured = Some((uri.path().to_string(), uri.query().map(str::to_string)));
        match expected_path {
            Some(expected) if uri.path() != expected => {
                let mut rejection = ErrorResponse::new(Some("not found".to_string()));
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                Err(rejection)
            }
            _ => Ok(resp),
        }
    };
    let ws_stream = accept_hdr_async(tcp_stream, callback).await?;
    let (path, raw_query) = captured.unwrap_or_default();
    debug!("[WsTransport] 与 {} 的 WebSocket 握手成功，路径: {}", peer_addr, path);
    Ok((
        ws_stream,
        HandshakeRequest {
            peer_addr,
            path,
            query: parse_query(raw_query.as_deref()),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_decodes_and_keeps_first() {
        let q = parse_query(Some("token=a%2Bb&nonce=n1&nonce=n2&expires=17"));
        assert_eq!(q.get("token").map(String::as_str), Some("a+b"), "百分号编码应被解码");
        assert_eq!(q.get("nonce").map(String::as_str), Some("n1"), "同名参数应保留第一个");
        assert_eq!(q.get("expires").map(String::as_str), Some("17"));
        assert!(parse_query(None).is_empty());
    }
}
