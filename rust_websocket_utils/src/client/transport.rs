// rust_websocket_utils/src/client/transport.rs

//! 客户端 WebSocket 传输层核心逻辑。
//!
//! 提供建立与服务器的连接、发送 JSON 消息、逐条接收并解析消息的函数。

use crate::error::WsError;
use crate::message::{CloseInfo, close_message, decode_text, encode_text};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use log::{debug, info, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_tungstenite::{
    WebSocketStream, connect_async,
    tungstenite::Error as TungsteniteError,
    tungstenite::protocol::Message,
};
use url::Url;

/// `ClientWsStream` 类型别名，代表一个可能经过 TLS 加密的 TCP WebSocket 流。
pub type ClientWsStream = WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// `ClientConnection` 结构体代表一个活动的客户端 WebSocket 连接。
pub struct ClientConnection {
    pub ws_sender: SplitSink<ClientWsStream, Message>,
    pub ws_receiver: SplitStream<ClientWsStream>,
}

impl ClientConnection {
    /// 将消息序列化为 JSON 并以文本帧发送。
    pub async fn send_json<T: Serialize>(&mut self, message: &T) -> Result<(), WsError> {
        let frame = encode_text(message)?;
        self.ws_sender.send(frame).await?;
        Ok(())
    }

    /// 发送关闭帧。对端通常会回应关闭帧，调用方可继续读取直到收到 `Incoming::Closed`。
    pub async fn send_close(&mut self, code: u16, reason: &str) -> Result<(), WsError> {
        self.ws_sender.send(close_message(code, reason)).await?;
        Ok(())
    }
}

/// 异步连接到指定的 WebSocket 服务器。
pub async fn connect_client(url_str: &str) -> Result<ClientConnection, WsError> {
    let parsed_url = Url::parse(url_str)
        .map_err(|e| WsError::InvalidUrl(format!("无效的 WebSocket URL '{}': {}", url_str, e)))?;

    let (ws_stream, response) = connect_async(parsed_url.as_str()).await?;
    info!("客户端：已成功连接到 {} (HTTP 状态码: {})", parsed_url.host_str().unwrap_or("?"), response.status());
    let (ws_sender, ws_receiver) = ws_stream.split();
    Ok(ClientConnection { ws_sender, ws_receiver })
}

/// 一次接收的结果。
#[derive(Debug)]
pub enum Incoming<T> {
    Message(T),
    /// 收到了对端的 WebSocket Pong 控制帧。
    Pong,
    /// 连接已关闭。对端发送了关闭帧时携带其关闭码与原因。
    Closed(Option<CloseInfo>),
}

/// 从接收流中异步接收下一条业务消息。
///
/// Ping 帧由底层库自动应答，此处跳过。文本帧被解析为 `T`；
/// 二进制帧视为错误；关闭帧及流结束都返回 `Incoming::Closed`。
pub async fn receive_message<T: DeserializeOwned>(
    ws_receiver: &mut SplitStream<ClientWsStream>,
) -> Result<Incoming<T>, WsError> {
    loop {
        let msg = match ws_receiver.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(TungsteniteError::ConnectionClosed | TungsteniteError::AlreadyClosed)) | None => {
                debug!("客户端：WebSocket 接收流已结束。");
                return Ok(Incoming::Closed(None));
            }
            Some(Err(e)) => return Err(WsError::WebSocketProtocolError(e)),
        };
        match msg {
            Message::Text(text) => return decode_text(&text).map(Incoming::Message),
            Message::Binary(bin) => {
                warn!("客户端：收到非预期的二进制消息，长度 {} 字节", bin.len());
                return Err(WsError::UnexpectedFrame("binary"));
            }
            Message::Pong(_) => return Ok(Incoming::Pong),
            Message::Close(frame) => {
                debug!("客户端：收到 Close 控制帧: {:?}", frame);
                return Ok(Incoming::Closed(frame.as_ref().map(CloseInfo::from_frame)));
            }
            Message::Ping(_) | Message::Frame(_) => continue,
        }
    }
}
