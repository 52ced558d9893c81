//! WebSocket listener using tokio-tungstenite.
//!
//! Accepts TCP connections, completes the WebSocket handshake with the
//! configured frame-size limits, and hands finished connections to the
//! server over a channel.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use medrelay_core::{RelayError, RelayResult};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

pub type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
pub type WsStream = SplitStream<WebSocketStream<TcpStream>>;

/// Upper bound on a single outbound write to a stalled peer.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

/// A bound listener. Dropping it stops accepting.
pub struct Listener {
    pub local_addr: SocketAddr,
    pub incoming: mpsc::Receiver<WebSocketConnection>,
    accept_task: JoinHandle<()>,
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Start the WebSocket listener.
pub async fn start_listener(bind_addr: SocketAddr, max_frame_size: usize) -> RelayResult<Listener> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| RelayError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    let accept_task = tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async_with_config(stream, Some(ws_config(max_frame_size))).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    debug!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok(Listener {
        local_addr,
        incoming: rx,
        accept_task,
    })
}

fn ws_config(max_frame_size: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_frame_size);
    config.max_frame_size = Some(max_frame_size);
    config
}

/// Send a JSON text frame.
pub async fn ws_send_text(sink: &mut WsSink, text: String) -> RelayResult<()> {
    ws_send(sink, Message::Text(text)).await
}

/// Send a liveness probe.
pub async fn ws_send_ping(sink: &mut WsSink) -> RelayResult<()> {
    ws_send(sink, Message::Ping(Vec::new())).await
}

/// Send a close frame; errors are irrelevant at this point.
pub async fn ws_close(sink: &mut WsSink) {
    let _ = ws_send(sink, Message::Close(None)).await;
}

async fn ws_send(sink: &mut WsSink, msg: Message) -> RelayResult<()> {
    match tokio::time::timeout(SEND_TIMEOUT, sink.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(RelayError::Transport(format!("WS send failed: {e}"))),
        Err(_) => Err(RelayError::Timeout),
    }
}

/// What the connection task cares about from the inbound side.
#[derive(Debug, PartialEq)]
pub enum Inbound {
    Text(String),
    Pong,
}

/// Receive the next meaningful inbound event.
///
/// Returns `None` once the peer has closed. Binary frames are accepted when
/// they hold UTF-8 text; other binary payloads come back as an empty text
/// frame so the codec reports them as malformed.
pub async fn ws_recv(stream: &mut WsStream) -> RelayResult<Option<Inbound>> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => return Ok(Some(Inbound::Text(text))),
            Some(Ok(Message::Binary(data))) => {
                let text = String::from_utf8(data).unwrap_or_default();
                return Ok(Some(Inbound::Text(text)));
            }
            Some(Ok(Message::Pong(_))) => return Ok(Some(Inbound::Pong)),
            Some(Ok(Message::Close(_))) => return Ok(None),
            // Pings are answered by tungstenite itself.
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(RelayError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        }
    }
}
