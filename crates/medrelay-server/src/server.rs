//! Core server: accepts WebSocket connections and runs one task per client.
//!
//! Owns the signaling hub and the liveness monitor, and coordinates the
//! shutdown sequence.

use crate::config::ServerConfig;
use crate::relay::{LivenessMonitor, Outbound, SignalingHub};
use crate::transport::websocket::{self, Inbound, Listener, WebSocketConnection};
use futures_util::StreamExt;
use medrelay_core::{encode, RelayResult, ServerMessage};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// The signaling relay server.
pub struct SignalServer {
    config: ServerConfig,
    hub: Arc<SignalingHub>,
}

impl SignalServer {
    pub fn new(config: ServerConfig) -> Self {
        let hub = Arc::new(SignalingHub::new(
            config.max_connections,
            config.outbound_buffer,
        ));
        Self { config, hub }
    }

    #[cfg(test)]
    pub fn hub(&self) -> Arc<SignalingHub> {
        self.hub.clone()
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> RelayResult<()>
    where
        F: Future<Output = ()>,
    {
        let listener =
            websocket::start_listener(self.config.listen_addr(), self.config.max_frame_size)
                .await?;
        self.serve(listener, shutdown).await
    }

    /// Serve an already-bound listener until `shutdown` resolves.
    pub async fn serve<F>(self, mut listener: Listener, shutdown: F) -> RelayResult<()>
    where
        F: Future<Output = ()>,
    {
        let monitor = LivenessMonitor::new(
            self.hub.clone(),
            self.config.liveness_interval,
            self.config.liveness_timeout,
        )
        .spawn();

        info!(
            addr = %listener.local_addr,
            heartbeat_secs = self.config.liveness_interval.as_secs(),
            max_connections = self.config.max_connections,
            "medrelay-server ready"
        );

        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                Some(conn) = listener.incoming.recv() => {
                    let hub = self.hub.clone();
                    tasks.spawn(handle_connection(hub, conn));
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "connection task failed");
                    }
                }
                else => {
                    info!("listener closed, shutting down");
                    break;
                }
            }
        }

        monitor.abort();
        drop(listener);

        let notified = self.hub.begin_shutdown().await;
        info!(notified, "notified clients of shutdown");

        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = tasks.len(), "shutdown grace elapsed, aborting connections");
            tasks.abort_all();
        }

        info!("medrelay-server stopped");
        Ok(())
    }
}

/// Per-connection loop: drain the outbound queue into the socket and feed
/// inbound frames to the hub. Always ends in the disconnect path.
async fn handle_connection(hub: Arc<SignalingHub>, conn: WebSocketConnection) {
    let remote = conn.remote_addr;
    let (mut sink, mut stream) = conn.ws_stream.split();

    let (id, mut outbound) = match hub.connect().await {
        Ok(registered) => registered,
        Err(e) => {
            warn!(remote = %remote, error = %e, "rejecting connection");
            if let Ok(text) = encode(&ServerMessage::error(e.to_string())) {
                let _ = websocket::ws_send_text(&mut sink, text).await;
            }
            websocket::ws_close(&mut sink).await;
            return;
        }
    };
    debug!(conn_id = %id, remote = %remote, "session started");

    loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(Outbound::Message(msg)) => {
                    let sent = match encode(&msg) {
                        Ok(text) => websocket::ws_send_text(&mut sink, text).await,
                        Err(e) => {
                            warn!(conn_id = %id, error = %e, "failed to encode message");
                            continue;
                        }
                    };
                    if let Err(e) = sent {
                        debug!(conn_id = %id, error = %e, "send failed");
                        break;
                    }
                }
                Some(Outbound::Ping) => {
                    if let Err(e) = websocket::ws_send_ping(&mut sink).await {
                        debug!(conn_id = %id, error = %e, "probe failed");
                        break;
                    }
                }
                Some(Outbound::Close) => {
                    websocket::ws_close(&mut sink).await;
                    break;
                }
                Some(Outbound::Terminate) | None => break,
            },

            inbound = websocket::ws_recv(&mut stream) => match inbound {
                Ok(Some(Inbound::Text(text))) => hub.handle_frame(&id, &text).await,
                Ok(Some(Inbound::Pong)) => hub.touch(&id).await,
                Ok(None) => {
                    debug!(conn_id = %id, "peer closed");
                    break;
                }
                Err(e) => {
                    debug!(conn_id = %id, error = %e, "session ended");
                    break;
                }
            },
        }
    }

    hub.disconnect(&id).await;
}
