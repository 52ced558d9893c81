//! Signaling hub: the shared context every connection task talks to.
//!
//! Owns the registries behind a single async mutex. Each public operation
//! takes the lock once, so join/leave/reap/broadcast never interleave.

use super::liveness::{self, SweepReport};
use super::registry::{Outbound, Registries, RelayStats};
use super::router;
use medrelay_core::{decode_client, ConnectionId, ProtocolError, ServerMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

pub struct SignalingHub {
    state: Mutex<Registries>,
    /// Set once shutdown notification begins; freezes all state.
    closing: AtomicBool,
    max_connections: usize,
    outbound_buffer: usize,
}

impl SignalingHub {
    pub fn new(max_connections: usize, outbound_buffer: usize) -> Self {
        Self {
            state: Mutex::new(Registries::new()),
            closing: AtomicBool::new(false),
            max_connections,
            outbound_buffer,
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Register a new connection and queue its `welcome`.
    ///
    /// Returns the id and the outbound queue the socket task must drain.
    pub async fn connect(&self) -> Result<(ConnectionId, mpsc::Receiver<Outbound>), ProtocolError> {
        if self.is_closing() {
            return Err(ProtocolError::ServerClosing);
        }
        let mut reg = self.state.lock().await;
        if reg.connection_count() >= self.max_connections {
            return Err(ProtocolError::ConnectionLimit);
        }

        let id = ConnectionId::generate();
        let (tx, rx) = mpsc::channel(self.outbound_buffer);
        reg.insert_connection(id.clone(), tx, Instant::now());
        reg.send(&id, ServerMessage::welcome(id.as_str()));

        info!(conn_id = %id, connections = reg.connection_count(), "client connected");
        Ok((id, rx))
    }

    /// Leave any room and forget the connection. Safe to call repeatedly,
    /// and a no-op once shutdown has begun.
    pub async fn disconnect(&self, id: &ConnectionId) {
        if self.is_closing() {
            return;
        }
        let mut reg = self.state.lock().await;
        if let Some(entry) = reg.remove_connection(id) {
            let connected_secs = (chrono::Utc::now() - entry.connected_at).num_seconds();
            info!(conn_id = %id, connected_secs, "client disconnected");
        }
    }

    /// Record liveness activity (pong or inbound frame).
    pub async fn touch(&self, id: &ConnectionId) {
        self.state.lock().await.touch(id, Instant::now());
    }

    /// Decode and route one inbound text frame.
    pub async fn handle_frame(&self, id: &ConnectionId, text: &str) {
        if self.is_closing() {
            return;
        }
        let decoded = decode_client(text);

        let mut reg = self.state.lock().await;
        if !reg.contains(id) {
            // Reaped while this frame was in flight.
            return;
        }
        reg.touch(id, Instant::now());

        let result = decoded.and_then(|msg| router::dispatch(&mut reg, id, msg));
        if let Err(e) = result {
            debug!(conn_id = %id, error = %e, "protocol error");
            reg.send(id, ServerMessage::error(e.to_string()));
        }
    }

    /// One liveness tick: reap stale connections, probe the rest.
    pub async fn sweep(&self, now: Instant, timeout: Duration) -> SweepReport {
        if self.is_closing() {
            return SweepReport::default();
        }
        let mut reg = self.state.lock().await;
        liveness::sweep(&mut reg, now, timeout)
    }

    /// Freeze state and tell every live connection the server is going away.
    ///
    /// Returns the number of connections notified.
    pub async fn begin_shutdown(&self) -> usize {
        self.closing.store(true, Ordering::SeqCst);
        let reg = self.state.lock().await;
        let notice = ServerMessage::server_closing();
        let ids: Vec<ConnectionId> = reg.connections().map(|e| e.id.clone()).collect();
        for id in &ids {
            reg.send(id, notice.clone());
            reg.push(id, Outbound::Close);
        }
        ids.len()
    }

    pub async fn stats(&self) -> RelayStats {
        self.state.lock().await.stats()
    }
}
