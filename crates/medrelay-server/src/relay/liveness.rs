//! Liveness monitor: periodic ping, reap whatever stopped answering.
//!
//! Each connection's `last_seen` is refreshed by pongs and inbound frames.
//! A tick reaps connections idle for longer than the timeout and pings the
//! rest, so a vanished peer is gone within two tick periods.

use super::hub::SignalingHub;
use super::registry::{Outbound, Registries};
use medrelay_core::ConnectionId;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Outcome of one sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub reaped: Vec<ConnectionId>,
    pub probed: usize,
}

/// Reap stale connections through the normal disconnect path, then probe
/// every survivor.
pub fn sweep(reg: &mut Registries, now: Instant, timeout: Duration) -> SweepReport {
    let mut report = SweepReport::default();

    for id in reg.stale_connections(now, timeout) {
        // Queue the terminate before the record (and its sender) goes away.
        reg.push(&id, Outbound::Terminate);
        if reg.remove_connection(&id).is_some() {
            info!(conn_id = %id, "reaped unresponsive connection");
            report.reaped.push(id);
        }
    }

    let ids: Vec<ConnectionId> = reg.connections().map(|e| e.id.clone()).collect();
    for id in &ids {
        if reg.push(id, Outbound::Ping) {
            report.probed += 1;
        }
    }

    report
}

pub struct LivenessMonitor {
    hub: Arc<SignalingHub>,
    interval: Duration,
    timeout: Duration,
}

impl LivenessMonitor {
    pub fn new(hub: Arc<SignalingHub>, interval: Duration, timeout: Duration) -> Self {
        Self {
            hub,
            interval,
            timeout,
        }
    }

    /// Run on a fixed period until the handle is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + self.interval;
            let mut ticker = tokio::time::interval_at(start, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let report = self.hub.sweep(Instant::now(), self.timeout).await;
                if !report.reaped.is_empty() {
                    info!(reaped = report.reaped.len(), "liveness sweep reaped connections");
                }
                let stats = self.hub.stats().await;
                debug!(
                    probed = report.probed,
                    connections = stats.total_connections,
                    rooms = stats.active_rooms,
                    "liveness tick"
                );
            }
        })
    }
}
