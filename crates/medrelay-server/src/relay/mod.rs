//! Consultation signaling relay: registries, router, liveness.

pub mod hub;
pub mod liveness;
pub mod registry;
pub mod router;

pub use hub::SignalingHub;
pub use liveness::LivenessMonitor;
pub use registry::Outbound;
