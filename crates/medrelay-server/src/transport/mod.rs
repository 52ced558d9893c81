//! Transport layer. Clients reach the relay over WebSocket only.

pub mod websocket;
