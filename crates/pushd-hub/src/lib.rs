//! Pusher-protocol hub: per-app channel fan-out over WebSockets.

pub mod apps;
pub mod hub;
pub mod runtime;
pub mod server;
