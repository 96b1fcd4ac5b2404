//! WebSocket hub and session channel endpoint.

pub mod handler;
pub mod hub;
pub mod types;

pub use hub::WsHub;
pub use types::{SessionMessage, consolidate_partials};
