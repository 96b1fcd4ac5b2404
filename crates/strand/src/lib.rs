//! strand — a multi-tenant control plane for agentic sessions on
//! Kubernetes.
//!
//! Sessions are declarative custom resources reconciled into runner pods
//! by an external operator. This crate is the HTTP layer between those
//! runners and human observers: request-scoped Kubernetes identity,
//! per-session credential provisioning, an append-only event log with
//! read-time compaction, SSE/WebSocket fan-out, and a background proxy
//! that consumes runner streams long after the request that started them
//! has returned.

pub mod api;
pub mod auth;
pub mod content;
pub mod crd;
pub mod events;
pub mod gitauth;
pub mod nested;
pub mod runner;
pub mod session;
pub mod settings;
pub mod stream;
pub mod workflow;
pub mod ws;

pub use api::{ApiError, ApiResult, AppState, create_router};
pub use settings::ServerConfig;
