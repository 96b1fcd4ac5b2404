//! Read-side streaming: SSE, history, runs, export.

pub mod handlers;
pub mod snapshot;
pub mod sse;

pub use sse::{RunClassification, classify_runs};
