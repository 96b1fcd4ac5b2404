//! Content gateway: delegated workspace I/O through the per-project
//! content service.

pub mod client;
pub mod handlers;
pub mod paths;

pub use client::ContentClient;
pub use paths::{resolve_workspace_path, session_workspace_base};
