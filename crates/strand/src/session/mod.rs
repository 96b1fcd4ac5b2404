//! Session lifecycle: CR operations, credential provisioning, and the
//! domain rules applied at creation time.

pub mod credentials;
pub mod handlers;
pub mod types;

pub use types::{
    CreateSessionRequest, LlmSettings, Phase, SessionSummary, derive_display_name,
    validate_session_name,
};
