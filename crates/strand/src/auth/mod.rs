//! Authentication, per-request client minting, authorization reviews, and
//! credential redaction.

pub mod authz;
pub mod clients;
pub mod middleware;
pub mod redact;

pub use authz::{can_i, can_i_grouped, require, require_session_access};
pub use clients::{KubeClients, service_account_from_token};
pub use middleware::{Identity, ProjectScope, token_from_parts};
pub use redact::{redact, redact_url};
