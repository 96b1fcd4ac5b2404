//! Event envelope, routing, persistence, and compaction.

pub mod compactor;
pub mod envelope;
pub mod router;
pub mod store;

pub use compactor::{Compactor, Message, Role, ToolCall, ToolCallStatus, compact, compact_run};
pub use envelope::{Event, EventType, RunRecord, RunStatus};
pub use router::{EventRouter, RunState, SUBSCRIBER_BUFFER, SubscriberId};
pub use store::{EventStore, LEGACY_MIGRATION_RUN_ID};
