//! Event envelope shared by the router, store, and streaming layers.
//!
//! Runner events are self-describing JSON maps. The set of types is open:
//! the envelope recognizes the types that drive routing and compaction and
//! passes everything else through untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::nested::{get_str, set_nested};

/// Recognized event types. Unknown types are persisted and broadcast but
/// ignored by the compactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    TextMessageStart,
    TextMessageContent,
    TextMessageEnd,
    ToolCallStart,
    ToolCallArgs,
    ToolCallEnd,
    RunStarted,
    RunFinished,
    RunError,
    StepStarted,
    StepFinished,
    StateSnapshot,
    StateDelta,
    MessagesSnapshot,
    ActivitySnapshot,
    ActivityDelta,
    Raw,
    Unknown,
}

impl EventType {
    /// Decode a type string once; dispatch afterwards is on the enum.
    pub fn parse(s: &str) -> Self {
        match s {
            "TextMessageStart" => Self::TextMessageStart,
            "TextMessageContent" => Self::TextMessageContent,
            "TextMessageEnd" => Self::TextMessageEnd,
            "ToolCallStart" => Self::ToolCallStart,
            "ToolCallArgs" => Self::ToolCallArgs,
            "ToolCallEnd" => Self::ToolCallEnd,
            "RunStarted" => Self::RunStarted,
            "RunFinished" => Self::RunFinished,
            "RunError" => Self::RunError,
            "StepStarted" => Self::StepStarted,
            "StepFinished" => Self::StepFinished,
            "StateSnapshot" => Self::StateSnapshot,
            "StateDelta" => Self::StateDelta,
            "MessagesSnapshot" => Self::MessagesSnapshot,
            "ActivitySnapshot" => Self::ActivitySnapshot,
            "ActivityDelta" => Self::ActivityDelta,
            "Raw" => Self::Raw,
            _ => Self::Unknown,
        }
    }

    /// Whether this type ends a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunFinished | Self::RunError)
    }

    /// The run status a terminal event implies.
    pub fn terminal_status(&self) -> Option<RunStatus> {
        match self {
            Self::RunFinished => Some(RunStatus::Completed),
            Self::RunError => Some(RunStatus::Error),
            _ => None,
        }
    }
}

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Error,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Error => write!(f, "error"),
        }
    }
}

/// One line of `runs.jsonl`. A completed run typically appears twice:
/// once running, once terminal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_id: String,
    pub thread_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
    pub status: RunStatus,
    pub started_at: String,
}

/// A runner event: the original JSON map plus its decoded type.
#[derive(Debug, Clone)]
pub struct Event {
    value: Value,
    event_type: EventType,
}

impl Event {
    /// Wrap a decoded JSON map. Non-object values are carried as Unknown.
    pub fn from_value(value: Value) -> Self {
        let event_type = get_str(&value, &["type"])
            .map(EventType::parse)
            .unwrap_or(EventType::Unknown);
        Self { value, event_type }
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    /// The raw type string, empty when absent.
    pub fn type_str(&self) -> &str {
        get_str(&self.value, &["type"]).unwrap_or("")
    }

    pub fn run_id(&self) -> Option<&str> {
        get_str(&self.value, &["runId"]).filter(|s| !s.is_empty())
    }

    pub fn thread_id(&self) -> Option<&str> {
        get_str(&self.value, &["threadId"]).filter(|s| !s.is_empty())
    }

    pub fn timestamp(&self) -> Option<&str> {
        get_str(&self.value, &["timestamp"]).filter(|s| !s.is_empty())
    }

    /// Fill `runId` only when the event does not already carry one.
    /// Event-provided ids are authoritative.
    pub fn fill_run_id(&mut self, run_id: &str) {
        if self.run_id().is_none() && !run_id.is_empty() {
            set_nested(&mut self.value, &["runId"], Value::String(run_id.into()));
        }
    }

    /// Overwrite `runId` unconditionally. Only the router's orphan-
    /// terminal path uses this, to blank run ids that never had a run.
    pub fn set_run_id(&mut self, run_id: &str) {
        set_nested(&mut self.value, &["runId"], Value::String(run_id.into()));
    }

    /// Fill `threadId` only when the event does not already carry one.
    pub fn fill_thread_id(&mut self, thread_id: &str) {
        if self.thread_id().is_none() && !thread_id.is_empty() {
            set_nested(
                &mut self.value,
                &["threadId"],
                Value::String(thread_id.into()),
            );
        }
    }

    /// Stamp a timestamp when the runner did not provide one.
    pub fn fill_timestamp(&mut self, ts: &str) {
        if self.timestamp().is_none() {
            set_nested(&mut self.value, &["timestamp"], Value::String(ts.into()));
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }
}

/// Synthesize a `MessagesSnapshot` event for a thread.
pub fn messages_snapshot(thread_id: &str, run_id: &str, messages: Value) -> Event {
    Event::from_value(serde_json::json!({
        "type": "MessagesSnapshot",
        "threadId": thread_id,
        "runId": run_id,
        "messages": messages,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_known_and_unknown_types() {
        assert_eq!(
            EventType::parse("TextMessageStart"),
            EventType::TextMessageStart
        );
        assert_eq!(EventType::parse("RunFinished"), EventType::RunFinished);
        assert_eq!(EventType::parse("SomethingNew"), EventType::Unknown);
    }

    #[test]
    fn terminal_classification() {
        assert!(EventType::RunFinished.is_terminal());
        assert!(EventType::RunError.is_terminal());
        assert!(!EventType::RunStarted.is_terminal());
        assert_eq!(
            EventType::RunFinished.terminal_status(),
            Some(RunStatus::Completed)
        );
        assert_eq!(
            EventType::RunError.terminal_status(),
            Some(RunStatus::Error)
        );
        assert_eq!(EventType::StepFinished.terminal_status(), None);
    }

    #[test]
    fn fill_does_not_overwrite() {
        let mut ev = Event::from_value(json!({"type": "RunStarted", "runId": "r1"}));
        ev.fill_run_id("r2");
        assert_eq!(ev.run_id(), Some("r1"));

        let mut ev = Event::from_value(json!({"type": "RunStarted", "runId": ""}));
        ev.fill_run_id("r2");
        assert_eq!(ev.run_id(), Some("r2"));
    }

    #[test]
    fn set_run_id_overwrites() {
        let mut ev = Event::from_value(json!({"type": "RunFinished", "runId": "ghost"}));
        ev.set_run_id("");
        assert_eq!(ev.run_id(), None);
        assert_eq!(ev.as_value()["runId"], "");
    }

    #[test]
    fn fill_thread_and_timestamp() {
        let mut ev = Event::from_value(json!({"type": "TextMessageStart"}));
        ev.fill_thread_id("session-1");
        ev.fill_timestamp("2026-01-01T00:00:00Z");
        assert_eq!(ev.thread_id(), Some("session-1"));
        assert_eq!(ev.timestamp(), Some("2026-01-01T00:00:00Z"));
        ev.fill_timestamp("later");
        assert_eq!(ev.timestamp(), Some("2026-01-01T00:00:00Z"));
    }

    #[test]
    fn run_record_round_trips() {
        let rec = RunRecord {
            run_id: "r1".into(),
            thread_id: "s1".into(),
            parent_run_id: None,
            status: RunStatus::Running,
            started_at: "2026-01-01T00:00:00Z".into(),
        };
        let line = serde_json::to_string(&rec).unwrap();
        assert!(line.contains("\"runId\":\"r1\""));
        assert!(!line.contains("parentRunId"));
        let back: RunRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(back, rec);
    }
}
