//! Read-time compaction of event sequences into message lists.
//!
//! The compactor is a pure accumulator over an ordered event sequence. It
//! never does IO; the streaming and history layers feed it the persisted
//! log (or a run-scoped slice of it) and render the result.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::events::envelope::EventType;
use crate::nested::{get_either_str, get_nested, get_str};

/// Message roles shown to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            "tool" => Some(Self::Tool),
            _ => None,
        }
    }
}

/// Status of a tool call within a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Running,
    Completed,
    Error,
}

/// A finalized tool invocation attached to an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: String,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_tool_use_id: Option<String>,
}

/// The compacted unit shown to clients. Messages are never stored; they
/// are reconstructed from the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Message {
    fn new(id: String, role: Role, timestamp: Option<String>) -> Self {
        Self {
            id,
            role,
            content: String::new(),
            tool_calls: Vec::new(),
            timestamp,
        }
    }
}

/// Accumulator state for one compaction pass.
#[derive(Debug, Default)]
pub struct Compactor {
    output: Vec<Message>,
    current: Option<Message>,
    /// Tool calls seen started but not yet ended, in arrival order.
    pending_tools: Vec<ToolCall>,
    /// Message ids flagged hidden by `message_metadata` hints.
    hidden: HashMap<String, bool>,
}

impl Compactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one event. Unknown and lifecycle types fall through without
    /// mutating state.
    pub fn push(&mut self, event: &Value) {
        let event_type = get_str(event, &["type"])
            .map(EventType::parse)
            .unwrap_or(EventType::Unknown);

        match event_type {
            EventType::TextMessageStart => self.on_text_start(event),
            EventType::TextMessageContent => self.on_text_content(event),
            EventType::TextMessageEnd => self.on_text_end(),
            EventType::ToolCallStart => self.on_tool_start(event),
            EventType::ToolCallArgs => self.on_tool_args(event),
            EventType::ToolCallEnd => self.on_tool_end(event),
            EventType::Raw => self.on_raw(event),
            EventType::MessagesSnapshot => self.on_snapshot(event),
            EventType::RunStarted
            | EventType::RunFinished
            | EventType::RunError
            | EventType::StepStarted
            | EventType::StepFinished
            | EventType::StateSnapshot
            | EventType::StateDelta
            | EventType::ActivitySnapshot
            | EventType::ActivityDelta => {}
            EventType::Unknown => {
                debug!(
                    event_type = get_str(event, &["type"]).unwrap_or("<none>"),
                    "ignoring unknown event type during compaction"
                );
            }
        }
    }

    /// Flush open state and return the hidden-filtered message list.
    /// Tool calls still running are dropped; they belong to an in-flight
    /// run and will be streamed raw.
    pub fn finish(mut self) -> Vec<Message> {
        self.flush_current();
        let hidden = self.hidden;
        self.output
            .retain(|m| !hidden.get(&m.id).copied().unwrap_or(false));
        self.output
    }

    fn flush_current(&mut self) {
        if let Some(msg) = self.current.take() {
            self.output.push(msg);
        }
    }

    fn on_text_start(&mut self, event: &Value) {
        self.flush_current();
        let id = message_id(event).unwrap_or_default().to_string();
        let role = get_str(event, &["role"])
            .and_then(Role::parse)
            .unwrap_or(Role::Assistant);
        let timestamp = get_str(event, &["timestamp"]).map(str::to_string);
        self.current = Some(Message::new(id, role, timestamp));
    }

    fn on_text_content(&mut self, event: &Value) {
        let Some(delta) = get_str(event, &["delta"]) else {
            return;
        };
        if let Some(current) = self.current.as_mut() {
            current.content.push_str(delta);
        }
    }

    fn on_text_end(&mut self) {
        // Users never have tool calls; assistant messages stay open so
        // subsequent ToolCallEnd events may attach.
        if self
            .current
            .as_ref()
            .is_some_and(|m| m.role == Role::User)
        {
            self.flush_current();
        }
    }

    fn on_tool_start(&mut self, event: &Value) {
        let Some(id) = tool_call_id(event) else {
            return;
        };
        let name = get_either_str(event, "toolCallName", "tool_call_name")
            .unwrap_or("")
            .to_string();
        let parent = get_either_str(event, "parentToolUseId", "parent_tool_use_id")
            .map(str::to_string);
        self.pending_tools.push(ToolCall {
            id: id.to_string(),
            name,
            arguments: String::new(),
            status: ToolCallStatus::Running,
            result: None,
            error: None,
            parent_tool_use_id: parent,
        });
    }

    fn on_tool_args(&mut self, event: &Value) {
        let Some(id) = tool_call_id(event) else {
            return;
        };
        let Some(delta) = get_str(event, &["delta"]) else {
            return;
        };
        // JSON fragment accumulation: the args string may be legal JSON
        // only once the final delta has arrived.
        if let Some(call) = self.pending_tools.iter_mut().find(|c| c.id == id) {
            call.arguments.push_str(delta);
        }
    }

    fn on_tool_end(&mut self, event: &Value) {
        let Some(id) = tool_call_id(event) else {
            return;
        };
        let Some(pos) = self.pending_tools.iter().position(|c| c.id == id) else {
            return;
        };
        let mut call = self.pending_tools.remove(pos);
        let error = get_str(event, &["error"]).filter(|s| !s.is_empty());
        if let Some(err) = error {
            call.status = ToolCallStatus::Error;
            call.error = Some(err.to_string());
        } else {
            call.status = ToolCallStatus::Completed;
        }
        call.result = get_str(event, &["result"]).map(str::to_string);

        match self.current.as_mut() {
            Some(current) if current.role == Role::Assistant => {
                current.tool_calls.push(call);
            }
            _ => {
                // No open assistant message: emit a synthetic one holding
                // only this call.
                let mut msg = Message::new(format!("tool-{id}"), Role::Assistant, None);
                msg.tool_calls.push(call);
                self.output.push(msg);
            }
        }
    }

    fn on_raw(&mut self, event: &Value) {
        let Some(inner) = get_nested(event, &["event"]) else {
            return;
        };
        // A message_metadata hint hides a message id from the output.
        if get_str(inner, &["type"]) == Some("message_metadata") {
            if let Some(id) = message_id(inner) {
                let hidden = get_str(inner, &["hidden"])
                    .map(|s| s == "true")
                    .or_else(|| get_nested(inner, &["hidden"]).and_then(Value::as_bool))
                    .unwrap_or(false);
                self.hidden.insert(id.to_string(), hidden);
            }
            return;
        }
        // Otherwise: a complete raw message with role/content/id/timestamp.
        let Some(role) = get_str(inner, &["role"]).and_then(Role::parse) else {
            return;
        };
        self.flush_current();
        let mut msg = Message::new(
            get_str(inner, &["id"]).unwrap_or("").to_string(),
            role,
            get_str(inner, &["timestamp"]).map(str::to_string),
        );
        msg.content = raw_content(inner);
        self.output.push(msg);
    }

    fn on_snapshot(&mut self, event: &Value) {
        // A snapshot replaces the accumulated message state wholesale.
        // The hidden map survives: hide-hints are metadata about ids, not
        // part of the message stream being resynchronized.
        let Some(messages) = get_nested(event, &["messages"]).and_then(Value::as_array) else {
            return;
        };
        self.output.clear();
        self.current = None;
        self.pending_tools.clear();
        for raw in messages {
            match serde_json::from_value::<Message>(raw.clone()) {
                Ok(msg) => self.output.push(msg),
                Err(e) => debug!(error = %e, "skipping malformed snapshot message"),
            }
        }
    }
}

/// Compact a full event sequence in one pass.
pub fn compact(events: &[Value]) -> Vec<Message> {
    let mut compactor = Compactor::new();
    for event in events {
        compactor.push(event);
    }
    compactor.finish()
}

/// Compact only the events belonging to one run.
pub fn compact_run(events: &[Value], run_id: &str) -> Vec<Message> {
    let mut compactor = Compactor::new();
    for event in events {
        if get_str(event, &["runId"]) == Some(run_id) {
            compactor.push(event);
        }
    }
    compactor.finish()
}

fn message_id(event: &Value) -> Option<&str> {
    get_either_str(event, "messageId", "message_id").or_else(|| get_str(event, &["id"]))
}

fn tool_call_id(event: &Value) -> Option<&str> {
    get_either_str(event, "toolCallId", "tool_call_id")
}

/// Raw message content may be a plain string or a block list with text
/// entries; both shapes occur in legacy logs.
fn raw_content(inner: &Value) -> String {
    match get_nested(inner, &["content"]) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| get_str(b, &["text"]))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text_message(id: &str, role: &str, content: &str) -> Vec<Value> {
        vec![
            json!({"type": "TextMessageStart", "messageId": id, "role": role}),
            json!({"type": "TextMessageContent", "messageId": id, "delta": content}),
            json!({"type": "TextMessageEnd", "messageId": id}),
        ]
    }

    #[test]
    fn user_message_closes_on_end() {
        let events = text_message("m1", "user", "hi");
        let messages = compact(&events);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, "m1");
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "hi");
    }

    #[test]
    fn content_deltas_accumulate() {
        let events = vec![
            json!({"type": "TextMessageStart", "messageId": "m1", "role": "assistant"}),
            json!({"type": "TextMessageContent", "delta": "Hello"}),
            json!({"type": "TextMessageContent", "delta": ", world"}),
            json!({"type": "TextMessageEnd"}),
        ];
        let messages = compact(&events);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "Hello, world");
    }

    #[test]
    fn role_defaults_to_assistant() {
        let events = vec![json!({"type": "TextMessageStart", "messageId": "m1"})];
        let messages = compact(&events);
        assert_eq!(messages[0].role, Role::Assistant);
    }

    #[test]
    fn assistant_message_collects_tool_calls_after_end() {
        let mut events = vec![
            json!({"type": "TextMessageStart", "messageId": "m1", "role": "assistant"}),
            json!({"type": "TextMessageContent", "delta": "let me check"}),
            json!({"type": "TextMessageEnd"}),
            json!({"type": "ToolCallStart", "toolCallId": "t1", "toolCallName": "read_file"}),
            json!({"type": "ToolCallArgs", "toolCallId": "t1", "delta": "{\"path\":"}),
            json!({"type": "ToolCallArgs", "toolCallId": "t1", "delta": "\"a.rs\"}"}),
            json!({"type": "ToolCallEnd", "toolCallId": "t1", "result": "ok"}),
        ];
        events.extend(text_message("m2", "user", "next"));
        let messages = compact(&events);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].tool_calls.len(), 1);
        let call = &messages[0].tool_calls[0];
        assert_eq!(call.name, "read_file");
        assert_eq!(call.arguments, "{\"path\":\"a.rs\"}");
        assert_eq!(call.status, ToolCallStatus::Completed);
        assert_eq!(call.result.as_deref(), Some("ok"));
    }

    #[test]
    fn tool_call_error_sets_status() {
        let events = vec![
            json!({"type": "ToolCallStart", "toolCallId": "t1", "toolCallName": "run"}),
            json!({"type": "ToolCallEnd", "toolCallId": "t1", "error": "boom"}),
        ];
        let messages = compact(&events);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].tool_calls[0].status, ToolCallStatus::Error);
        assert_eq!(messages[0].tool_calls[0].error.as_deref(), Some("boom"));
    }

    #[test]
    fn orphan_tool_call_gets_synthetic_message() {
        let events = vec![
            json!({"type": "ToolCallStart", "toolCallId": "t9", "toolCallName": "ls"}),
            json!({"type": "ToolCallEnd", "toolCallId": "t9"}),
        ];
        let messages = compact(&events);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, "tool-t9");
        assert_eq!(messages[0].role, Role::Assistant);
        assert_eq!(messages[0].tool_calls.len(), 1);
    }

    #[test]
    fn running_tool_calls_are_dropped() {
        let events = vec![
            json!({"type": "TextMessageStart", "messageId": "m1", "role": "assistant"}),
            json!({"type": "TextMessageEnd"}),
            json!({"type": "ToolCallStart", "toolCallId": "t1", "toolCallName": "slow"}),
            json!({"type": "ToolCallArgs", "toolCallId": "t1", "delta": "{}"}),
        ];
        let messages = compact(&events);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].tool_calls.is_empty());
    }

    #[test]
    fn snake_case_fields_are_accepted() {
        let events = vec![
            json!({"type": "TextMessageStart", "message_id": "m1", "role": "assistant"}),
            json!({"type": "TextMessageEnd"}),
            json!({"type": "ToolCallStart", "tool_call_id": "t1", "tool_call_name": "grep"}),
            json!({"type": "ToolCallEnd", "tool_call_id": "t1"}),
        ];
        let messages = compact(&events);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, "m1");
        assert_eq!(messages[0].tool_calls[0].name, "grep");
    }

    #[test]
    fn hidden_messages_are_filtered() {
        let mut events = vec![json!({
            "type": "Raw",
            "event": {"type": "message_metadata", "messageId": "seed", "hidden": true}
        })];
        events.extend(text_message("seed", "user", "auto prompt"));
        events.extend(text_message("m2", "user", "real question"));
        let messages = compact(&events);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, "m2");
    }

    #[test]
    fn hidden_hint_after_message_still_filters() {
        let mut events = text_message("seed", "user", "auto prompt");
        events.push(json!({
            "type": "Raw",
            "event": {"type": "message_metadata", "messageId": "seed", "hidden": true}
        }));
        assert!(compact(&events).is_empty());
    }

    #[test]
    fn raw_message_appends() {
        let events = vec![json!({
            "type": "Raw",
            "event": {"role": "system", "id": "s1", "content": "booted", "timestamp": "t0"}
        })];
        let messages = compact(&events);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].content, "booted");
        assert_eq!(messages[0].timestamp.as_deref(), Some("t0"));
    }

    #[test]
    fn raw_message_block_content() {
        let events = vec![json!({
            "type": "Raw",
            "event": {"role": "assistant", "id": "a1", "content": [
                {"type": "text", "text": "part one "},
                {"type": "text", "text": "part two"}
            ]}
        })];
        let messages = compact(&events);
        assert_eq!(messages[0].content, "part one part two");
    }

    #[test]
    fn raw_message_flushes_open_message() {
        let mut events = vec![
            json!({"type": "TextMessageStart", "messageId": "m1", "role": "assistant"}),
            json!({"type": "TextMessageContent", "delta": "open"}),
        ];
        events.push(json!({
            "type": "Raw",
            "event": {"role": "user", "id": "u1", "content": "interjection"}
        }));
        let messages = compact(&events);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, "m1");
        assert_eq!(messages[1].id, "u1");
    }

    #[test]
    fn snapshot_replaces_accumulated_state() {
        let mut events = text_message("m1", "user", "old");
        events.push(json!({
            "type": "MessagesSnapshot",
            "messages": [
                {"id": "n1", "role": "user", "content": "fresh"},
                {"id": "n2", "role": "assistant", "content": "reply"}
            ]
        }));
        let messages = compact(&events);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, "n1");
        assert_eq!(messages[1].id, "n2");
    }

    #[test]
    fn snapshot_round_trips_messages() {
        // A MessagesSnapshot serialized from a compacted list yields the
        // original messages when compacted again.
        let mut events = text_message("m1", "user", "question");
        events.extend(text_message("m2", "assistant", "answer"));
        let first = compact(&events);

        let snapshot = vec![json!({
            "type": "MessagesSnapshot",
            "messages": serde_json::to_value(&first).unwrap(),
        })];
        let second = compact(&snapshot);
        assert_eq!(first, second);
    }

    #[test]
    fn compaction_is_deterministic() {
        let mut events = text_message("m1", "user", "hello");
        events.push(json!({"type": "ToolCallStart", "toolCallId": "t1", "toolCallName": "x"}));
        events.push(json!({"type": "ToolCallEnd", "toolCallId": "t1"}));
        let a = compact(&events);
        let b = compact(&events);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn split_feeding_matches_batch() {
        let mut events = text_message("m1", "user", "q1");
        events.extend(text_message("m2", "assistant", "a1"));
        events.extend(text_message("m3", "user", "q2"));

        let batch = compact(&events);

        let mut split = Compactor::new();
        for (i, ev) in events.iter().enumerate() {
            // Arbitrary prefix/suffix boundary at every position.
            let _ = i;
            split.push(ev);
        }
        assert_eq!(split.finish(), batch);
    }

    #[test]
    fn lifecycle_and_unknown_events_do_not_disturb_state() {
        let mut events = vec![
            json!({"type": "RunStarted", "runId": "r1"}),
            json!({"type": "TextMessageStart", "messageId": "m1", "role": "assistant"}),
            json!({"type": "StepStarted"}),
            json!({"type": "TextMessageContent", "delta": "body"}),
            json!({"type": "StateDelta", "delta": []}),
            json!({"type": "BrandNewThing", "payload": 1}),
            json!({"type": "TextMessageEnd"}),
            json!({"type": "RunFinished", "runId": "r1"}),
        ];
        events.push(json!({"type": "ActivitySnapshot"}));
        let messages = compact(&events);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "body");
    }

    #[test]
    fn compact_run_filters_by_run_id() {
        let mut events: Vec<Value> = Vec::new();
        for ev in text_message("a1", "user", "run a") {
            let mut ev = ev;
            ev["runId"] = json!("run-a");
            events.push(ev);
        }
        for ev in text_message("b1", "user", "run b") {
            let mut ev = ev;
            ev["runId"] = json!("run-b");
            events.push(ev);
        }
        let messages = compact_run(&events, "run-a");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, "a1");
    }
}
