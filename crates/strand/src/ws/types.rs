//! WebSocket message types and listing rules.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::nested::get_str;

/// Message type a progressive render arrives under.
pub const PARTIAL_TYPE: &str = "message.partial";

/// The record broadcast to a session's connections and persisted to
/// `messages.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessage {
    pub session_id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial: Option<bool>,
}

impl SessionMessage {
    pub fn new(session_id: &str, message_type: &str, payload: Value) -> Self {
        Self {
            session_id: session_id.to_string(),
            message_type: message_type.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            partial: matches!(message_type, PARTIAL_TYPE).then_some(true),
            payload,
        }
    }
}

fn is_partial(message: &Value) -> bool {
    get_str(message, &["type"]) == Some(PARTIAL_TYPE)
        || message
            .get("partial")
            .and_then(Value::as_bool)
            .unwrap_or(false)
}

/// Consolidate progressive messages for listing: a partial entry replaces
/// any immediately-preceding partial, so the final render of a
/// progressive message is the current buffer. With `include_partials`
/// off, partials are dropped entirely.
pub fn consolidate_partials(messages: Vec<Value>, include_partials: bool) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(messages.len());
    for message in messages {
        let partial = is_partial(&message);
        if partial {
            if !include_partials {
                continue;
            }
            if out.last().map(is_partial).unwrap_or(false) {
                out.pop();
            }
        }
        out.push(message);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn partial(text: &str) -> Value {
        json!({"sessionId": "s1", "type": PARTIAL_TYPE, "timestamp": "t", "payload": text, "partial": true})
    }

    fn complete(text: &str) -> Value {
        json!({"sessionId": "s1", "type": "message", "timestamp": "t", "payload": text})
    }

    #[test]
    fn consecutive_partials_collapse_to_last() {
        let messages = vec![partial("H"), partial("He"), partial("Hel"), complete("Hello")];
        let out = consolidate_partials(messages, true);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["payload"], "Hel");
        assert_eq!(out[1]["payload"], "Hello");
    }

    #[test]
    fn partials_split_by_complete_messages_survive() {
        let messages = vec![partial("a"), complete("done"), partial("b")];
        let out = consolidate_partials(messages, true);
        assert_eq!(out.len(), 3);
        assert_eq!(out[2]["payload"], "b");
    }

    #[test]
    fn partials_excluded_when_flag_off() {
        let messages = vec![partial("a"), partial("b"), complete("done")];
        let out = consolidate_partials(messages, false);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["payload"], "done");
    }

    #[test]
    fn session_message_marks_partials() {
        let msg = SessionMessage::new("s1", PARTIAL_TYPE, json!("buf"));
        assert_eq!(msg.partial, Some(true));
        let msg = SessionMessage::new("s1", "chat", json!("hi"));
        assert_eq!(msg.partial, None);
    }

    #[test]
    fn session_message_wire_shape() {
        let msg = SessionMessage::new("s1", "chat", json!({"text": "hi"}));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["sessionId"], "s1");
        assert_eq!(value["type"], "chat");
        assert!(value["timestamp"].is_string());
        assert_eq!(value["payload"]["text"], "hi");
    }
}
