//! Append-only persistence for session event and run logs.
//!
//! Layout, per session, under `<state>/sessions/<sessionId>/`:
//!
//! - `events.jsonl` — every event the router has accepted, ids filled in
//! - `runs.jsonl` — one record per run status transition
//! - `messages.jsonl` — legacy WebSocket messages
//! - `messages.jsonl.migrated` — marker left by the one-shot migration
//!
//! Files are JSON-lines: one object per line, `\n`-terminated. Absence is
//! treated as empty. Each append is a single write of the marshaled line.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::envelope::{Event, RunRecord, messages_snapshot};
use crate::events::compactor::{Message, Role};
use crate::nested::{get_nested, get_str};

/// Run id stamped on the snapshot produced by legacy migration.
pub const LEGACY_MIGRATION_RUN_ID: &str = "legacy-migration";

/// Filesystem store for per-session logs.
#[derive(Debug, Clone)]
pub struct EventStore {
    base: PathBuf,
}

impl EventStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.base.join("sessions").join(session_id)
    }

    pub fn events_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("events.jsonl")
    }

    pub fn runs_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("runs.jsonl")
    }

    pub fn legacy_messages_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("messages.jsonl")
    }

    pub fn migrated_marker_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("messages.jsonl.migrated")
    }

    /// Append one JSON value as a line to the given file.
    async fn append_line(&self, path: &Path, value: &Value) -> Result<()> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let mut line = serde_json::to_string(value).context("marshaling log line")?;
        line.push('\n');

        let mut opts = OpenOptions::new();
        opts.append(true).create(true);
        #[cfg(unix)]
        opts.mode(0o644);
        let mut file = opts
            .open(path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        // One write per record keeps concurrent appenders line-atomic.
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("appending to {}", path.display()))?;
        Ok(())
    }

    /// Read a JSON-lines file; a missing file is an empty log.
    async fn read_lines(&self, path: &Path) -> Result<Vec<Value>> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        let mut values = Vec::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(line) {
                Ok(v) => values.push(v),
                Err(e) => debug!(path = %path.display(), error = %e, "skipping malformed log line"),
            }
        }
        Ok(values)
    }

    pub async fn append_event(&self, session_id: &str, event: &Event) -> Result<()> {
        self.append_line(&self.events_path(session_id), event.as_value())
            .await
    }

    pub async fn append_run_record(&self, session_id: &str, record: &RunRecord) -> Result<()> {
        let value = serde_json::to_value(record).context("marshaling run record")?;
        self.append_line(&self.runs_path(session_id), &value).await
    }

    /// Persist a WebSocket hub message to the legacy-format log.
    pub async fn append_session_message(&self, session_id: &str, message: &Value) -> Result<()> {
        self.append_line(&self.legacy_messages_path(session_id), message)
            .await
    }

    pub async fn read_events(&self, session_id: &str) -> Result<Vec<Value>> {
        self.read_lines(&self.events_path(session_id)).await
    }

    pub async fn read_runs(&self, session_id: &str) -> Result<Vec<RunRecord>> {
        let values = self.read_lines(&self.runs_path(session_id)).await?;
        Ok(values
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect())
    }

    pub async fn read_session_messages(&self, session_id: &str) -> Result<Vec<Value>> {
        self.read_lines(&self.legacy_messages_path(session_id)).await
    }

    /// Legacy messages for export: the live file if present, otherwise the
    /// migrated copy so no data is silently dropped.
    pub async fn read_legacy_for_export(&self, session_id: &str) -> Result<Vec<Value>> {
        let live = self.read_session_messages(session_id).await?;
        if !live.is_empty() {
            return Ok(live);
        }
        self.read_lines(&self.migrated_marker_path(session_id)).await
    }

    /// One-shot migration of the legacy `messages.jsonl` into a single
    /// `MessagesSnapshot` event. Runs at most once per session: the
    /// renamed `.migrated` file is the terminal marker.
    ///
    /// Returns the snapshot event when a migration happened.
    pub async fn migrate_legacy_messages(&self, session_id: &str) -> Result<Option<Event>> {
        let legacy_path = self.legacy_messages_path(session_id);
        let marker_path = self.migrated_marker_path(session_id);

        if tokio::fs::try_exists(&marker_path).await.unwrap_or(false) {
            return Ok(None);
        }
        if !tokio::fs::try_exists(&legacy_path).await.unwrap_or(false) {
            return Ok(None);
        }

        let records = self.read_lines(&legacy_path).await?;
        let messages: Vec<Message> = records.iter().filter_map(legacy_to_message).collect();

        let snapshot = messages_snapshot(
            session_id,
            LEGACY_MIGRATION_RUN_ID,
            serde_json::to_value(&messages).context("marshaling migrated messages")?,
        );
        self.append_event(session_id, &snapshot).await?;

        tokio::fs::rename(&legacy_path, &marker_path)
            .await
            .with_context(|| format!("renaming {}", legacy_path.display()))?;
        warn!(
            session = session_id,
            migrated = messages.len(),
            "migrated legacy message log into event log"
        );
        Ok(Some(snapshot))
    }
}

/// Map one legacy WebSocket record onto a compacted message.
///
/// Legacy lines carry `{sessionId, type, timestamp, payload}`; user input
/// arrived as `user_message`, agent output under `agent.*` types.
fn legacy_to_message(record: &Value) -> Option<Message> {
    let msg_type = get_str(record, &["type"])?;
    let role = match msg_type {
        "user_message" => Role::User,
        t if t.starts_with("agent.") || t == "agent_message" => Role::Assistant,
        _ => return None,
    };
    let payload = get_nested(record, &["payload"])?;
    let content = legacy_content(payload)?;
    let id = get_str(payload, &["id"])
        .map(str::to_string)
        .unwrap_or_else(|| {
            format!(
                "legacy-{}",
                get_str(record, &["timestamp"]).unwrap_or("unknown")
            )
        });
    Some(Message {
        id,
        role,
        content,
        tool_calls: Vec::new(),
        timestamp: get_str(record, &["timestamp"]).map(str::to_string),
    })
}

fn legacy_content(payload: &Value) -> Option<String> {
    if let Some(s) = payload.as_str() {
        return Some(s.to_string());
    }
    match get_nested(payload, &["content"]) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Array(blocks)) => Some(
            blocks
                .iter()
                .filter_map(|b| get_str(b, &["text"]))
                .collect::<Vec<_>>()
                .join(""),
        ),
        _ => get_str(payload, &["text"]).map(str::to_string),
    }
}
