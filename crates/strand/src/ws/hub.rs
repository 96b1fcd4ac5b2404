//! Process-wide WebSocket hub.
//!
//! Tracks the open connections of every session, fans broadcast frames
//! out to them, and persists inbound messages to the session's legacy
//! message log. Each connection's frames flow through a bounded channel
//! drained by a single writer task, which serializes pings, pongs, and
//! broadcasts without a shared sink lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::types::{SessionMessage, consolidate_partials};
use crate::events::EventStore;

/// Size of the per-connection send buffer.
const CONNECTION_BUFFER_SIZE: usize = 64;

/// One registered connection.
struct Connection {
    id: u64,
    user: String,
    tx: mpsc::Sender<String>,
}

/// WebSocket hub managing all session connections.
pub struct WsHub {
    store: EventStore,
    connections: DashMap<String, Vec<Connection>>,
    next_id: AtomicU64,
}

impl WsHub {
    pub fn new(store: EventStore) -> Self {
        Self {
            store,
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a connection for a session. Returns the connection id and
    /// the receiver its writer task drains.
    pub fn register(&self, session_id: &str, user: &str) -> (u64, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER_SIZE);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.connections
            .entry(session_id.to_string())
            .or_default()
            .push(Connection {
                id,
                user: user.to_string(),
                tx,
            });
        info!(session = session_id, connection = id, user, "registered WebSocket connection");
        (id, rx)
    }

    /// Unregister a connection.
    pub fn unregister(&self, session_id: &str, connection_id: u64) {
        if let Some(mut conns) = self.connections.get_mut(session_id) {
            conns.retain(|c| c.id != connection_id);
        }
        self.connections.retain(|_, conns| !conns.is_empty());
        info!(session = session_id, connection = connection_id, "unregistered WebSocket connection");
    }

    /// Queue a frame to one connection.
    pub fn send_to_connection(&self, session_id: &str, connection_id: u64, frame: String) {
        if let Some(conns) = self.connections.get(session_id)
            && let Some(conn) = conns.iter().find(|c| c.id == connection_id)
            && conn.tx.try_send(frame).is_err()
        {
            debug!(session = session_id, connection = connection_id, "connection send buffer full");
        }
    }

    /// Broadcast a frame to every connection of a session. A connection
    /// whose channel is closed is unregistered on a separate task so the
    /// caller never deadlocks against the registry.
    pub fn broadcast(self: &Arc<Self>, session_id: &str, frame: &str) {
        let mut dead: Vec<u64> = Vec::new();
        if let Some(conns) = self.connections.get(session_id) {
            for conn in conns.iter() {
                match conn.tx.try_send(frame.to_string()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(
                            session = session_id,
                            connection = conn.id,
                            user = %conn.user,
                            "dropping frame for slow connection"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => dead.push(conn.id),
                }
            }
        }
        if !dead.is_empty() {
            let hub = Arc::clone(self);
            let session = session_id.to_string();
            tokio::spawn(async move {
                for id in dead {
                    hub.unregister(&session, id);
                }
            });
        }
    }

    /// Handle one inbound text frame from a connection.
    ///
    /// `type=ping` gets a pong back on the same connection only. Any other
    /// type becomes a SessionMessage broadcast to the whole session and
    /// persisted to `messages.jsonl`.
    pub async fn handle_incoming(
        self: &Arc<Self>,
        session_id: &str,
        connection_id: u64,
        text: &str,
    ) {
        let parsed: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(session = session_id, error = %e, "ignoring unparseable frame");
                return;
            }
        };
        let message_type = parsed
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("message");

        if message_type == "ping" {
            let pong = json!({
                "type": "pong",
                "timestamp": chrono::Utc::now().to_rfc3339(),
            });
            self.send_to_connection(session_id, connection_id, pong.to_string());
            return;
        }

        let payload = parsed.get("payload").cloned().unwrap_or(Value::Null);
        let message = SessionMessage::new(session_id, message_type, payload);
        let record = match serde_json::to_value(&message) {
            Ok(v) => v,
            Err(e) => {
                warn!(session = session_id, error = %e, "failed to marshal session message");
                return;
            }
        };

        self.broadcast(session_id, &record.to_string());

        if let Err(e) = self.store.append_session_message(session_id, &record).await {
            warn!(session = session_id, error = %e, "failed to persist session message");
        }
    }

    /// List persisted session messages with partial consolidation.
    pub async fn list_messages(
        &self,
        session_id: &str,
        include_partials: bool,
    ) -> anyhow::Result<Vec<Value>> {
        let messages = self.store.read_session_messages(session_id).await?;
        Ok(consolidate_partials(messages, include_partials))
    }

    /// Number of open connections for a session.
    pub fn connection_count(&self, session_id: &str) -> usize {
        self.connections
            .get(session_id)
            .map(|c| c.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn hub() -> (TempDir, Arc<WsHub>) {
        let dir = TempDir::new().unwrap();
        let hub = Arc::new(WsHub::new(EventStore::new(dir.path())));
        (dir, hub)
    }

    #[tokio::test]
    async fn register_broadcast_unregister() {
        let (_dir, hub) = hub();
        let (id_a, mut rx_a) = hub.register("s1", "alice");
        let (_id_b, mut rx_b) = hub.register("s1", "bob");
        assert_eq!(hub.connection_count("s1"), 2);

        hub.broadcast("s1", "frame");
        assert_eq!(rx_a.recv().await.unwrap(), "frame");
        assert_eq!(rx_b.recv().await.unwrap(), "frame");

        hub.unregister("s1", id_a);
        assert_eq!(hub.connection_count("s1"), 1);
        hub.broadcast("s1", "second");
        assert_eq!(rx_b.recv().await.unwrap(), "second");
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn ping_gets_private_pong() {
        let (_dir, hub) = hub();
        let (id_a, mut rx_a) = hub.register("s1", "alice");
        let (_id_b, mut rx_b) = hub.register("s1", "bob");

        hub.handle_incoming("s1", id_a, r#"{"type":"ping"}"#).await;
        let frame = rx_a.recv().await.unwrap();
        let parsed: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["type"], "pong");
        assert!(parsed["timestamp"].is_string());
        assert!(rx_b.try_recv().is_err(), "pong is not broadcast");

        // Pings are not persisted.
        assert!(hub.list_messages("s1", true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn messages_broadcast_and_persist() {
        let (_dir, hub) = hub();
        let (id_a, mut rx_a) = hub.register("s1", "alice");
        hub.handle_incoming(
            "s1",
            id_a,
            r#"{"type":"chat","payload":{"text":"hello"}}"#,
        )
        .await;

        let frame = rx_a.recv().await.unwrap();
        let parsed: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["sessionId"], "s1");
        assert_eq!(parsed["type"], "chat");
        assert_eq!(parsed["payload"]["text"], "hello");

        let listed = hub.list_messages("s1", true).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["type"], "chat");
    }

    #[tokio::test]
    async fn partial_listing_consolidates() {
        let (_dir, hub) = hub();
        let (id, _rx) = hub.register("s1", "alice");
        for text in ["H", "He", "Hey"] {
            hub.handle_incoming(
                "s1",
                id,
                &format!(r#"{{"type":"message.partial","payload":"{text}"}}"#),
            )
            .await;
        }
        let listed = hub.list_messages("s1", true).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["payload"], "Hey");

        let without = hub.list_messages("s1", false).await.unwrap();
        assert!(without.is_empty());
    }
}
