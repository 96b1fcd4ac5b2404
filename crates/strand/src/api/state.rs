//! Application state shared across handlers.

use std::sync::Arc;

use crate::auth::KubeClients;
use crate::content::ContentClient;
use crate::events::{EventRouter, EventStore};
use crate::settings::ServerConfig;
use crate::ws::WsHub;

/// Application state shared across all handlers.
///
/// Single-process by design: the run-state map, thread subscribers, and
/// WebSocket hub live in this process, and the state directory assumes
/// one backend replica per volume. Horizontal scaling needs sticky
/// sessions or external pub-sub.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Kubernetes client factory (per-request minting + elevated client).
    pub kube: Arc<KubeClients>,
    /// Event router and fan-out engine.
    pub events: Arc<EventRouter>,
    /// WebSocket hub for bidirectional session channels.
    pub hub: Arc<WsHub>,
    /// Content-service gateway.
    pub content: Arc<ContentClient>,
    /// Shared HTTP client for upstream calls.
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(config: ServerConfig, kube: KubeClients) -> Self {
        let config = Arc::new(config);
        let store = EventStore::new(&config.state_dir);
        let events = EventRouter::new(store.clone());
        events.spawn_sweeper();
        let http = reqwest::Client::new();
        Self {
            kube: Arc::new(kube),
            hub: Arc::new(WsHub::new(store)),
            content: Arc::new(ContentClient::new(config.clone(), http.clone())),
            events,
            config,
            http,
        }
    }
}
