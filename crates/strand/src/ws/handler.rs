//! WebSocket endpoint for bidirectional session channels.

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::hub::WsHub;
use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::auth::{ProjectScope, authz};
use crate::session::validate_session_name;

/// Interval between WebSocket protocol pings.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// GET /projects/{project}/sessions/{id}/ws
pub async fn ws_handler(
    State(state): State<AppState>,
    scope: ProjectScope,
    Path((_project, session_id)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    validate_session_name(&session_id).map_err(ApiError::bad_request)?;
    authz::require_session_access(&scope.client(), &scope.project, "get").await?;

    let user = scope
        .identity
        .service_account()
        .map(|(ns, name)| format!("system:serviceaccount:{ns}:{name}"))
        .unwrap_or_else(|| "user".to_string());

    let hub = state.hub.clone();
    Ok(ws.on_upgrade(move |socket| handle_connection(socket, hub, session_id, user)))
}

async fn handle_connection(socket: WebSocket, hub: Arc<WsHub>, session_id: String, user: String) {
    let (mut sink, mut stream) = socket.split();
    let (connection_id, mut frames) = hub.register(&session_id, &user);

    // Writer task: the single owner of the sink. Hub broadcasts, pongs,
    // and protocol pings all funnel through here.
    let send_session = session_id.clone();
    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(PING_INTERVAL);
        ping_interval.tick().await; // first tick fires immediately
        loop {
            tokio::select! {
                frame = frames.recv() => {
                    let Some(frame) = frame else { break };
                    if sink.send(Message::Text(frame.into())).await.is_err() {
                        debug!(session = %send_session, "write failed; closing connection");
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Reader loop.
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                hub.handle_incoming(&session_id, connection_id, text.as_str())
                    .await;
            }
            Ok(Message::Binary(_)) => {
                debug!(session = %session_id, "ignoring binary frame");
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!(session = %session_id, connection = connection_id, "client closed WebSocket");
                break;
            }
            Err(e) => {
                warn!(session = %session_id, connection = connection_id, error = %e, "WebSocket read error");
                break;
            }
        }
    }

    send_task.abort();
    hub.unregister(&session_id, connection_id);
}

#[derive(Debug, Default, Deserialize)]
pub struct MessagesQuery {
    #[serde(default)]
    pub include_partial_messages: bool,
}

/// GET /projects/{project}/sessions/{id}/messages
///
/// Persisted hub messages with partial-message consolidation.
pub async fn list_session_messages(
    State(state): State<AppState>,
    scope: ProjectScope,
    Path((_project, session_id)): Path<(String, String)>,
    Query(query): Query<MessagesQuery>,
) -> ApiResult<Json<Vec<Value>>> {
    validate_session_name(&session_id).map_err(ApiError::bad_request)?;
    authz::require_session_access(&scope.client(), &scope.project, "get").await?;
    let messages = state
        .hub
        .list_messages(&session_id, query.include_partial_messages)
        .await?;
    Ok(Json(messages))
}
