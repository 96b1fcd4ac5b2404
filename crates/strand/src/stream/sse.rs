//! SSE thread streaming with compact-on-read.
//!
//! On connect the completed portion of the log is compacted into one
//! `MessagesSnapshot`; active runs are replayed raw behind a synthetic
//! `RunStarted` + `StateSnapshot` pair; then the connection follows the
//! live feed. Dropped events (slow-consumer policy) are healed by
//! reconnecting through this same path.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, header};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_stream::wrappers::ReceiverStream;

use super::snapshot::state_snapshot;
use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::auth::{ProjectScope, authz};
use crate::events::envelope::EventType;
use crate::events::{EventRouter, LEGACY_MIGRATION_RUN_ID, SubscriberId, compact};
use crate::nested::get_str;
use crate::session::validate_session_name;

/// Keep-alive cadence; comment frames stop gateways from timing out.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    pub run_id: Option<String>,
}

/// Classification of a session log into its completed portion and the
/// per-run raw tails of active runs.
#[derive(Debug, Default, PartialEq)]
pub struct RunClassification {
    /// Events of completed runs (and run-less events), in log order.
    pub completed: Vec<Value>,
    /// `(runId, events)` for runs without a terminal event, in order of
    /// first appearance.
    pub active: Vec<(String, Vec<Value>)>,
}

/// Split a log by run: a run with a terminal event in the log is
/// completed; everything else is still active. Events without a run id,
/// and the legacy-migration snapshot, always count as completed.
pub fn classify_runs(events: &[Value]) -> RunClassification {
    use std::collections::HashSet;

    let mut terminal_runs: HashSet<&str> = HashSet::new();
    for event in events {
        let event_type = get_str(event, &["type"]).map(EventType::parse);
        if event_type.is_some_and(|t| t.is_terminal())
            && let Some(run_id) = get_str(event, &["runId"]).filter(|r| !r.is_empty())
        {
            terminal_runs.insert(run_id);
        }
    }

    let mut classification = RunClassification::default();
    for event in events {
        let run_id = get_str(event, &["runId"]).unwrap_or("");
        if run_id.is_empty()
            || run_id == LEGACY_MIGRATION_RUN_ID
            || terminal_runs.contains(run_id)
        {
            classification.completed.push(event.clone());
            continue;
        }
        match classification
            .active
            .iter_mut()
            .find(|(id, _)| id == run_id)
        {
            Some((_, run_events)) => run_events.push(event.clone()),
            None => classification
                .active
                .push((run_id.to_string(), vec![event.clone()])),
        }
    }
    classification
}

/// Unregisters the subscriber when the client goes away.
struct Subscription {
    router: Arc<EventRouter>,
    session: String,
    run: Option<String>,
    id: SubscriberId,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        match &self.run {
            Some(run_id) => self.router.unsubscribe_run(run_id, self.id),
            None => self.router.unsubscribe_thread(&self.session, self.id),
        }
    }
}

fn data_event(value: &Value) -> SseEvent {
    SseEvent::default().data(value.to_string())
}

/// GET /projects/{project}/sessions/{name}/events
pub async fn stream_events(
    State(state): State<AppState>,
    scope: ProjectScope,
    Path((_project, name)): Path<(String, String)>,
    Query(query): Query<StreamQuery>,
) -> ApiResult<Response> {
    validate_session_name(&name).map_err(ApiError::bad_request)?;
    authz::require_session_access(&scope.client(), &scope.project, "get").await?;

    let router = state.events.clone();
    let store = router.store().clone();

    // First read of the event log heals any legacy message file.
    if let Err(e) = store.migrate_legacy_messages(&name).await {
        tracing::warn!(session = %name, error = %e, "legacy migration failed");
    }

    // Register before reading so no live event falls into the gap. A
    // run-scoped client subscribes to the run when it is still in memory
    // and otherwise falls back to the thread feed filtered by run id.
    let (subscription, rx) = match query.run_id.as_deref().map(|r| (r, router.subscribe_run(r))) {
        Some((run_id, Some((id, rx)))) => (
            Subscription {
                router: router.clone(),
                session: name.clone(),
                run: Some(run_id.to_string()),
                id,
            },
            rx,
        ),
        _ => {
            let (id, rx) = router.subscribe_thread(&name);
            (
                Subscription {
                    router: router.clone(),
                    session: name.clone(),
                    run: None,
                    id,
                },
                rx,
            )
        }
    };

    let events = store.read_events(&name).await.unwrap_or_default();
    let filtered: Vec<Value> = match &query.run_id {
        Some(run_id) => events
            .iter()
            .filter(|e| get_str(e, &["runId"]) == Some(run_id))
            .cloned()
            .collect(),
        None => events,
    };
    let classification = classify_runs(&filtered);

    let mut initial: Vec<SseEvent> = Vec::new();
    if !classification.completed.is_empty() {
        let messages = compact(&classification.completed);
        let snapshot = json!({
            "type": "MessagesSnapshot",
            "threadId": name,
            "messages": messages,
        });
        initial.push(data_event(&snapshot));
    }
    for (run_id, run_events) in &classification.active {
        let started = json!({
            "type": "RunStarted",
            "threadId": name,
            "runId": run_id,
        });
        initial.push(data_event(&started));
        let snapshot = state_snapshot(scope.client(), &scope.project, &name, run_id).await;
        initial.push(data_event(&snapshot));
        for event in run_events {
            initial.push(data_event(event));
        }
    }

    let run_filter = query.run_id.clone();
    let live = ReceiverStream::new(rx).filter_map(move |value| {
        // The subscription rides along with the stream and unregisters
        // on drop.
        let _live = &subscription;
        let keep = run_filter
            .as_deref()
            .is_none_or(|r| get_str(&value, &["runId"]) == Some(r));
        futures::future::ready(keep.then(|| Ok::<_, Infallible>(data_event(&value))))
    });
    let stream = futures::stream::iter(
        initial
            .into_iter()
            .map(Ok::<_, Infallible>),
    )
    .chain(live);

    let mut response = Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(KEEPALIVE_INTERVAL)
                .text("keepalive"),
        )
        .into_response();
    // Sse only sets Content-Type; gateways need the rest spelled out.
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    // Disable nginx buffering if present
    headers.insert(
        header::HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_log_classifies_empty() {
        let classification = classify_runs(&[]);
        assert!(classification.completed.is_empty());
        assert!(classification.active.is_empty());
    }

    #[test]
    fn completed_and_active_runs_split() {
        let events = vec![
            json!({"type": "RunStarted", "runId": "a"}),
            json!({"type": "TextMessageStart", "runId": "a", "messageId": "m1", "role": "user"}),
            json!({"type": "RunFinished", "runId": "a"}),
            json!({"type": "RunStarted", "runId": "b"}),
            json!({"type": "TextMessageStart", "runId": "b", "messageId": "m2"}),
        ];
        let classification = classify_runs(&events);
        assert_eq!(classification.completed.len(), 3);
        assert_eq!(classification.active.len(), 1);
        let (run_id, run_events) = &classification.active[0];
        assert_eq!(run_id, "b");
        assert_eq!(run_events.len(), 2);
    }

    #[test]
    fn run_errors_count_as_terminal() {
        let events = vec![
            json!({"type": "StepStarted", "runId": "a"}),
            json!({"type": "RunError", "runId": "a"}),
        ];
        let classification = classify_runs(&events);
        assert!(classification.active.is_empty());
        assert_eq!(classification.completed.len(), 2);
    }

    #[test]
    fn runless_and_migration_events_are_completed() {
        let events = vec![
            json!({"type": "RunFinished"}),
            json!({"type": "MessagesSnapshot", "runId": LEGACY_MIGRATION_RUN_ID, "messages": []}),
        ];
        let classification = classify_runs(&events);
        assert_eq!(classification.completed.len(), 2);
        assert!(classification.active.is_empty());
    }

    #[test]
    fn active_runs_keep_first_appearance_order() {
        let events = vec![
            json!({"type": "StepStarted", "runId": "b"}),
            json!({"type": "StepStarted", "runId": "a"}),
            json!({"type": "StepStarted", "runId": "b"}),
        ];
        let classification = classify_runs(&events);
        let order: Vec<&str> = classification
            .active
            .iter()
            .map(|(id, _)| id.as_str())
            .collect();
        assert_eq!(order, vec!["b", "a"]);
        assert_eq!(classification.active[0].1.len(), 2);
    }
}
