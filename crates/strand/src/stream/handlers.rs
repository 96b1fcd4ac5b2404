//! History, run listing, and export endpoints.

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::auth::{ProjectScope, authz};
use crate::events::{Message, RunRecord, compact_run};
use crate::session::validate_session_name;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub run_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub thread_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub messages: Vec<Message>,
    pub runs: Vec<RunRecord>,
}

/// Union of persisted run records and in-memory runs, deduplicated by
/// run id. In-memory state wins: it is at least as fresh as the log.
async fn merged_runs(state: &AppState, session: &str) -> Vec<RunRecord> {
    let mut runs: Vec<RunRecord> = state
        .events
        .store()
        .read_runs(session)
        .await
        .unwrap_or_default();
    // Keep the latest persisted record per run id.
    let mut deduped: Vec<RunRecord> = Vec::new();
    for run in runs.drain(..) {
        if let Some(existing) = deduped.iter_mut().find(|r| r.run_id == run.run_id) {
            *existing = run;
        } else {
            deduped.push(run);
        }
    }
    for live in state.events.run_records_for_session(session) {
        if let Some(existing) = deduped.iter_mut().find(|r| r.run_id == live.run_id) {
            *existing = live;
        } else {
            deduped.push(live);
        }
    }
    deduped
}

/// GET /projects/{project}/sessions/{name}/history
///
/// Without a `runId` the messages list stays empty; full history is only
/// served through the SSE snapshot.
pub async fn get_history(
    State(state): State<AppState>,
    scope: ProjectScope,
    Path((_project, name)): Path<(String, String)>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<HistoryResponse>> {
    validate_session_name(&name).map_err(ApiError::bad_request)?;
    authz::require_session_access(&scope.client(), &scope.project, "get").await?;

    let store = state.events.store();
    if let Err(e) = store.migrate_legacy_messages(&name).await {
        tracing::warn!(session = %name, error = %e, "legacy migration failed");
    }

    let messages = match &query.run_id {
        Some(run_id) => {
            let events = store.read_events(&name).await.unwrap_or_default();
            compact_run(&events, run_id)
        }
        None => Vec::new(),
    };
    let runs = merged_runs(&state, &name).await;

    Ok(Json(HistoryResponse {
        thread_id: name,
        run_id: query.run_id,
        messages,
        runs,
    }))
}

#[derive(Debug, Serialize)]
pub struct RunsResponse {
    pub runs: Vec<RunRecord>,
}

/// GET /projects/{project}/sessions/{name}/runs
pub async fn list_runs(
    State(state): State<AppState>,
    scope: ProjectScope,
    Path((_project, name)): Path<(String, String)>,
) -> ApiResult<Json<RunsResponse>> {
    validate_session_name(&name).map_err(ApiError::bad_request)?;
    authz::require_session_access(&scope.client(), &scope.project, "get").await?;
    let runs = merged_runs(&state, &name).await;
    Ok(Json(RunsResponse { runs }))
}

/// GET /projects/{project}/sessions/{name}/export
///
/// The raw event log plus any legacy message log as one JSON document.
pub async fn export_session(
    State(state): State<AppState>,
    scope: ProjectScope,
    Path((_project, name)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    validate_session_name(&name).map_err(ApiError::bad_request)?;
    authz::require_session_access(&scope.client(), &scope.project, "get").await?;

    let store = state.events.store();
    let events = store.read_events(&name).await.unwrap_or_default();
    let legacy = store.read_legacy_for_export(&name).await.unwrap_or_default();

    let mut export = json!({
        "sessionId": name,
        "events": events,
    });
    if !legacy.is_empty() {
        export["messages"] = Value::Array(legacy);
    }
    Ok(Json(export))
}
