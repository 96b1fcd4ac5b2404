//! Runner proxy: starts runs and consumes the runner's event stream.
//!
//! The client's POST returns as soon as the run is registered; a
//! background task detached from the request context opens the upstream
//! SSE stream and feeds every event into the router. An upstream run may
//! last hours while the browser connection is fragile, so clients follow
//! progress through the reconnectable SSE endpoint instead.

use std::time::Duration;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde_json::{Value, json};
use tokio::io::AsyncBufReadExt;
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::auth::{ProjectScope, authz};
use crate::events::envelope::Event;
use crate::events::{EventRouter, RunStatus};
use crate::nested::{get_str, set_nested};
use crate::session::{derive_display_name, validate_session_name};
use crate::session::handlers::set_display_name_if_empty;

/// Hard ceiling on one background consumption task.
const RUN_CEILING: Duration = Duration::from_secs(2 * 3600);

/// Connection backoff: 500 ms, ×1.5, capped at 5 s, at most 15 attempts.
const CONNECT_INITIAL_MS: u64 = 500;
const CONNECT_FACTOR: f64 = 1.5;
const CONNECT_CAP: Duration = Duration::from_secs(5);
const CONNECT_MAX_ATTEMPTS: u32 = 15;

/// Bound on interrupt forwarding.
const INTERRUPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay before connection attempt `attempt` (1-based; the first attempt
/// has no delay).
pub fn backoff_delay(attempt: u32) -> Duration {
    if attempt <= 1 {
        return Duration::ZERO;
    }
    let exp = (attempt - 2) as i32;
    let millis = (CONNECT_INITIAL_MS as f64) * CONNECT_FACTOR.powi(exp);
    Duration::from_millis(millis as u64).min(CONNECT_CAP)
}

/// POST /projects/{project}/sessions/{name}/runs
pub async fn start_run(
    State(state): State<AppState>,
    scope: ProjectScope,
    Path((_project, name)): Path<(String, String)>,
    Json(mut payload): Json<Value>,
) -> ApiResult<Json<Value>> {
    validate_session_name(&name).map_err(ApiError::bad_request)?;
    authz::require_session_access(&scope.client(), &scope.project, "update").await?;

    // Fill ids into the input; caller-provided ids are kept.
    let thread_id = get_str(&payload, &["threadId"])
        .filter(|t| !t.is_empty())
        .unwrap_or(&name)
        .to_string();
    let run_id = get_str(&payload, &["runId"])
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    set_nested(&mut payload, &["threadId"], json!(thread_id));
    set_nested(&mut payload, &["runId"], json!(run_id));

    let run_state = state
        .events
        .register_run(&name, &scope.project, &thread_id, &run_id, None)
        .await;

    spawn_auto_name(&scope, &name, &payload);

    // The consumption task outlives this request on purpose.
    let router = state.events.clone();
    let http = state.http.clone();
    let runner_url = state.config.runner_url(&scope.project, &name);
    let project = scope.project.clone();
    let session = name.clone();
    let task_run_id = run_id.clone();
    let task = tokio::spawn(async move {
        let bounded = tokio::time::timeout(
            RUN_CEILING,
            consume_run(router.clone(), http, runner_url, project, session, task_run_id.clone(), payload),
        )
        .await;
        if bounded.is_err() {
            warn!(run = %task_run_id, "run exceeded ceiling; marking error");
            router.mark_run(&task_run_id, RunStatus::Error).await;
        }
    });
    run_state.attach_task(task.abort_handle());

    let stream_url = format!(
        "/projects/{}/sessions/{}/events?runId={}",
        scope.project, name, run_id
    );
    Ok(Json(json!({
        "threadId": thread_id,
        "runId": run_id,
        "streamUrl": stream_url,
        "status": "started",
    })))
}

/// Kick off the auto-name heuristic for a session whose displayName is
/// still empty. Best effort on a detached task.
fn spawn_auto_name(scope: &ProjectScope, session: &str, payload: &Value) {
    let prompt = get_str(payload, &["prompt"])
        .or_else(|| get_str(payload, &["message"]))
        .or_else(|| get_str(payload, &["content"]));
    let Some(derived) = prompt.and_then(derive_display_name) else {
        return;
    };
    let client = scope.client();
    let project = scope.project.to_string();
    let session = session.to_string();
    tokio::spawn(async move {
        match set_display_name_if_empty(client, &project, &session, &derived).await {
            Ok(true) => info!(project = %project, session = %session, "auto-named session"),
            Ok(false) => {}
            Err(e) => debug!(session = %session, error = %e, "auto-name failed"),
        }
    });
}

/// Open the runner stream and feed events into the router until EOF.
async fn consume_run(
    router: std::sync::Arc<EventRouter>,
    http: reqwest::Client,
    runner_url: String,
    project: String,
    session: String,
    run_id: String,
    payload: Value,
) {
    let response = match connect_with_backoff(&http, &runner_url, &payload).await {
        Ok(response) => response,
        Err(e) => {
            warn!(session = %session, run = %run_id, error = %e, "failed to reach runner");
            router.mark_run(&run_id, RunStatus::Error).await;
            return;
        }
    };
    if !response.status().is_success() {
        warn!(
            session = %session,
            run = %run_id,
            status = %response.status(),
            "runner rejected run"
        );
        router.mark_run(&run_id, RunStatus::Error).await;
        return;
    }

    let stream = futures::TryStreamExt::map_err(response.bytes_stream(), std::io::Error::other);
    let mut lines = StreamReader::new(stream).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim_start();
                if data.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(data) {
                    Ok(value) => {
                        let mut event = Event::from_value(value);
                        event.fill_thread_id(&session);
                        event.fill_run_id(&run_id);
                        router.route(&session, &project, event).await;
                    }
                    Err(e) => debug!(run = %run_id, error = %e, "skipping unparseable SSE line"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(run = %run_id, error = %e, "runner stream read error");
                break;
            }
        }
    }

    // EOF closes the run unless a terminal event already decided it.
    router.mark_run(&run_id, RunStatus::Completed).await;
    info!(session = %session, run = %run_id, "runner stream ended");
}

/// POST to the runner with exponential backoff on connection-level
/// failures (connection refused, DNS not found). Anything else, or the
/// final failed attempt, is returned as an error.
async fn connect_with_backoff(
    http: &reqwest::Client,
    runner_url: &str,
    payload: &Value,
) -> Result<reqwest::Response, reqwest::Error> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        tokio::time::sleep(backoff_delay(attempt)).await;
        match http
            .post(runner_url)
            .header("Accept", "text/event-stream")
            .json(payload)
            .send()
            .await
        {
            Ok(response) => return Ok(response),
            Err(e) if e.is_connect() && attempt < CONNECT_MAX_ATTEMPTS => {
                debug!(attempt, error = %e, "runner not ready; retrying");
            }
            Err(e) => return Err(e),
        }
    }
}

/// POST /projects/{project}/sessions/{name}/interrupt
///
/// Forward to the runner and relay its status. The runner answers by
/// emitting a RunError event which flows through the normal event path;
/// no router state changes here.
pub async fn interrupt_session(
    State(state): State<AppState>,
    scope: ProjectScope,
    Path((_project, name)): Path<(String, String)>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    validate_session_name(&name).map_err(ApiError::bad_request)?;
    authz::require_session_access(&scope.client(), &scope.project, "update").await?;

    let url = format!("{}/interrupt", state.config.runner_url(&scope.project, &name));
    let response = state
        .http
        .post(&url)
        .timeout(INTERRUPT_TIMEOUT)
        .json(&json!({}))
        .send()
        .await
        .map_err(|e| {
            if e.is_connect() {
                ApiError::service_unavailable("runner not reachable")
            } else {
                ApiError::bad_gateway(format!("interrupt failed: {e}"))
            }
        })?;

    let status =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    Ok((status, Json(json!({"interrupted": status.is_success()}))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_is_immediate() {
        assert_eq!(backoff_delay(1), Duration::ZERO);
    }

    #[test]
    fn backoff_grows_geometrically() {
        assert_eq!(backoff_delay(2), Duration::from_millis(500));
        assert_eq!(backoff_delay(3), Duration::from_millis(750));
        assert_eq!(backoff_delay(4), Duration::from_millis(1125));
    }

    #[test]
    fn backoff_caps_at_five_seconds() {
        for attempt in 8..=CONNECT_MAX_ATTEMPTS {
            assert_eq!(backoff_delay(attempt), Duration::from_secs(5), "{attempt}");
        }
    }

    #[test]
    fn total_retry_window_is_bounded() {
        let total: Duration = (1..=CONNECT_MAX_ATTEMPTS).map(backoff_delay).sum();
        // Well under the 2-hour run ceiling.
        assert!(total < Duration::from_secs(70));
    }
}
