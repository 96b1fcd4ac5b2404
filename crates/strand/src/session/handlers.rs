//! HTTP handlers for the session lifecycle.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::credentials;
use super::types::{
    CreateSessionRequest, LlmSettings, Phase, SessionSummary, build_session_body,
    filter_status_update, generated_session_name, merge_git_config, paginate,
    validate_session_name,
};
use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::auth::{ProjectScope, authz};
use crate::crd;
use crate::nested::{get_nested, get_str};

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub search: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionList {
    pub sessions: Vec<SessionSummary>,
    pub total: usize,
}

/// GET /projects/{project}/sessions
pub async fn list_sessions(
    State(_state): State<AppState>,
    scope: ProjectScope,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<SessionList>> {
    authz::require_session_access(&scope.client(), &scope.project, "list").await?;
    let api = crd::sessions(scope.client(), &scope.project);
    let list = api.list(&ListParams::default()).await?;

    let search = query.search.unwrap_or_default();
    let mut sessions: Vec<SessionSummary> = list
        .items
        .iter()
        .map(SessionSummary::from_object)
        .filter(|s| s.matches_search(&search))
        .collect();
    sessions.sort_by(|a, b| a.name.cmp(&b.name));
    let total = sessions.len();
    let sessions = paginate(sessions, query.limit, query.offset);
    Ok(Json(SessionList { sessions, total }))
}

#[derive(Debug, Serialize)]
pub struct CreatedSession {
    pub name: String,
    pub uid: String,
}

/// POST /projects/{project}/sessions
pub async fn create_session(
    State(state): State<AppState>,
    scope: ProjectScope,
    Json(request): Json<CreateSessionRequest>,
) -> ApiResult<(StatusCode, Json<CreatedSession>)> {
    if request.prompt.trim().is_empty() {
        return Err(ApiError::bad_request("prompt must not be empty"));
    }
    let name = match &request.name {
        Some(name) => {
            validate_session_name(name).map_err(ApiError::bad_request)?;
            name.clone()
        }
        None => generated_session_name(),
    };

    let llm = LlmSettings::merged(request.llm_settings.clone());
    let git_defaults = load_git_defaults(&state, &scope).await;
    let git_config = merge_git_config(git_defaults, request.git_config.clone());

    let body = build_session_body(&scope.project, &name, &request, &llm, git_config);
    let object: kube::api::DynamicObject =
        serde_json::from_value(body).map_err(|e| ApiError::internal(e.to_string()))?;

    // The create itself runs as the caller; a 403 here means the caller
    // was never allowed to create sessions and nothing else happens.
    let api = crd::sessions(scope.client(), &scope.project);
    let created = api.create(&PostParams::default(), &object).await?;
    let uid = created.metadata.uid.clone().unwrap_or_default();

    // Credential provisioning is best effort and must not hang the
    // create response on transient TokenRequest trouble.
    credentials::provision_best_effort(&state.kube, &scope.project, &created).await;

    Ok((
        StatusCode::CREATED,
        Json(CreatedSession { name, uid }),
    ))
}

/// Project-level Git defaults from the well-known ConfigMap. Missing
/// ConfigMap or malformed payload simply yields no defaults.
async fn load_git_defaults(state: &AppState, scope: &ProjectScope) -> Option<Value> {
    let api: Api<ConfigMap> = Api::namespaced(scope.client(), &scope.project);
    let cm = api.get(&state.config.git_defaults_configmap).await.ok()?;
    let raw = cm.data?.remove("gitConfig")?;
    serde_json::from_str(&raw).ok()
}

/// GET /projects/{project}/sessions/{name}
pub async fn get_session(
    State(_state): State<AppState>,
    scope: ProjectScope,
    Path((_project, name)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    validate_session_name(&name).map_err(ApiError::bad_request)?;
    authz::require_session_access(&scope.client(), &scope.project, "get").await?;
    let api = crd::sessions(scope.client(), &scope.project);
    let object = api.get(&name).await?;
    Ok(Json(serde_json::to_value(&object).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSessionRequest {
    #[serde(flatten)]
    pub spec: serde_json::Map<String, Value>,
}

/// PUT /projects/{project}/sessions/{name}
pub async fn update_session(
    State(_state): State<AppState>,
    scope: ProjectScope,
    Path((_project, name)): Path<(String, String)>,
    Json(request): Json<UpdateSessionRequest>,
) -> ApiResult<Json<Value>> {
    validate_session_name(&name).map_err(ApiError::bad_request)?;
    authz::require_session_access(&scope.client(), &scope.project, "update").await?;
    if request.spec.is_empty() {
        return Err(ApiError::bad_request("no spec fields to update"));
    }
    let api = crd::sessions(scope.client(), &scope.project);
    let patch = json!({ "spec": request.spec });
    let updated = api
        .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(Json(serde_json::to_value(&updated).unwrap_or_default()))
}

/// DELETE /projects/{project}/sessions/{name}
pub async fn delete_session(
    State(_state): State<AppState>,
    scope: ProjectScope,
    Path((_project, name)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    validate_session_name(&name).map_err(ApiError::bad_request)?;
    authz::require_session_access(&scope.client(), &scope.project, "delete").await?;
    let api = crd::sessions(scope.client(), &scope.project);
    api.delete(&name, &DeleteParams::default()).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn current_phase(object: &kube::api::DynamicObject) -> Phase {
    get_str(&object.data, &["status", "phase"])
        .and_then(|p| p.parse().ok())
        .unwrap_or(Phase::Pending)
}

/// POST /projects/{project}/sessions/{name}/start
pub async fn start_session(
    State(_state): State<AppState>,
    scope: ProjectScope,
    Path((_project, name)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    validate_session_name(&name).map_err(ApiError::bad_request)?;
    authz::require_session_access(&scope.client(), &scope.project, "update").await?;
    let api = crd::sessions(scope.client(), &scope.project);
    let object = api.get(&name).await?;

    match current_phase(&object) {
        // Idempotent: already running is a no-op.
        Phase::Running => {
            return Ok(Json(json!({"name": name, "phase": Phase::Running})));
        }
        Phase::Stopped => {
            return Err(ApiError::conflict("session is stopped and cannot restart"));
        }
        _ => {}
    }

    let patch = json!({
        "status": {
            "phase": Phase::Running,
            "startTime": chrono::Utc::now().to_rfc3339(),
        }
    });
    api.patch_subresource(&name, "status", &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(Json(json!({"name": name, "phase": Phase::Running})))
}

/// POST /projects/{project}/sessions/{name}/stop
pub async fn stop_session(
    State(_state): State<AppState>,
    scope: ProjectScope,
    Path((_project, name)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    validate_session_name(&name).map_err(ApiError::bad_request)?;
    authz::require_session_access(&scope.client(), &scope.project, "update").await?;
    let api = crd::sessions(scope.client(), &scope.project);
    let object = api.get(&name).await?;

    if current_phase(&object) == Phase::Stopped {
        return Ok(Json(json!({"name": name, "phase": Phase::Stopped})));
    }

    let patch = json!({
        "status": {
            "phase": Phase::Stopped,
            "completionTime": chrono::Utc::now().to_rfc3339(),
        }
    });
    api.patch_subresource(&name, "status", &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(Json(json!({"name": name, "phase": Phase::Stopped})))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneSessionRequest {
    pub name: Option<String>,
    pub display_name: Option<String>,
    /// Target project for cross-project clones.
    pub target_project: Option<String>,
}

/// POST /projects/{project}/sessions/{name}/clone
pub async fn clone_session(
    State(_state): State<AppState>,
    scope: ProjectScope,
    Path((_project, name)): Path<(String, String)>,
    Json(request): Json<CloneSessionRequest>,
) -> ApiResult<(StatusCode, Json<CreatedSession>)> {
    validate_session_name(&name).map_err(ApiError::bad_request)?;
    let target_name = match &request.name {
        Some(target) => {
            validate_session_name(target).map_err(ApiError::bad_request)?;
            target.clone()
        }
        None => generated_session_name(),
    };
    let target_project = request
        .target_project
        .clone()
        .unwrap_or_else(|| scope.project.clone());

    if target_project != scope.project {
        // Cross-project: the caller must be allowed to create sessions in
        // the target namespace before anything is written there.
        authz::require_session_access(&scope.client(), &target_project, "create").await?;
    }

    let source_api = crd::sessions(scope.client(), &scope.project);
    let source = source_api.get(&name).await?;

    // Deep-copy the spec, overwrite identity, reset status.
    let mut spec = get_nested(&source.data, &["spec"]).cloned().unwrap_or(json!({}));
    if let Some(display_name) = request.display_name.as_deref().filter(|d| !d.is_empty()) {
        spec["displayName"] = json!(display_name);
    }
    let body = json!({
        "apiVersion": crd::API_VERSION,
        "kind": crd::SESSION_KIND,
        "metadata": {
            "name": target_name,
            "namespace": target_project,
        },
        "spec": spec,
        "status": { "phase": Phase::Pending },
    });
    let object: kube::api::DynamicObject =
        serde_json::from_value(body).map_err(|e| ApiError::internal(e.to_string()))?;

    let target_api = crd::sessions(scope.client(), &target_project);
    let created = target_api.create(&PostParams::default(), &object).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreatedSession {
            name: target_name,
            uid: created.metadata.uid.unwrap_or_default(),
        }),
    ))
}

/// PUT /projects/{project}/sessions/{name}/status
///
/// The runner's only write path. Only whitelisted keys pass; phase
/// changes must respect the monotone transition rule.
pub async fn update_status(
    State(_state): State<AppState>,
    scope: ProjectScope,
    Path((_project, name)): Path<(String, String)>,
    Json(update): Json<Value>,
) -> ApiResult<Json<Value>> {
    validate_session_name(&name).map_err(ApiError::bad_request)?;
    authz::require_session_access(&scope.client(), &scope.project, "update").await?;
    let filtered = filter_status_update(&update);
    if filtered.is_empty() {
        return Err(ApiError::bad_request("no recognized status fields"));
    }

    let api = crd::sessions(scope.client(), &scope.project);

    if let Some(next) = filtered.get("phase").and_then(Value::as_str) {
        let next: Phase = next
            .parse()
            .map_err(|e: String| ApiError::bad_request(e))?;
        let object = api.get(&name).await?;
        let current = current_phase(&object);
        if !current.can_transition_to(next) {
            return Err(ApiError::conflict(format!(
                "phase may not transition from {current} to {next}"
            )));
        }
    }

    let patch = json!({ "status": filtered });
    api.patch_subresource(&name, "status", &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(Json(json!({"name": name, "updated": true})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayNameRequest {
    pub display_name: String,
}

/// PUT /projects/{project}/sessions/{name}/displayName
pub async fn update_display_name(
    State(_state): State<AppState>,
    scope: ProjectScope,
    Path((_project, name)): Path<(String, String)>,
    Json(request): Json<DisplayNameRequest>,
) -> ApiResult<Json<Value>> {
    validate_session_name(&name).map_err(ApiError::bad_request)?;
    authz::require_session_access(&scope.client(), &scope.project, "update").await?;
    if request.display_name.trim().is_empty() {
        return Err(ApiError::bad_request("displayName must not be empty"));
    }
    let api = crd::sessions(scope.client(), &scope.project);
    let patch = json!({ "spec": { "displayName": request.display_name } });
    api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(Json(json!({"name": name, "displayName": request.display_name})))
}

/// Set a session's displayName only when it is still empty. Used by the
/// auto-name heuristic; races lose silently.
pub async fn set_display_name_if_empty(
    client: kube::Client,
    project: &str,
    name: &str,
    display_name: &str,
) -> anyhow::Result<bool> {
    let api = crd::sessions(client, project);
    let object = api.get(name).await?;
    if get_str(&object.data, &["spec", "displayName"]).is_some_and(|d| !d.is_empty()) {
        return Ok(false);
    }
    let patch = json!({ "spec": { "displayName": display_name } });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(true)
}
