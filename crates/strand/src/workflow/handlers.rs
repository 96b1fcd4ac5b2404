//! HTTP handlers for workflows: CRUD, session linkage, and publishing.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use serde::Deserialize;
use serde_json::{Value, json};

use super::seed::seed_workspace;
use super::tracker;
use super::types::{
    CreateWorkflowRequest, WorkflowSummary, build_workflow_body, extract_title,
    inherit_repositories, upsert_jira_link,
};
use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::auth::{ProjectScope, authz};
use crate::crd;
use crate::nested::{get_array, get_nested, get_str, get_string};
use crate::session::validate_session_name;

fn generated_workflow_id() -> String {
    format!("wf-{}", chrono::Utc::now().timestamp())
}

/// POST /projects/{project}/workflows
pub async fn create_workflow(
    State(state): State<AppState>,
    scope: ProjectScope,
    Json(request): Json<CreateWorkflowRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if request.title.trim().is_empty() {
        return Err(ApiError::bad_request("title must not be empty"));
    }
    let id = match &request.id {
        Some(id) => {
            validate_session_name(id).map_err(ApiError::bad_request)?;
            id.clone()
        }
        None => generated_workflow_id(),
    };

    let body = build_workflow_body(&scope.project, &id, &request);
    let object: kube::api::DynamicObject =
        serde_json::from_value(body).map_err(|e| ApiError::internal(e.to_string()))?;
    let api = crd::workflows(scope.client(), &scope.project);
    let created = api.create(&PostParams::default(), &object).await?;

    // Workspace seeding is a creation side-effect, detached and best
    // effort: clone or template trouble never fails the create.
    let workspace = get_string(&created.data, &["spec", "workspacePath"])
        .unwrap_or_else(|| super::types::default_workspace_path(&id));
    let repositories = request.repositories.clone();
    let http = state.http.clone();
    let content = state.content.clone();
    let config = state.config.clone();
    let token = scope.token().to_string();
    let project = scope.project.clone();
    tokio::spawn(async move {
        seed_workspace(
            &http,
            &content,
            &config,
            &token,
            &project,
            &workspace,
            &repositories,
        )
        .await;
    });

    Ok((
        StatusCode::CREATED,
        Json(json!({"id": id, "uid": created.metadata.uid.unwrap_or_default()})),
    ))
}

/// GET /projects/{project}/workflows — slim summaries only.
pub async fn list_workflows(
    State(_state): State<AppState>,
    scope: ProjectScope,
) -> ApiResult<Json<Value>> {
    let api = crd::workflows(scope.client(), &scope.project);
    let list = api.list(&ListParams::default()).await?;
    let workflows: Vec<WorkflowSummary> =
        list.items.iter().map(WorkflowSummary::from_object).collect();
    Ok(Json(json!({"workflows": workflows})))
}

/// GET /projects/{project}/workflows/{id}
pub async fn get_workflow(
    State(_state): State<AppState>,
    scope: ProjectScope,
    Path((_project, id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let api = crd::workflows(scope.client(), &scope.project);
    let object = api.get(&id).await?;
    Ok(Json(serde_json::to_value(&object).unwrap_or_default()))
}

/// DELETE /projects/{project}/workflows/{id}
///
/// Sessions stay: the linkage is loose, by label only.
pub async fn delete_workflow(
    State(_state): State<AppState>,
    scope: ProjectScope,
    Path((_project, id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let api = crd::workflows(scope.client(), &scope.project);
    api.delete(&id, &DeleteParams::default()).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachSessionRequest {
    pub session_name: String,
    pub phase: Option<String>,
}

/// POST /projects/{project}/workflows/{id}/sessions
///
/// Labels the session into the workflow and inherits the workflow's
/// repository list into the session's gitConfig.
pub async fn attach_session(
    State(_state): State<AppState>,
    scope: ProjectScope,
    Path((_project, workflow_id)): Path<(String, String)>,
    Json(request): Json<AttachSessionRequest>,
) -> ApiResult<Json<Value>> {
    validate_session_name(&request.session_name).map_err(ApiError::bad_request)?;
    authz::require_session_access(&scope.client(), &scope.project, "update").await?;

    let workflows = crd::workflows(scope.client(), &scope.project);
    let workflow = workflows.get(&workflow_id).await?;
    let repositories = get_array(&workflow.data, &["spec", "repositories"])
        .cloned()
        .unwrap_or_default();

    let sessions = crd::sessions(scope.client(), &scope.project);
    let session = sessions.get(&request.session_name).await?;
    let git_config = get_nested(&session.data, &["spec", "gitConfig"]).cloned();
    let merged = inherit_repositories(git_config, &repositories);

    let mut labels = json!({
        crd::PROJECT_LABEL: scope.project,
        crd::WORKFLOW_LABEL: workflow_id,
    });
    if let Some(phase) = request.phase.as_deref().filter(|p| !p.is_empty()) {
        labels[crd::PHASE_LABEL] = json!(phase);
    }

    let patch = json!({
        "metadata": {"labels": labels},
        "spec": {"gitConfig": merged},
    });
    sessions
        .patch(
            &request.session_name,
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;

    Ok(Json(json!({
        "workflow": workflow_id,
        "session": request.session_name,
        "attached": true,
    })))
}

/// DELETE /projects/{project}/workflows/{id}/sessions/{name}
pub async fn detach_session(
    State(_state): State<AppState>,
    scope: ProjectScope,
    Path((_project, workflow_id, session_name)): Path<(String, String, String)>,
) -> ApiResult<Json<Value>> {
    validate_session_name(&session_name).map_err(ApiError::bad_request)?;
    authz::require_session_access(&scope.client(), &scope.project, "update").await?;

    let sessions = crd::sessions(scope.client(), &scope.project);
    // Merge-patching a label to null removes it.
    let patch = json!({
        "metadata": {
            "labels": {
                crd::WORKFLOW_LABEL: Value::Null,
                crd::PHASE_LABEL: Value::Null,
            }
        }
    });
    sessions
        .patch(&session_name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;

    Ok(Json(json!({
        "workflow": workflow_id,
        "session": session_name,
        "attached": false,
    })))
}

/// GET /projects/{project}/workflows/{id}/sessions
pub async fn list_workflow_sessions(
    State(_state): State<AppState>,
    scope: ProjectScope,
    Path((_project, workflow_id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let sessions = crd::sessions(scope.client(), &scope.project);
    let params = ListParams::default().labels(&format!("{}={}", crd::WORKFLOW_LABEL, workflow_id));
    let list = sessions.list(&params).await?;
    let names: Vec<Value> = list
        .items
        .iter()
        .map(|s| {
            json!({
                "name": s.metadata.name.clone().unwrap_or_default(),
                "phase": s.metadata.labels.as_ref().and_then(|l| l.get(crd::PHASE_LABEL).cloned()),
            })
        })
        .collect();
    Ok(Json(json!({"sessions": names})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    /// Path of the file inside the workflow workspace.
    pub path: String,
}

/// POST /projects/{project}/workflows/{id}/publish
///
/// Publish a workspace file to the external tracker: create on first
/// publish, update on subsequent ones, tracked through `spec.jiraLinks`.
pub async fn publish_file(
    State(state): State<AppState>,
    scope: ProjectScope,
    Path((_project, workflow_id)): Path<(String, String)>,
    Json(request): Json<PublishRequest>,
) -> ApiResult<Json<Value>> {
    if request.path.trim().is_empty() || request.path.contains("..") {
        return Err(ApiError::bad_request("invalid workspace path"));
    }

    let workflows = crd::workflows(scope.client(), &scope.project);
    let workflow = workflows.get(&workflow_id).await?;
    let workspace = get_string(&workflow.data, &["spec", "workspacePath"])
        .unwrap_or_else(|| super::types::default_workspace_path(&workflow_id));
    let fallback_title = get_string(&workflow.data, &["spec", "title"]).unwrap_or_default();

    let file_path = format!(
        "{}/{}",
        workspace.trim_end_matches('/'),
        request.path.trim_start_matches('/')
    );
    let bytes = state
        .content
        .read_project_content_file(scope.token(), &scope.project, &file_path)
        .await?;
    let body = String::from_utf8_lossy(&bytes).into_owned();
    let title = extract_title(&body, &fallback_title);

    let client = scope.client();
    let credentials =
        tracker::load_credentials(&client, &scope.project, &state.config.runner_secrets_name)
            .await?;

    let links = get_nested(&workflow.data, &["spec", "jiraLinks"]);
    let existing_key = links
        .and_then(Value::as_array)
        .and_then(|list| {
            list.iter()
                .find(|l| get_str(l, &["path"]) == Some(request.path.as_str()))
        })
        .and_then(|l| get_str(l, &["jiraKey"]))
        .map(str::to_string);

    let key = match existing_key {
        Some(key) => {
            tracker::update_issue(&state.http, &credentials, &key, &title, &body).await?;
            key
        }
        None => tracker::create_issue(&state.http, &credentials, &title, &body).await?,
    };

    let updated_links = upsert_jira_link(links, &request.path, &key);
    let patch = json!({"spec": {"jiraLinks": updated_links}});
    workflows
        .patch(&workflow_id, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;

    Ok(Json(json!({
        "key": key,
        "url": credentials.browse_url(&key),
    })))
}

#[derive(Debug, Deserialize)]
pub struct LinkedIssueQuery {
    pub path: String,
}

/// GET /projects/{project}/workflows/{id}/issues?path=…
pub async fn get_linked_issue(
    State(_state): State<AppState>,
    scope: ProjectScope,
    Path((_project, workflow_id)): Path<(String, String)>,
    Query(query): Query<LinkedIssueQuery>,
) -> ApiResult<Json<Value>> {
    let workflows = crd::workflows(scope.client(), &scope.project);
    let workflow = workflows.get(&workflow_id).await?;
    let link = get_array(&workflow.data, &["spec", "jiraLinks"])
        .and_then(|list| {
            list.iter()
                .find(|l| get_str(l, &["path"]) == Some(query.path.as_str()))
        })
        .cloned()
        .ok_or_else(|| ApiError::not_found(format!("no issue linked to {}", query.path)))?;
    Ok(Json(link))
}
