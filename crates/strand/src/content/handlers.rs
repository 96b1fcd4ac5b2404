//! HTTP surface over the content gateway: generic adaptation routes and
//! session workspace delegation.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};

use super::paths::resolve_workspace_path;
use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::auth::{ProjectScope, authz};
use crate::session::validate_session_name;

#[derive(Debug, Deserialize)]
pub struct ContentQuery {
    pub path: String,
}

/// GET /content/list?path=…  (project from X-Project-Namespace)
pub async fn list_content(
    State(state): State<AppState>,
    scope: ProjectScope,
    Query(query): Query<ContentQuery>,
) -> ApiResult<Json<Value>> {
    let listing = state
        .content
        .list_project_content(scope.token(), &scope.project, &query.path)
        .await?;
    Ok(Json(listing))
}

/// GET /content/read?path=…
pub async fn read_content(
    State(state): State<AppState>,
    scope: ProjectScope,
    Query(query): Query<ContentQuery>,
) -> ApiResult<Response> {
    let bytes = state
        .content
        .read_project_content_file(scope.token(), &scope.project, &query.path)
        .await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    )
        .into_response())
}

/// POST /content/write?path=…
pub async fn write_content(
    State(state): State<AppState>,
    scope: ProjectScope,
    Query(query): Query<ContentQuery>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    state
        .content
        .write_with_retry(scope.token(), &scope.project, &query.path, body)
        .await?;
    Ok(Json(json!({"path": query.path, "written": true})))
}

/// GET /projects/{project}/sessions/{name}/workspace/{*path}
pub async fn read_workspace_file(
    State(state): State<AppState>,
    scope: ProjectScope,
    Path((_project, name, path)): Path<(String, String, String)>,
) -> ApiResult<Response> {
    validate_session_name(&name).map_err(ApiError::bad_request)?;
    authz::require_session_access(&scope.client(), &scope.project, "get").await?;
    let resolved = resolve_workspace_path(&name, &path).map_err(ApiError::bad_request)?;
    let bytes = state
        .content
        .read_project_content_file(scope.token(), &scope.project, &resolved)
        .await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    )
        .into_response())
}

/// PUT /projects/{project}/sessions/{name}/workspace/{*path}
pub async fn write_workspace_file(
    State(state): State<AppState>,
    scope: ProjectScope,
    Path((_project, name, path)): Path<(String, String, String)>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Value>)> {
    validate_session_name(&name).map_err(ApiError::bad_request)?;
    authz::require_session_access(&scope.client(), &scope.project, "update").await?;
    let resolved = resolve_workspace_path(&name, &path).map_err(ApiError::bad_request)?;
    state
        .content
        .write_with_retry(scope.token(), &scope.project, &resolved, body)
        .await?;
    Ok((StatusCode::OK, Json(json!({"path": resolved, "written": true}))))
}
