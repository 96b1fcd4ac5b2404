//! Per-user Git credential lifecycle.
//!
//! Users connect a GitLab token which is stored in a project-scoped
//! secret via their own client; sessions reference it through gitConfig.
//! The token value itself never reaches a log line.

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use crate::api::error::{ApiError, ApiResult, is_already_exists};
use crate::api::state::AppState;
use crate::auth::ProjectScope;

/// Header the ingress authenticator relays the username in.
const FORWARDED_USER_HEADER: &str = "x-forwarded-user";

/// Reduce an external username to a DNS-label-safe secret suffix.
pub fn sanitize_user(user: &str) -> String {
    let mut out: String = user
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '-'
            }
        })
        .collect();
    out.truncate(40);
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "default".to_string()
    } else {
        trimmed.to_string()
    }
}

fn secret_name(user: &str) -> String {
    format!("gitlab-creds-{}", sanitize_user(user))
}

fn caller_user(headers: &HeaderMap, scope: &ProjectScope) -> String {
    if let Some(user) = headers
        .get(FORWARDED_USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return user.to_string();
    }
    scope
        .identity
        .service_account()
        .map(|(_, name)| name)
        .unwrap_or_else(|| "default".to_string())
}

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub token: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
}

/// POST /auth/gitlab/connect
pub async fn connect(
    State(_state): State<AppState>,
    scope: ProjectScope,
    headers: HeaderMap,
    Json(request): Json<ConnectRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if request.token.trim().is_empty() {
        return Err(ApiError::bad_request("token must not be empty"));
    }
    let user = caller_user(&headers, &scope);
    let name = secret_name(&user);

    let mut string_data = std::collections::BTreeMap::new();
    string_data.insert("token".to_string(), request.token);
    if let Some(username) = request.username.filter(|u| !u.is_empty()) {
        string_data.insert("username".to_string(), username);
    }
    if let Some(host) = request.host.filter(|h| !h.is_empty()) {
        string_data.insert("host".to_string(), host);
    }

    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(scope.project.clone()),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(string_data),
        ..Default::default()
    };

    let secrets: Api<Secret> = Api::namespaced(scope.client(), &scope.project);
    match secrets.create(&PostParams::default(), &secret).await {
        Ok(_) => {}
        Err(e) if is_already_exists(&e) => {
            // Reconnect: merge the fresh credentials over the old secret.
            let patch = serde_json::json!({"stringData": secret.string_data});
            secrets
                .patch(
                    &name,
                    &kube::api::PatchParams::default(),
                    &kube::api::Patch::Merge(&patch),
                )
                .await?;
        }
        Err(e) => return Err(e.into()),
    }

    info!(project = %scope.project, secret = %name, "stored git credentials");
    Ok((
        StatusCode::CREATED,
        Json(json!({"connected": true, "secretName": name})),
    ))
}

/// POST /auth/gitlab/disconnect
pub async fn disconnect(
    State(_state): State<AppState>,
    scope: ProjectScope,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let user = caller_user(&headers, &scope);
    let secrets: Api<Secret> = Api::namespaced(scope.client(), &scope.project);
    secrets
        .delete(&secret_name(&user), &DeleteParams::default())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /auth/gitlab/status
pub async fn status(
    State(_state): State<AppState>,
    scope: ProjectScope,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let user = caller_user(&headers, &scope);
    let secrets: Api<Secret> = Api::namespaced(scope.client(), &scope.project);
    match secrets.get(&secret_name(&user)).await {
        Ok(secret) => {
            let username = secret
                .data
                .as_ref()
                .and_then(|d| d.get("username"))
                .and_then(|v| String::from_utf8(v.0.clone()).ok());
            Ok(Json(json!({"connected": true, "username": username})))
        }
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(Json(json!({"connected": false}))),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_handles_emails_and_case() {
        assert_eq!(sanitize_user("Alice@Example.com"), "alice-example-com");
        assert_eq!(sanitize_user("bob"), "bob");
        assert_eq!(sanitize_user("--weird--"), "weird");
        assert_eq!(sanitize_user("!!!"), "default");
    }

    #[test]
    fn sanitize_caps_length() {
        let long = "u".repeat(100);
        assert!(sanitize_user(&long).len() <= 40);
    }

    #[test]
    fn secret_names_are_stable() {
        assert_eq!(secret_name("Alice"), "gitlab-creds-alice");
    }
}
