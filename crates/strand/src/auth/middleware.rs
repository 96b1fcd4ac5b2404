//! Request-scoped authentication extractors.

use std::collections::HashMap;

use axum::RequestPartsExt;
use axum::extract::{FromRequestParts, Path};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use kube::Client;

use super::clients::service_account_from_token;
use crate::api::error::ApiError;
use crate::api::state::AppState;

/// Header used by ingress authenticators to relay the user token.
pub const FORWARDED_TOKEN_HEADER: &str = "x-forwarded-access-token";

/// Header carrying the project when it is not a path parameter.
pub const PROJECT_HEADER: &str = "x-project-namespace";

/// Extract a Bearer token from an Authorization header value.
fn bearer_token_from_header(header_value: &str) -> Option<&str> {
    let mut parts = header_value.split_whitespace();
    let scheme = parts.next()?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = parts.next().filter(|t| !t.is_empty())?;
    if parts.next().is_some() {
        return None;
    }
    Some(token)
}

/// Pull the caller's bearer token out of request headers.
pub fn token_from_parts(parts: &Parts) -> Option<String> {
    if let Some(value) = parts.headers.get(AUTHORIZATION)
        && let Ok(value) = value.to_str()
        && let Some(token) = bearer_token_from_header(value)
    {
        return Some(token.to_string());
    }
    parts
        .headers
        .get(FORWARDED_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// The authenticated caller: their raw token and a Kubernetes client that
/// acts as them. Construction never falls back to the process identity.
#[derive(Clone)]
pub struct Identity {
    pub token: String,
    pub client: Client,
}

impl Identity {
    /// `(namespace, serviceAccountName)` when the caller is a service
    /// account. Identity labeling only.
    pub fn service_account(&self) -> Option<(String, String)> {
        service_account_from_token(&self.token)
    }
}

impl FromRequestParts<AppState> for Identity {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = token_from_parts(parts)
            .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;
        let client = state
            .kube
            .for_token(&token)
            .ok_or_else(|| ApiError::unauthorized("invalid bearer token"))?;
        Ok(Self { token, client })
    }
}

/// The authenticated caller scoped to a project namespace.
///
/// The project comes from the `project` path parameter or the
/// `X-Project-Namespace` header; absence is a 400.
#[derive(Clone)]
pub struct ProjectScope {
    pub project: String,
    pub identity: Identity,
}

impl ProjectScope {
    pub fn client(&self) -> Client {
        self.identity.client.clone()
    }

    pub fn token(&self) -> &str {
        &self.identity.token
    }
}

impl FromRequestParts<AppState> for ProjectScope {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let project = project_from_parts(parts).await?;
        let identity = Identity::from_request_parts(parts, state).await?;
        Ok(Self { project, identity })
    }
}

async fn project_from_parts(parts: &mut Parts) -> Result<String, ApiError> {
    if let Ok(Path(params)) = parts.extract::<Path<HashMap<String, String>>>().await
        && let Some(project) = params.get("project").filter(|p| !p.is_empty())
    {
        return Ok(project.clone());
    }
    parts
        .headers
        .get(PROJECT_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::bad_request("missing project namespace"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts_with_header(name: &str, value: &str) -> Parts {
        let req = Request::builder()
            .uri("/projects/demo/sessions")
            .header(name, value)
            .body(())
            .unwrap();
        req.into_parts().0
    }

    #[test]
    fn bearer_header_parsing() {
        assert_eq!(bearer_token_from_header("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token_from_header("bearer abc"), Some("abc"));
        assert_eq!(bearer_token_from_header("Basic abc"), None);
        assert_eq!(bearer_token_from_header("Bearer"), None);
        assert_eq!(bearer_token_from_header("Bearer a b"), None);
    }

    #[test]
    fn token_prefers_authorization_header() {
        let mut parts = parts_with_header("authorization", "Bearer tok-a");
        parts.headers.insert(
            FORWARDED_TOKEN_HEADER,
            "tok-b".parse().unwrap(),
        );
        assert_eq!(token_from_parts(&parts), Some("tok-a".to_string()));
    }

    #[test]
    fn token_falls_back_to_forwarded_header() {
        let parts = parts_with_header(FORWARDED_TOKEN_HEADER, "tok-b");
        assert_eq!(token_from_parts(&parts), Some("tok-b".to_string()));
    }

    #[test]
    fn absent_token_is_none() {
        let parts = parts_with_header("accept", "application/json");
        assert_eq!(token_from_parts(&parts), None);
    }
}
