//! Client for the per-project content service.
//!
//! The control plane never serves workspace bytes itself; it forwards
//! list/read/write to the project's content service with the caller's
//! bearer token so access control stays with the tenant.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, warn};

use crate::api::error::{ApiError, ApiResult};
use crate::settings::ServerConfig;

/// Retries for uploads answered with 202 (service still starting).
const WRITE_RETRIES: usize = 3;
const WRITE_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Cap on upstream error bodies relayed to clients.
const UPSTREAM_BODY_CAP: usize = 512;

#[derive(Clone)]
pub struct ContentClient {
    config: Arc<ServerConfig>,
    http: reqwest::Client,
}

impl ContentClient {
    pub fn new(config: Arc<ServerConfig>, http: reqwest::Client) -> Self {
        Self { config, http }
    }

    fn url(&self, project: &str, route: &str, path: &str) -> String {
        format!(
            "{}/content/{}?path={}",
            self.config.content_url(project),
            route,
            urlencoding::encode(path)
        )
    }

    /// List entries under an absolute path in the project volume.
    pub async fn list_project_content(
        &self,
        token: &str,
        project: &str,
        abs_path: &str,
    ) -> ApiResult<Value> {
        let response = self
            .http
            .get(self.url(project, "list", abs_path))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| upstream_error(&e))?;
        let response = check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| ApiError::bad_gateway(format!("content service body: {e}")))
    }

    /// Read a file's bytes from the project volume.
    pub async fn read_project_content_file(
        &self,
        token: &str,
        project: &str,
        abs_path: &str,
    ) -> ApiResult<Bytes> {
        let response = self
            .http
            .get(self.url(project, "file", abs_path))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| upstream_error(&e))?;
        let response = check_status(response).await?;
        response
            .bytes()
            .await
            .map_err(|e| ApiError::bad_gateway(format!("content service body: {e}")))
    }

    /// Write a file into the project volume; the service creates parent
    /// directories server-side.
    pub async fn write_project_content_file(
        &self,
        token: &str,
        project: &str,
        abs_path: &str,
        bytes: Bytes,
    ) -> ApiResult<()> {
        let response = self
            .http
            .post(self.url(project, "file", abs_path))
            .bearer_auth(token)
            .body(bytes)
            .send()
            .await
            .map_err(|e| upstream_error(&e))?;
        check_status(response).await?;
        Ok(())
    }

    /// Upload variant that retries while the content service is still
    /// starting (signalled by 202).
    pub async fn write_with_retry(
        &self,
        token: &str,
        project: &str,
        abs_path: &str,
        bytes: Bytes,
    ) -> ApiResult<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let response = self
                .http
                .post(self.url(project, "file", abs_path))
                .bearer_auth(token)
                .body(bytes.clone())
                .send()
                .await
                .map_err(|e| upstream_error(&e))?;

            if response.status() == StatusCode::ACCEPTED && attempt <= WRITE_RETRIES {
                debug!(project, path = abs_path, attempt, "content service starting; retrying write");
                tokio::time::sleep(WRITE_RETRY_DELAY).await;
                continue;
            }
            check_status(response).await?;
            return Ok(());
        }
    }
}

fn upstream_error(err: &reqwest::Error) -> ApiError {
    if err.is_connect() || err.is_timeout() {
        warn!(error = %err, "content service unreachable");
        return ApiError::service_unavailable("content service unreachable");
    }
    ApiError::bad_gateway(format!("content service: {err}"))
}

async fn check_status(response: reqwest::Response) -> ApiResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let truncated: String = body.chars().take(UPSTREAM_BODY_CAP).collect();
    match status {
        StatusCode::NOT_FOUND => Err(ApiError::not_found(truncated)),
        StatusCode::FORBIDDEN => Err(ApiError::forbidden(truncated)),
        _ => Err(ApiError::bad_gateway(format!(
            "content service returned {status}: {truncated}"
        ))),
    }
}
