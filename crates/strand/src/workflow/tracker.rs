//! External issue-tracker publishing.
//!
//! Workspace files can be published as issues in a Jira-compatible
//! tracker. Credentials live in a project-scoped secret (default
//! `runner-secrets`, overridable through the ProjectSettings CR).

use k8s_openapi::api::core::v1::Secret;
use kube::Client;
use kube::api::Api;
use serde_json::{Value, json};
use tracing::debug;

use crate::api::error::{ApiError, ApiResult};
use crate::crd;
use crate::nested::{get_str, get_string};

/// Secret keys the tracker credentials are read from.
const URL_KEY: &str = "JIRA_URL";
const TOKEN_KEY: &str = "JIRA_API_TOKEN";
const PROJECT_KEY: &str = "JIRA_PROJECT";

#[derive(Debug, Clone)]
pub struct TrackerCredentials {
    pub base_url: String,
    pub token: String,
    pub project_key: Option<String>,
}

impl TrackerCredentials {
    pub fn browse_url(&self, key: &str) -> String {
        format!("{}/browse/{}", self.base_url.trim_end_matches('/'), key)
    }
}

/// Name of the credentials secret: the ProjectSettings CR may override
/// the configured default.
async fn secret_name(client: &Client, project: &str, default_name: &str) -> String {
    match crd::project_settings(client.clone(), project).get("default").await {
        Ok(settings) => get_string(&settings.data, &["spec", "runnerSecretsName"])
            .unwrap_or_else(|| default_name.to_string()),
        Err(e) => {
            debug!(project, error = %e, "no project settings; using default secret name");
            default_name.to_string()
        }
    }
}

/// Load tracker credentials from the project's secret. The secret value
/// bytes never reach a log line.
pub async fn load_credentials(
    client: &Client,
    project: &str,
    default_secret: &str,
) -> ApiResult<TrackerCredentials> {
    let name = secret_name(client, project, default_secret).await;
    let secrets: Api<Secret> = Api::namespaced(client.clone(), project);
    let secret = secrets.get(&name).await?;
    let data = secret.data.unwrap_or_default();

    let read = |key: &str| -> Option<String> {
        data.get(key)
            .and_then(|v| String::from_utf8(v.0.clone()).ok())
            .filter(|s| !s.is_empty())
    };
    let base_url = read(URL_KEY)
        .ok_or_else(|| ApiError::bad_request(format!("secret {name} has no {URL_KEY}")))?;
    let token = read(TOKEN_KEY)
        .ok_or_else(|| ApiError::bad_request(format!("secret {name} has no {TOKEN_KEY}")))?;
    Ok(TrackerCredentials {
        base_url,
        token,
        project_key: read(PROJECT_KEY),
    })
}

/// The JSON payload for a create or update call.
pub fn issue_payload(credentials: &TrackerCredentials, title: &str, body: &str) -> Value {
    let mut fields = json!({
        "summary": title,
        "description": body,
        "issuetype": {"name": "Task"},
    });
    if let Some(project_key) = &credentials.project_key {
        fields["project"] = json!({"key": project_key});
    }
    json!({"fields": fields})
}

/// Create a new issue; returns its key.
pub async fn create_issue(
    http: &reqwest::Client,
    credentials: &TrackerCredentials,
    title: &str,
    body: &str,
) -> ApiResult<String> {
    let url = format!(
        "{}/rest/api/2/issue",
        credentials.base_url.trim_end_matches('/')
    );
    let response = http
        .post(&url)
        .bearer_auth(&credentials.token)
        .json(&issue_payload(credentials, title, body))
        .send()
        .await
        .map_err(|e| ApiError::bad_gateway(format!("tracker unreachable: {e}")))?;
    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let truncated: String = text.chars().take(512).collect();
        return Err(ApiError::bad_gateway(format!(
            "tracker returned {status}: {truncated}"
        )));
    }
    let created: Value = response
        .json()
        .await
        .map_err(|e| ApiError::bad_gateway(format!("tracker body: {e}")))?;
    get_str(&created, &["key"])
        .map(str::to_string)
        .ok_or_else(|| ApiError::bad_gateway("tracker response had no issue key"))
}

/// Update an existing issue in place.
pub async fn update_issue(
    http: &reqwest::Client,
    credentials: &TrackerCredentials,
    key: &str,
    title: &str,
    body: &str,
) -> ApiResult<()> {
    let url = format!(
        "{}/rest/api/2/issue/{}",
        credentials.base_url.trim_end_matches('/'),
        key
    );
    let response = http
        .put(&url)
        .bearer_auth(&credentials.token)
        .json(&issue_payload(credentials, title, body))
        .send()
        .await
        .map_err(|e| ApiError::bad_gateway(format!("tracker unreachable: {e}")))?;
    if !response.status().is_success() {
        let status = response.status();
        return Err(ApiError::bad_gateway(format!("tracker returned {status}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> TrackerCredentials {
        TrackerCredentials {
            base_url: "https://issues.example.com/".to_string(),
            token: "secret".to_string(),
            project_key: Some("PROJ".to_string()),
        }
    }

    #[test]
    fn browse_url_normalizes_slash() {
        assert_eq!(
            credentials().browse_url("PROJ-7"),
            "https://issues.example.com/browse/PROJ-7"
        );
    }

    #[test]
    fn payload_includes_project_when_known() {
        let payload = issue_payload(&credentials(), "Title", "Body");
        assert_eq!(payload["fields"]["summary"], "Title");
        assert_eq!(payload["fields"]["project"]["key"], "PROJ");

        let mut anonymous = credentials();
        anonymous.project_key = None;
        let payload = issue_payload(&anonymous, "Title", "Body");
        assert!(payload["fields"].get("project").is_none());
    }
}
