//! Workflow domain types and the repository-inheritance rules.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::crd;
use crate::nested::{get_str, get_string};

/// Workflow creation request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkflowRequest {
    pub id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub repositories: Vec<Value>,
    pub workspace_path: Option<String>,
}

/// Slim listing entry; the full CR is only returned by get.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSummary {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    pub repository_count: usize,
}

impl WorkflowSummary {
    pub fn from_object(obj: &kube::api::DynamicObject) -> Self {
        let data = &obj.data;
        Self {
            id: obj.metadata.name.clone().unwrap_or_default(),
            title: get_string(data, &["spec", "title"]).unwrap_or_default(),
            description: get_string(data, &["spec", "description"]),
            workspace_path: get_string(data, &["spec", "workspacePath"]),
            created_at: obj
                .metadata
                .creation_timestamp
                .as_ref()
                .map(|t| t.0.to_rfc3339()),
            repository_count: data
                .get("spec")
                .and_then(|s| s.get("repositories"))
                .and_then(Value::as_array)
                .map(Vec::len)
                .unwrap_or(0),
        }
    }
}

/// Default workspace path when the request leaves it empty.
pub fn default_workspace_path(id: &str) -> String {
    format!("/workflows/{id}/workspace")
}

/// Build the workflow CR body.
pub fn build_workflow_body(project: &str, id: &str, request: &CreateWorkflowRequest) -> Value {
    let workspace = request
        .workspace_path
        .clone()
        .filter(|w| !w.is_empty())
        .unwrap_or_else(|| default_workspace_path(id));
    json!({
        "apiVersion": crd::API_VERSION,
        "kind": crd::WORKFLOW_KIND,
        "metadata": {
            "name": id,
            "namespace": project,
        },
        "spec": {
            "title": request.title,
            "description": request.description,
            "repositories": request.repositories,
            "workspacePath": workspace,
            "jiraLinks": [],
        },
    })
}

/// A repository's branch defaults to `main` when unspecified.
pub fn with_default_branch(repo: &Value) -> Value {
    let mut repo = repo.clone();
    let missing = get_str(&repo, &["branch"]).filter(|b| !b.is_empty()).is_none();
    if missing && let Some(map) = repo.as_object_mut() {
        map.insert("branch".to_string(), json!("main"));
    }
    repo
}

/// Inherit a workflow's repository list into a session's gitConfig: the
/// workflow list replaces the session's `repositories` field while every
/// other gitConfig key survives.
pub fn inherit_repositories(git_config: Option<Value>, repositories: &[Value]) -> Value {
    let defaulted: Vec<Value> = repositories.iter().map(with_default_branch).collect();
    let mut config = git_config.unwrap_or_else(|| json!({}));
    if !config.is_object() {
        config = json!({});
    }
    if let Some(map) = config.as_object_mut() {
        map.insert("repositories".to_string(), Value::Array(defaulted));
    }
    config
}

/// Directory name a repository clones into, from its URL.
pub fn repo_directory_name(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let last = trimmed.rsplit('/').next().unwrap_or(trimmed);
    last.trim_end_matches(".git").to_string()
}

/// Destination of a repository inside the workflow workspace.
pub fn repo_clone_destination(workspace: &str, repo: &Value) -> String {
    if let Some(explicit) = get_str(repo, &["clonePath"]).filter(|p| !p.is_empty()) {
        return format!("{}/{}", workspace.trim_end_matches('/'), explicit.trim_matches('/'));
    }
    let name = get_str(repo, &["url"]).map(repo_directory_name).unwrap_or_default();
    format!("{}/repos/{}", workspace.trim_end_matches('/'), name)
}

/// Extract the publish title: the first `# ` heading of the document,
/// falling back to the workflow title.
pub fn extract_title(content: &str, fallback: &str) -> String {
    content
        .lines()
        .map(str::trim_start)
        .find_map(|line| line.strip_prefix("# "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

/// Update `spec.jiraLinks`: append a new `(path → key)` entry or update
/// the existing entry's key. Returns the new list and whether it changed.
pub fn upsert_jira_link(links: Option<&Value>, path: &str, key: &str) -> Vec<Value> {
    let mut links: Vec<Value> = links
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if let Some(existing) = links
        .iter_mut()
        .find(|l| get_str(l, &["path"]) == Some(path))
    {
        if let Some(map) = existing.as_object_mut() {
            map.insert("jiraKey".to_string(), json!(key));
        }
    } else {
        links.push(json!({"path": path, "jiraKey": key}));
    }
    links
}
