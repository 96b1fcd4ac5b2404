//! Session domain types: phases, name validation, request shapes, and the
//! merge rules applied at creation time.

use std::collections::BTreeMap;

use chrono::Utc;
use kube::api::DynamicObject;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::crd;
use crate::nested::{get_nested, get_str};

/// Session lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Pending,
    Creating,
    Running,
    Completed,
    Failed,
    Stopped,
    Error,
}

impl Phase {
    /// Rank used for the monotonicity rule. Terminal phases share a rank.
    fn rank(self) -> u8 {
        match self {
            Phase::Pending => 0,
            Phase::Creating => 1,
            Phase::Running => 2,
            Phase::Completed | Phase::Failed | Phase::Stopped => 3,
            Phase::Error => 3,
        }
    }

    /// Phase transitions are monotone, except Running→Stopped and
    /// any→Error which are always permitted.
    pub fn can_transition_to(self, next: Phase) -> bool {
        if next == Phase::Error {
            return true;
        }
        if self == Phase::Running && next == Phase::Stopped {
            return true;
        }
        next.rank() >= self.rank()
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Pending => "Pending",
            Phase::Creating => "Creating",
            Phase::Running => "Running",
            Phase::Completed => "Completed",
            Phase::Failed => "Failed",
            Phase::Stopped => "Stopped",
            Phase::Error => "Error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Phase::Pending),
            "Creating" => Ok(Phase::Creating),
            "Running" => Ok(Phase::Running),
            "Completed" => Ok(Phase::Completed),
            "Failed" => Ok(Phase::Failed),
            "Stopped" => Ok(Phase::Stopped),
            "Error" => Ok(Phase::Error),
            other => Err(format!("unknown phase: {other}")),
        }
    }
}

/// Validate a session name: DNS label grammar, length cap, and no path
/// traversal (names become state-directory components).
pub fn validate_session_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("name must not be empty".to_string());
    }
    if name.len() > 63 {
        return Err("name must be at most 63 characters".to_string());
    }
    if name.contains("..") || name.contains('/') || name.contains('\\') {
        return Err("name must not contain path separators".to_string());
    }
    let bytes = name.as_bytes();
    let valid_inner = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-';
    let valid_edge = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !valid_edge(bytes[0]) || !valid_edge(bytes[bytes.len() - 1]) {
        return Err("name must start and end with a lowercase letter or digit".to_string());
    }
    if !bytes.iter().copied().all(valid_inner) {
        return Err("name may only contain lowercase letters, digits, and dashes".to_string());
    }
    Ok(())
}

/// Generate a session name from the creation timestamp.
pub fn generated_session_name() -> String {
    format!("session-{}", Utc::now().timestamp())
}

/// LLM selector with the documented defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmSettings {
    pub model: String,
    pub temperature: f64,
    pub max_tokens: i64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            model: "sonnet".to_string(),
            temperature: 0.7,
            max_tokens: 4000,
        }
    }
}

/// Partial LLM settings as supplied by the caller.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmSettingsPatch {
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<i64>,
}

impl LlmSettings {
    /// Merge caller-supplied settings over the defaults.
    pub fn merged(patch: Option<LlmSettingsPatch>) -> Self {
        let mut settings = Self::default();
        if let Some(patch) = patch {
            if let Some(model) = patch.model.filter(|m| !m.is_empty()) {
                settings.model = model;
            }
            if let Some(temperature) = patch.temperature {
                settings.temperature = temperature;
            }
            if let Some(max_tokens) = patch.max_tokens {
                settings.max_tokens = max_tokens;
            }
        }
        settings
    }
}

/// Merge a request-supplied git config over project defaults,
/// field-by-field: request values win wherever both are present, objects
/// merge recursively, and everything else from the defaults survives.
pub fn merge_git_config(defaults: Option<Value>, request: Option<Value>) -> Option<Value> {
    match (defaults, request) {
        (None, None) => None,
        (Some(d), None) => Some(d),
        (None, Some(r)) => Some(r),
        (Some(d), Some(r)) => Some(deep_merge(d, r)),
    }
}

fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.remove(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        base_map.insert(key, deep_merge(existing, value));
                    }
                    _ => {
                        base_map.insert(key, value);
                    }
                }
            }
            Value::Object(base_map)
        }
        (_, overlay) => overlay,
    }
}

/// Keys the runner may write through the status subresource. Everything
/// else is silently dropped.
pub const STATUS_UPDATE_KEYS: &[&str] = &[
    "phase",
    "message",
    "completionTime",
    "subtype",
    "duration_ms",
    "duration_api_ms",
    "is_error",
    "num_turns",
    "session_id",
    "total_cost_usd",
    "usage",
    "result",
];

/// Filter a runner status update down to the whitelisted keys.
pub fn filter_status_update(update: &Value) -> serde_json::Map<String, Value> {
    let mut filtered = serde_json::Map::new();
    if let Some(map) = update.as_object() {
        for (key, value) in map {
            if STATUS_UPDATE_KEYS.contains(&key.as_str()) {
                filtered.insert(key.clone(), value.clone());
            }
        }
    }
    filtered
}

/// Derive a display name from the first real user message of a session.
/// Used by the auto-name heuristic when displayName is still empty.
pub fn derive_display_name(prompt: &str) -> Option<String> {
    let first_line = prompt.lines().find(|l| !l.trim().is_empty())?.trim();
    if first_line.is_empty() {
        return None;
    }
    let mut name: String = first_line.chars().take(50).collect();
    if first_line.chars().count() > 50 {
        name = name.trim_end().to_string();
        name.push('…');
    }
    Some(name)
}

/// Session creation request body.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub prompt: String,
    pub name: Option<String>,
    pub display_name: Option<String>,
    pub llm_settings: Option<LlmSettingsPatch>,
    pub timeout: Option<i64>,
    #[serde(default)]
    pub interactive: Option<bool>,
    pub git_config: Option<Value>,
    pub resource_overrides: Option<Value>,
    pub workspace_path: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// Build the session CR body written at creation time.
pub fn build_session_body(
    project: &str,
    name: &str,
    request: &CreateSessionRequest,
    llm: &LlmSettings,
    git_config: Option<Value>,
) -> Value {
    let mut spec = json!({
        "prompt": request.prompt,
        "llmSettings": llm,
        "timeout": request.timeout.unwrap_or(300),
        "interactive": request.interactive.unwrap_or(false),
    });
    if let Some(display_name) = request.display_name.as_deref().filter(|d| !d.is_empty()) {
        spec["displayName"] = json!(display_name);
    }
    if let Some(git) = git_config {
        spec["gitConfig"] = git;
    }
    if let Some(overrides) = &request.resource_overrides {
        spec["resourceOverrides"] = overrides.clone();
    }
    if let Some(workspace) = request.workspace_path.as_deref().filter(|w| !w.is_empty()) {
        spec["workspacePath"] = json!(workspace);
    }

    json!({
        "apiVersion": crd::API_VERSION,
        "kind": crd::SESSION_KIND,
        "metadata": {
            "name": name,
            "namespace": project,
            "labels": request.labels,
            "annotations": request.annotations,
        },
        "spec": spec,
        "status": {
            "phase": Phase::Pending,
        },
    })
}

/// Slim representation returned by the list endpoint: large fields
/// (full prompt, result payloads, resource overrides) are stripped.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interactive: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl SessionSummary {
    pub fn from_object(obj: &DynamicObject) -> Self {
        let data = &obj.data;
        Self {
            name: obj.metadata.name.clone().unwrap_or_default(),
            display_name: get_str(data, &["spec", "displayName"]).map(str::to_string),
            phase: get_str(data, &["status", "phase"]).map(str::to_string),
            interactive: get_nested(data, &["spec", "interactive"]).and_then(Value::as_bool),
            creation_timestamp: obj
                .metadata
                .creation_timestamp
                .as_ref()
                .map(|t| t.0.to_rfc3339()),
            start_time: get_str(data, &["status", "startTime"]).map(str::to_string),
            completion_time: get_str(data, &["status", "completionTime"]).map(str::to_string),
            labels: obj.metadata.labels.clone().unwrap_or_default(),
        }
    }

    /// Substring match over name and displayName.
    pub fn matches_search(&self, needle: &str) -> bool {
        if needle.is_empty() {
            return true;
        }
        let needle = needle.to_lowercase();
        if self.name.to_lowercase().contains(&needle) {
            return true;
        }
        self.display_name
            .as_deref()
            .is_some_and(|d| d.to_lowercase().contains(&needle))
    }
}

/// Apply `(limit, offset)` pagination after search filtering.
pub fn paginate<T>(items: Vec<T>, limit: Option<usize>, offset: Option<usize>) -> Vec<T> {
    let offset = offset.unwrap_or(0);
    let mut items: Vec<T> = items.into_iter().skip(offset).collect();
    if let Some(limit) = limit {
        items.truncate(limit);
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names_pass() {
        for name in ["a", "session-1712000000", "x0", "a-b-c9"] {
            assert!(validate_session_name(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn invalid_names_fail() {
        let too_long = "x".repeat(64);
        for name in [
            "",
            "-leading",
            "trailing-",
            "UPPER",
            "under_score",
            "dot.dot",
            "../escape",
            "a/b",
            too_long.as_str(),
        ] {
            assert!(validate_session_name(name).is_err(), "{name}");
        }
    }

    #[test]
    fn phase_monotonicity() {
        assert!(Phase::Pending.can_transition_to(Phase::Creating));
        assert!(Phase::Creating.can_transition_to(Phase::Running));
        assert!(Phase::Running.can_transition_to(Phase::Completed));
        assert!(!Phase::Running.can_transition_to(Phase::Pending));
        assert!(!Phase::Completed.can_transition_to(Phase::Running));
    }

    #[test]
    fn phase_special_transitions() {
        assert!(Phase::Running.can_transition_to(Phase::Stopped));
        for from in [
            Phase::Pending,
            Phase::Creating,
            Phase::Running,
            Phase::Completed,
            Phase::Stopped,
        ] {
            assert!(from.can_transition_to(Phase::Error), "{from}");
        }
    }

    #[test]
    fn llm_defaults_merge() {
        let merged = LlmSettings::merged(None);
        assert_eq!(merged.model, "sonnet");
        assert_eq!(merged.temperature, 0.7);
        assert_eq!(merged.max_tokens, 4000);

        let merged = LlmSettings::merged(Some(LlmSettingsPatch {
            model: Some("opus".into()),
            temperature: None,
            max_tokens: Some(8000),
        }));
        assert_eq!(merged.model, "opus");
        assert_eq!(merged.temperature, 0.7);
        assert_eq!(merged.max_tokens, 8000);
    }

    #[test]
    fn git_config_request_wins_field_by_field() {
        let defaults = json!({
            "user": {"name": "bot", "email": "bot@example.com"},
            "authentication": {"secretName": "git-creds"},
            "repositories": [{"url": "https://example.com/default.git"}],
        });
        let request = json!({
            "user": {"name": "alice"},
            "repositories": [{"url": "https://example.com/mine.git"}],
        });
        let merged = merge_git_config(Some(defaults), Some(request)).unwrap();
        assert_eq!(get_str(&merged, &["user", "name"]), Some("alice"));
        assert_eq!(
            get_str(&merged, &["user", "email"]),
            Some("bot@example.com")
        );
        assert_eq!(
            get_str(&merged, &["authentication", "secretName"]),
            Some("git-creds")
        );
        // Arrays replace wholesale, they do not merge.
        assert_eq!(merged["repositories"].as_array().unwrap().len(), 1);
        assert_eq!(
            merged["repositories"][0]["url"],
            "https://example.com/mine.git"
        );
    }

    #[test]
    fn git_config_absent_sides() {
        assert!(merge_git_config(None, None).is_none());
        let d = json!({"user": {"name": "bot"}});
        assert_eq!(merge_git_config(Some(d.clone()), None), Some(d.clone()));
        assert_eq!(merge_git_config(None, Some(d.clone())), Some(d));
    }

    #[test]
    fn status_update_whitelist() {
        let update = json!({
            "phase": "Completed",
            "result": "done",
            "total_cost_usd": 0.42,
            "malicious": "field",
            "spec": {"prompt": "overwrite"},
        });
        let filtered = filter_status_update(&update);
        assert!(filtered.contains_key("phase"));
        assert!(filtered.contains_key("result"));
        assert!(filtered.contains_key("total_cost_usd"));
        assert!(!filtered.contains_key("malicious"));
        assert!(!filtered.contains_key("spec"));
    }

    #[test]
    fn session_body_has_pending_status() {
        let request = CreateSessionRequest {
            prompt: "hello".into(),
            display_name: Some("x".into()),
            ..Default::default()
        };
        let llm = LlmSettings::default();
        let body = build_session_body("demo", "session-1", &request, &llm, None);
        assert_eq!(get_str(&body, &["status", "phase"]), Some("Pending"));
        assert_eq!(get_str(&body, &["spec", "prompt"]), Some("hello"));
        assert_eq!(get_str(&body, &["spec", "displayName"]), Some("x"));
        assert_eq!(get_str(&body, &["metadata", "namespace"]), Some("demo"));
        assert_eq!(
            get_str(&body, &["spec", "llmSettings", "model"]),
            Some("sonnet")
        );
    }

    #[test]
    fn pagination_applies_offset_then_limit() {
        let items: Vec<i32> = (0..10).collect();
        assert_eq!(paginate(items.clone(), Some(3), Some(4)), vec![4, 5, 6]);
        assert_eq!(paginate(items.clone(), None, Some(8)), vec![8, 9]);
        assert_eq!(paginate(items, Some(100), None).len(), 10);
    }

    #[test]
    fn derived_display_name_uses_first_line() {
        assert_eq!(
            derive_display_name("Fix the login bug\n\ndetails follow"),
            Some("Fix the login bug".to_string())
        );
        assert_eq!(derive_display_name("\n\n  \n"), None);
        let long = "x".repeat(80);
        let derived = derive_display_name(&long).unwrap();
        assert!(derived.chars().count() <= 51);
        assert!(derived.ends_with('…'));
    }

    #[test]
    fn search_matches_name_and_display_name() {
        let summary = SessionSummary {
            name: "session-42".into(),
            display_name: Some("Fix Login Bug".into()),
            phase: None,
            interactive: None,
            creation_timestamp: None,
            start_time: None,
            completion_time: None,
            labels: BTreeMap::new(),
        };
        assert!(summary.matches_search(""));
        assert!(summary.matches_search("42"));
        assert!(summary.matches_search("login"));
        assert!(!summary.matches_search("payments"));
    }
}
