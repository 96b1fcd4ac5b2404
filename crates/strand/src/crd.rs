//! Custom resource coordinates and dynamic API handles.
//!
//! The session and workflow CRDs are owned by the external operator and
//! evolve with it, so the control plane accesses them dynamically rather
//! than through generated types.

use kube::Client;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind};

/// API group of all control-plane CRDs.
pub const GROUP: &str = "strand.dev";
/// Served version.
pub const VERSION: &str = "v1alpha1";
/// `apiVersion` string for CR bodies.
pub const API_VERSION: &str = "strand.dev/v1alpha1";

pub const SESSION_KIND: &str = "Session";
pub const SESSION_PLURAL: &str = "sessions";
pub const WORKFLOW_KIND: &str = "Workflow";
pub const PROJECT_SETTINGS_KIND: &str = "ProjectSettings";

/// Label linking a session to its workflow.
pub const WORKFLOW_LABEL: &str = "rfe-workflow";
/// Label recording the workflow phase a session implements.
pub const PHASE_LABEL: &str = "rfe-phase";
/// Label recording the owning project on attached sessions.
pub const PROJECT_LABEL: &str = "project";

/// Annotation naming the secret that carries the runner token.
pub const TOKEN_SECRET_ANNOTATION: &str = "runner-token-secret";
/// Annotation naming the runner's service account.
pub const SERVICE_ACCOUNT_ANNOTATION: &str = "runner-sa";

pub fn session_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(GROUP, VERSION, SESSION_KIND))
}

pub fn workflow_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(GROUP, VERSION, WORKFLOW_KIND))
}

pub fn project_settings_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(GROUP, VERSION, PROJECT_SETTINGS_KIND))
}

/// Namespaced handle on the session CR.
pub fn sessions(client: Client, project: &str) -> Api<DynamicObject> {
    Api::namespaced_with(client, project, &session_resource())
}

/// Namespaced handle on the workflow CR.
pub fn workflows(client: Client, project: &str) -> Api<DynamicObject> {
    Api::namespaced_with(client, project, &workflow_resource())
}

/// Namespaced handle on the project settings CR.
pub fn project_settings(client: Client, project: &str) -> Api<DynamicObject> {
    Api::namespaced_with(client, project, &project_settings_resource())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_resource_plural() {
        let res = session_resource();
        assert_eq!(res.plural, SESSION_PLURAL);
        assert_eq!(res.group, GROUP);
        assert_eq!(res.version, VERSION);
    }

    #[test]
    fn api_version_matches_parts() {
        assert_eq!(API_VERSION, format!("{GROUP}/{VERSION}"));
    }
}
