//! Per-session credential bundle provisioning.
//!
//! Each session gets a dedicated service account, a role limited to the
//! session resources of its own project, a binding, and a short-lived
//! token stored in an opaque secret. All four resources are owned by the
//! session CR, so deleting the session cascades.
//!
//! Provisioning runs with the elevated client, strictly after the
//! caller's permission to create the session has been verified. It is
//! best-effort: failures leave the session Pending and un-annotated, are
//! logged, and never abort the parent create.

use k8s_openapi::api::authentication::v1::{TokenRequest, TokenRequestSpec};
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, DynamicObject, Patch, PatchParams, PostParams};
use serde_json::json;
use tracing::{info, warn};

use crate::api::error::is_already_exists;
use crate::auth::KubeClients;
use crate::crd;

/// Lifetime of the minted runner token.
const TOKEN_TTL_SECONDS: i64 = 4 * 3600;

pub fn service_account_name(session: &str) -> String {
    format!("session-{session}")
}

pub fn role_name(session: &str) -> String {
    format!("session-{session}-role")
}

pub fn role_binding_name(session: &str) -> String {
    format!("session-{session}-rb")
}

pub fn token_secret_name(session: &str) -> String {
    format!("session-token-{session}")
}

/// Owner reference pointing at the session CR.
fn owner_reference(session: &DynamicObject) -> Option<OwnerReference> {
    Some(OwnerReference {
        api_version: crd::API_VERSION.to_string(),
        kind: crd::SESSION_KIND.to_string(),
        name: session.metadata.name.clone()?,
        uid: session.metadata.uid.clone()?,
        controller: Some(true),
        block_owner_deletion: None,
    })
}

fn owned_metadata(name: String, project: &str, owner: &OwnerReference) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(project.to_string()),
        owner_references: Some(vec![owner.clone()]),
        ..Default::default()
    }
}

fn build_service_account(project: &str, session: &str, owner: &OwnerReference) -> ServiceAccount {
    ServiceAccount {
        metadata: owned_metadata(service_account_name(session), project, owner),
        ..Default::default()
    }
}

fn build_role(project: &str, session: &str, owner: &OwnerReference) -> Role {
    Role {
        metadata: owned_metadata(role_name(session), project, owner),
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec![crd::GROUP.to_string()]),
            resources: Some(vec![
                crd::SESSION_PLURAL.to_string(),
                format!("{}/status", crd::SESSION_PLURAL),
            ]),
            verbs: vec![
                "get".to_string(),
                "list".to_string(),
                "watch".to_string(),
                "update".to_string(),
                "patch".to_string(),
            ],
            ..Default::default()
        }]),
    }
}

fn build_role_binding(project: &str, session: &str, owner: &OwnerReference) -> RoleBinding {
    RoleBinding {
        metadata: owned_metadata(role_binding_name(session), project, owner),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: role_name(session),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: service_account_name(session),
            namespace: Some(project.to_string()),
            ..Default::default()
        }]),
    }
}

fn build_token_secret(
    project: &str,
    session: &str,
    owner: &OwnerReference,
    token: &str,
) -> Secret {
    Secret {
        metadata: owned_metadata(token_secret_name(session), project, owner),
        type_: Some("Opaque".to_string()),
        string_data: Some([("token".to_string(), token.to_string())].into()),
        ..Default::default()
    }
}

/// Create a resource, absorbing AlreadyExists so re-runs are safe.
async fn create_idempotent<K>(api: &Api<K>, resource: &K, what: &str) -> anyhow::Result<()>
where
    K: kube::Resource + Clone + serde::Serialize + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.create(&PostParams::default(), resource).await {
        Ok(_) => Ok(()),
        Err(e) if is_already_exists(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
    .map_err(|e: anyhow::Error| e.context(format!("creating {what}")))
}

/// Provision the credential bundle for a freshly created session.
pub async fn provision(
    clients: &KubeClients,
    project: &str,
    session: &DynamicObject,
) -> anyhow::Result<()> {
    let session_name = session
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("session has no name"))?;
    let owner = owner_reference(session)
        .ok_or_else(|| anyhow::anyhow!("session has no uid for owner reference"))?;
    let client = clients.elevated();

    let service_accounts: Api<ServiceAccount> = Api::namespaced(client.clone(), project);
    let roles: Api<Role> = Api::namespaced(client.clone(), project);
    let bindings: Api<RoleBinding> = Api::namespaced(client.clone(), project);
    let secrets: Api<Secret> = Api::namespaced(client.clone(), project);

    create_idempotent(
        &service_accounts,
        &build_service_account(project, session_name, &owner),
        "service account",
    )
    .await?;
    create_idempotent(&roles, &build_role(project, session_name, &owner), "role").await?;
    create_idempotent(
        &bindings,
        &build_role_binding(project, session_name, &owner),
        "role binding",
    )
    .await?;

    // Token minting is not idempotent; a failure here leaves the session
    // Pending and un-annotated so the operator can retry.
    let token_request = TokenRequest {
        spec: TokenRequestSpec {
            expiration_seconds: Some(TOKEN_TTL_SECONDS),
            ..Default::default()
        },
        ..Default::default()
    };
    let minted = service_accounts
        .create_token_request(
            &service_account_name(session_name),
            &PostParams::default(),
            &token_request,
        )
        .await?;
    let token = minted
        .status
        .map(|s| s.token)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| anyhow::anyhow!("token request returned an empty token"))?;

    create_idempotent(
        &secrets,
        &build_token_secret(project, session_name, &owner, &token),
        "token secret",
    )
    .await?;

    // Annotate last: the annotations are the signal that the bundle is
    // complete and the secret exists.
    let sessions = crd::sessions(client, project);
    let patch = json!({
        "metadata": {
            "annotations": {
                crd::TOKEN_SECRET_ANNOTATION: token_secret_name(session_name),
                crd::SERVICE_ACCOUNT_ANNOTATION: service_account_name(session_name),
            }
        }
    });
    sessions
        .patch(session_name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;

    info!(project, session = session_name, "provisioned credential bundle");
    Ok(())
}

/// Best-effort wrapper used by the create handler: errors are logged and
/// discarded so CR creation never hangs on transient TokenRequest issues.
pub async fn provision_best_effort(clients: &KubeClients, project: &str, session: &DynamicObject) {
    if let Err(e) = provision(clients, project, session).await {
        warn!(
            project,
            session = session.metadata.name.as_deref().unwrap_or(""),
            error = %e,
            "credential provisioning failed; session stays pending"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> OwnerReference {
        OwnerReference {
            api_version: crd::API_VERSION.to_string(),
            kind: crd::SESSION_KIND.to_string(),
            name: "session-1".to_string(),
            uid: "uid-1".to_string(),
            controller: Some(true),
            block_owner_deletion: None,
        }
    }

    #[test]
    fn bundle_names_follow_convention() {
        assert_eq!(service_account_name("s1"), "session-s1");
        assert_eq!(role_name("s1"), "session-s1-role");
        assert_eq!(role_binding_name("s1"), "session-s1-rb");
        assert_eq!(token_secret_name("s1"), "session-token-s1");
    }

    #[test]
    fn role_is_scoped_to_session_resources() {
        let role = build_role("demo", "s1", &owner());
        let rules = role.rules.unwrap();
        assert_eq!(rules.len(), 1);
        let rule = &rules[0];
        assert_eq!(rule.api_groups.as_ref().unwrap(), &vec![crd::GROUP]);
        assert_eq!(
            rule.resources.as_ref().unwrap(),
            &vec!["sessions".to_string(), "sessions/status".to_string()]
        );
        assert_eq!(rule.verbs.len(), 5);
        assert!(!rule.verbs.contains(&"delete".to_string()));
        assert!(!rule.verbs.contains(&"create".to_string()));
    }

    #[test]
    fn binding_links_role_to_service_account() {
        let binding = build_role_binding("demo", "s1", &owner());
        assert_eq!(binding.role_ref.name, "session-s1-role");
        let subjects = binding.subjects.unwrap();
        assert_eq!(subjects[0].name, "session-s1");
        assert_eq!(subjects[0].namespace.as_deref(), Some("demo"));
    }

    #[test]
    fn all_bundle_resources_carry_owner_reference() {
        let owner = owner();
        let sa = build_service_account("demo", "s1", &owner);
        let role = build_role("demo", "s1", &owner);
        let binding = build_role_binding("demo", "s1", &owner);
        let secret = build_token_secret("demo", "s1", &owner, "tok");
        for refs in [
            sa.metadata.owner_references,
            role.metadata.owner_references,
            binding.metadata.owner_references,
            secret.metadata.owner_references,
        ] {
            let refs = refs.expect("owner references set");
            assert_eq!(refs.len(), 1);
            assert_eq!(refs[0].name, "session-1");
            assert_eq!(refs[0].uid, "uid-1");
        }
    }

    #[test]
    fn secret_is_opaque_with_token_key() {
        let secret = build_token_secret("demo", "s1", &owner(), "tok-value");
        assert_eq!(secret.type_.as_deref(), Some("Opaque"));
        let data = secret.string_data.unwrap();
        assert_eq!(data.get("token").map(String::as_str), Some("tok-value"));
    }
}
