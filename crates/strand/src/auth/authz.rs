//! SelfSubjectAccessReview gate.
//!
//! Any action that can mutate or disclose a session asks the API server
//! whether the caller's token may perform the exact verb on the exact
//! resource in the project namespace before acting.

use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use kube::Client;
use kube::api::{Api, PostParams};
use tracing::debug;

use crate::api::error::{ApiError, ApiResult};
use crate::crd;

/// Ask the API server whether the caller may perform `verb` on the CRD
/// `resource` in `namespace`.
pub async fn can_i(
    client: &Client,
    namespace: &str,
    verb: &str,
    resource: &str,
) -> ApiResult<bool> {
    can_i_grouped(client, namespace, verb, crd::GROUP, resource).await
}

/// Grouped variant for reviews against core or foreign API groups.
pub async fn can_i_grouped(
    client: &Client,
    namespace: &str,
    verb: &str,
    group: &str,
    resource: &str,
) -> ApiResult<bool> {
    let review = SelfSubjectAccessReview {
        spec: SelfSubjectAccessReviewSpec {
            resource_attributes: Some(ResourceAttributes {
                namespace: Some(namespace.to_string()),
                verb: Some(verb.to_string()),
                group: Some(group.to_string()),
                resource: Some(resource.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
        ..Default::default()
    };

    let api: Api<SelfSubjectAccessReview> = Api::all(client.clone());
    let created = api.create(&PostParams::default(), &review).await?;
    Ok(created.status.map(|s| s.allowed).unwrap_or(false))
}

/// 403 unless the caller may perform `verb` on sessions in `namespace`.
pub async fn require_session_access(
    client: &Client,
    namespace: &str,
    verb: &str,
) -> ApiResult<()> {
    require(client, namespace, verb, crd::SESSION_PLURAL).await
}

/// 403 unless the review allows the action.
pub async fn require(
    client: &Client,
    namespace: &str,
    verb: &str,
    resource: &str,
) -> ApiResult<()> {
    if can_i(client, namespace, verb, resource).await? {
        return Ok(());
    }
    debug!(namespace, verb, resource, "access review denied");
    Err(ApiError::forbidden(format!(
        "not permitted to {verb} {resource} in {namespace}"
    )))
}
