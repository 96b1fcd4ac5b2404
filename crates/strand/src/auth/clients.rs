//! Per-request Kubernetes client minting.
//!
//! Every inbound request carries a bearer token; API access happens with a
//! client built around that token so the API server enforces the caller's
//! RBAC. The process-wide elevated client exists for exactly two verbs:
//! creating the credential bundle after the caller's permission has been
//! verified, and minting the runner token for a service account the
//! backend just created.

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use kube::{Client, Config};
use kube::config::AuthInfo;
use secrecy::SecretString;
use serde_json::Value;
use tracing::debug;

/// Factory for request-scoped clients plus the elevated process client.
#[derive(Clone)]
pub struct KubeClients {
    base: Config,
    elevated: Client,
}

impl KubeClients {
    /// Infer cluster coordinates (in-cluster service account or local
    /// kubeconfig) and build the elevated client.
    pub async fn initialize() -> Result<Self> {
        let base = Config::infer()
            .await
            .context("inferring kubernetes configuration")?;
        let elevated =
            Client::try_from(base.clone()).context("building elevated kubernetes client")?;
        Ok(Self { base, elevated })
    }

    /// Build from an explicit config (tests, unusual deployments).
    pub fn from_config(base: Config) -> Result<Self> {
        let elevated =
            Client::try_from(base.clone()).context("building elevated kubernetes client")?;
        Ok(Self { base, elevated })
    }

    /// The process-identity client. Use is restricted to credential-bundle
    /// creation and token minting.
    pub fn elevated(&self) -> Client {
        self.elevated.clone()
    }

    /// Mint a client that authenticates as the request's bearer token.
    ///
    /// Returns `None` when the token is empty or the client cannot be
    /// built. There is no fallback to the process identity; callers that
    /// receive `None` respond 401.
    pub fn for_token(&self, token: &str) -> Option<Client> {
        if token.is_empty() {
            return None;
        }
        let mut config = self.base.clone();
        config.auth_info = AuthInfo {
            token: Some(SecretString::from(token.to_string())),
            ..AuthInfo::default()
        };
        match Client::try_from(config) {
            Ok(client) => Some(client),
            Err(e) => {
                debug!(error = %e, "failed to build user-scoped client");
                None
            }
        }
    }
}

/// Extract `(namespace, serviceAccountName)` from a service-account JWT.
///
/// Inspection only: the payload is decoded without signature validation
/// and the result is used for identity labeling, never authorization.
pub fn service_account_from_token(token: &str) -> Option<(String, String)> {
    let payload_b64 = token.split('.').nth(1)?;
    let payload = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
    let claims: Value = serde_json::from_slice(&payload).ok()?;
    let sub = claims.get("sub")?.as_str()?;
    let rest = sub.strip_prefix("system:serviceaccount:")?;
    let (namespace, name) = rest.split_once(':')?;
    if namespace.is_empty() || name.is_empty() {
        return None;
    }
    Some((namespace.to_string(), name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_token(sub: &str) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256"}"#);
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"{sub}"}}"#).as_bytes());
        format!("{header}.{payload}.signature")
    }

    #[test]
    fn parses_service_account_subject() {
        let token = make_token("system:serviceaccount:demo:session-abc");
        assert_eq!(
            service_account_from_token(&token),
            Some(("demo".to_string(), "session-abc".to_string()))
        );
    }

    #[test]
    fn rejects_user_subjects() {
        let token = make_token("alice@example.com");
        assert_eq!(service_account_from_token(&token), None);
    }

    #[test]
    fn rejects_malformed_tokens() {
        assert_eq!(service_account_from_token("not-a-jwt"), None);
        assert_eq!(service_account_from_token(""), None);
        assert_eq!(
            service_account_from_token("a.b.c"),
            None,
            "non-base64 payload"
        );
    }

    #[test]
    fn rejects_empty_parts() {
        let token = make_token("system:serviceaccount::name-only");
        assert_eq!(service_account_from_token(&token), None);
    }
}
