//! State snapshot synthesis for stream connections.

use kube::Client;
use serde_json::{Value, json};
use tracing::debug;

use crate::crd;
use crate::nested::{get_nested, get_str};

/// Synthesize a `StateSnapshot` event from the current session CR.
///
/// Failure to load the CR downgrades to `{phase: Unknown, interactive:
/// true}` rather than aborting the stream.
pub async fn state_snapshot(
    client: Client,
    project: &str,
    session: &str,
    run_id: &str,
) -> Value {
    let snapshot = match crd::sessions(client, project).get(session).await {
        Ok(object) => snapshot_from_cr(project, session, &object.data),
        Err(e) => {
            debug!(project, session, error = %e, "session CR unavailable for state snapshot");
            json!({
                "sessionName": session,
                "projectName": project,
                "phase": "Unknown",
                "interactive": true,
            })
        }
    };
    json!({
        "type": "StateSnapshot",
        "threadId": session,
        "runId": run_id,
        "snapshot": snapshot,
    })
}

fn snapshot_from_cr(project: &str, session: &str, data: &Value) -> Value {
    let mut snapshot = json!({
        "sessionName": session,
        "projectName": project,
    });
    let copies: &[(&[&str], &str)] = &[
        (&["spec", "interactive"], "interactive"),
        (&["spec", "displayName"], "displayName"),
        (&["spec", "gitConfig", "repositories"], "repos"),
        (&["spec", "activeWorkflow"], "activeWorkflow"),
        (&["status", "phase"], "phase"),
        (&["status", "sdkSessionId"], "sdkSessionId"),
        (&["status", "sdkRestartCount"], "sdkRestartCount"),
        (&["status", "reconciledRepos"], "reconciledRepos"),
        (&["status"], "status"),
    ];
    for (path, key) in copies {
        if let Some(value) = get_nested(data, path) {
            snapshot[*key] = value.clone();
        }
    }
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snapshot_extracts_known_fields() {
        let data = json!({
            "spec": {
                "interactive": true,
                "displayName": "debug session",
                "gitConfig": {"repositories": [{"url": "https://example.com/r.git"}]},
            },
            "status": {"phase": "Running", "sdkSessionId": "sdk-1"},
        });
        let snap = snapshot_from_cr("demo", "s1", &data);
        assert_eq!(snap["sessionName"], "s1");
        assert_eq!(snap["projectName"], "demo");
        assert_eq!(snap["interactive"], true);
        assert_eq!(snap["displayName"], "debug session");
        assert_eq!(snap["phase"], "Running");
        assert_eq!(snap["sdkSessionId"], "sdk-1");
        assert_eq!(snap["repos"][0]["url"], "https://example.com/r.git");
    }

    #[test]
    fn snapshot_tolerates_sparse_cr() {
        let snap = snapshot_from_cr("demo", "s1", &json!({}));
        assert_eq!(snap["sessionName"], "s1");
        assert_eq!(get_str(&snap, &["phase"]), None);
    }
}
