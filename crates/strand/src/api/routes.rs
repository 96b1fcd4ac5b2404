//! API route definitions.

use axum::http::{HeaderValue, Method, header};
use axum::{
    Json, Router,
    routing::{delete, get, post, put},
};
use serde_json::{Value, json};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::state::AppState;
use crate::content::handlers as content_handlers;
use crate::gitauth;
use crate::runner::proxy as runner_handlers;
use crate::session::handlers as session_handlers;
use crate::stream::handlers as stream_handlers;
use crate::stream::sse;
use crate::workflow::handlers as workflow_handlers;
use crate::ws::handler as ws_handlers;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::DEBUG));

    let session_routes = Router::new()
        .route(
            "/projects/{project}/sessions",
            get(session_handlers::list_sessions).post(session_handlers::create_session),
        )
        .route(
            "/projects/{project}/sessions/{name}",
            get(session_handlers::get_session)
                .put(session_handlers::update_session)
                .delete(session_handlers::delete_session),
        )
        .route(
            "/projects/{project}/sessions/{name}/start",
            post(session_handlers::start_session),
        )
        .route(
            "/projects/{project}/sessions/{name}/stop",
            post(session_handlers::stop_session),
        )
        .route(
            "/projects/{project}/sessions/{name}/clone",
            post(session_handlers::clone_session),
        )
        .route(
            "/projects/{project}/sessions/{name}/status",
            put(session_handlers::update_status),
        )
        .route(
            "/projects/{project}/sessions/{name}/displayName",
            put(session_handlers::update_display_name),
        )
        .route(
            "/projects/{project}/sessions/{name}/events",
            get(sse::stream_events),
        )
        .route(
            "/projects/{project}/sessions/{name}/history",
            get(stream_handlers::get_history),
        )
        .route(
            "/projects/{project}/sessions/{name}/runs",
            get(stream_handlers::list_runs).post(runner_handlers::start_run),
        )
        .route(
            "/projects/{project}/sessions/{name}/interrupt",
            post(runner_handlers::interrupt_session),
        )
        .route(
            "/projects/{project}/sessions/{name}/export",
            get(stream_handlers::export_session),
        )
        .route(
            "/projects/{project}/sessions/{name}/messages",
            get(ws_handlers::list_session_messages),
        )
        .route(
            "/projects/{project}/sessions/{name}/workspace/{*path}",
            get(content_handlers::read_workspace_file).put(content_handlers::write_workspace_file),
        )
        .route(
            "/projects/{project}/sessions/{name}/ws",
            get(ws_handlers::ws_handler),
        );

    let workflow_routes = Router::new()
        .route(
            "/projects/{project}/workflows",
            get(workflow_handlers::list_workflows).post(workflow_handlers::create_workflow),
        )
        .route(
            "/projects/{project}/workflows/{id}",
            get(workflow_handlers::get_workflow).delete(workflow_handlers::delete_workflow),
        )
        .route(
            "/projects/{project}/workflows/{id}/sessions",
            get(workflow_handlers::list_workflow_sessions)
                .post(workflow_handlers::attach_session),
        )
        .route(
            "/projects/{project}/workflows/{id}/sessions/{name}",
            delete(workflow_handlers::detach_session),
        )
        .route(
            "/projects/{project}/workflows/{id}/publish",
            post(workflow_handlers::publish_file),
        )
        .route(
            "/projects/{project}/workflows/{id}/issues",
            get(workflow_handlers::get_linked_issue),
        );

    // Content adaptation routes take their project from the
    // X-Project-Namespace header.
    let content_routes = Router::new()
        .route("/content/list", get(content_handlers::list_content))
        .route("/content/read", get(content_handlers::read_content))
        .route("/content/write", post(content_handlers::write_content));

    let gitauth_routes = Router::new()
        .route("/auth/gitlab/connect", post(gitauth::connect))
        .route("/auth/gitlab/disconnect", post(gitauth::disconnect))
        .route("/auth/gitlab/status", get(gitauth::status));

    // Public routes (no authentication).
    let public_routes = Router::new().route("/health", get(health));

    Router::new()
        .merge(session_routes)
        .merge(workflow_routes)
        .merge(content_routes)
        .merge(gitauth_routes)
        .merge(public_routes)
        .layer(cors)
        .layer(trace_layer)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// Build the CORS layer based on configuration. With no configured
/// origins the request origin is mirrored, which keeps credentialed
/// requests working behind the ingress authenticator.
fn build_cors_layer(state: &AppState) -> CorsLayer {
    let methods = [
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::DELETE,
        Method::PATCH,
        Method::OPTIONS,
    ];
    let headers = [
        header::AUTHORIZATION,
        header::CONTENT_TYPE,
        header::ACCEPT,
        header::ORIGIN,
        header::COOKIE,
    ];

    let configured: Vec<HeaderValue> = state
        .config
        .allowed_origins
        .iter()
        .filter_map(|origin| {
            origin.parse::<HeaderValue>().ok().or_else(|| {
                tracing::warn!("CORS: invalid origin in config: {}", origin);
                None
            })
        })
        .collect();

    if configured.is_empty() {
        tracing::warn!("CORS: no origins configured, mirroring request origin");
        CorsLayer::new()
            .allow_origin(AllowOrigin::mirror_request())
            .allow_methods(methods)
            .allow_headers(headers)
            .allow_credentials(true)
    } else {
        CorsLayer::new()
            .allow_origin(configured)
            .allow_methods(methods)
            .allow_headers(headers)
            .allow_credentials(true)
    }
}
