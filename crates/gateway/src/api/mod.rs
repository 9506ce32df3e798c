//! HTTP surface.
//!
//! Middleware order on protected routes: request id → trace logging →
//! auth resolution (`token → user_id`, 401 on miss) → per-user rate
//! limit → handler. Error normalization is the [`error_response`]
//! mapping every handler funnels through; cross-tenant access always
//! renders as 404.

pub mod admin;
pub mod auth;
pub mod chat;
pub mod config;
pub mod memory;
pub mod sessions;

use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;

use palaver_domain::Error;

use crate::state::AppState;

/// Build the full API router.
///
/// `state` is needed at build time to wire the auth middleware.
pub fn router(state: AppState) -> Router<AppState> {
    let public = Router::new()
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login))
        .route("/api/status", get(admin::status));

    let protected = Router::new()
        // Chat (core runtime)
        .route("/api/chat", post(chat::chat))
        .route("/api/chat/confirm", post(chat::confirm))
        // Sessions
        .route("/api/sessions", get(sessions::list_sessions))
        .route("/api/sessions/:id", get(sessions::get_session))
        .route("/api/sessions/:id", delete(sessions::delete_session))
        // Config
        .route("/api/config", get(config::get_config))
        .route("/api/config", post(config::update_config))
        .route("/api/config/update", post(config::update_config))
        .route("/api/config/reset", post(config::reset_config))
        // Memory
        .route("/api/memory/graph/:sid", get(memory::graph_view))
        .route("/api/memory/:op/:sid", post(memory::maintenance))
        // Auth lifecycle
        .route("/api/auth/logout", post(auth::logout))
        // Diagnostics
        .route("/api/doctor", get(admin::doctor))
        .route("/api/doctor/migrate-config", post(admin::migrate_config))
        .route_layer(middleware::from_fn_with_state(
            state,
            auth::require_user,
        ));

    public
        .merge(protected)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Request id assigned at the edge; carried in logs and the response.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

async fn request_id_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    let id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    req.extensions_mut().insert(RequestId(id.clone()));

    let mut resp = next.run(req).await;
    if let Ok(value) = id.parse() {
        resp.headers_mut().insert("x-request-id", value);
    }
    resp
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error normalization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Map a domain error onto `(status, {error, kind})`. Messages here are
/// client-facing; internals stay in the logs.
pub fn error_response(error: &Error) -> Response {
    let status = match error {
        Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        Error::Forbidden(_) | Error::ToolDenied(_) => StatusCode::FORBIDDEN,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Busy(_) | Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        Error::InvalidArguments(_) => StatusCode::BAD_REQUEST,
        Error::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Cancelled(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
        "internal error".to_owned()
    } else {
        error.to_string()
    };
    (
        status,
        Json(serde_json::json!({ "error": message, "kind": error.kind() })),
    )
        .into_response()
}
