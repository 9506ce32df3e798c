//! Registration, login, and the bearer-token middleware.
//!
//! The middleware resolves `Authorization: Bearer <token>` to a
//! `user_id` (401 on miss) and then charges the per-user leaky bucket
//! (429 when empty). Handlers downstream read the authenticated
//! identity from the [`AuthedUser`] extension — never from the body.

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;

use palaver_domain::Error;

use crate::api::error_response;
use crate::state::AppState;

/// The authenticated caller, inserted by [`require_user`].
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub user_id: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Middleware
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn require_user(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let token = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    let Some(user_id) = state.rt.users.resolve_token(token) else {
        return error_response(&Error::Unauthorized("missing or invalid token".into()));
    };

    if !state.limiter.allow(&user_id) {
        return error_response(&Error::RateLimited { retry_after: None });
    }

    req.extensions_mut().insert(AuthedUser { user_id });
    next.run(req).await
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub agent_name: Option<String>,
}

pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Response {
    let (user, token) =
        match state
            .rt
            .users
            .register(&body.username, &body.password, body.agent_name.as_deref())
        {
            Ok(ok) => ok,
            Err(e) => return error_response(&e),
        };

    // Persist the persona choice as the user's config overlay so every
    // later snapshot carries it.
    if let Err(e) = state.rt.config.update_user_config(
        &user.user_id,
        &serde_json::json!({"agent": {"name": user.agent_name}}),
    ) {
        tracing::warn!(user_id = %user.user_id, error = %e, "persona overlay write failed");
    }

    Json(serde_json::json!({
        "user_id": user.user_id,
        "token": token,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

pub async fn login(State(state): State<AppState>, Json(body): Json<LoginRequest>) -> Response {
    match state.rt.users.login(&body.username, &body.password) {
        Ok((user, token)) => Json(serde_json::json!({
            "access_token": token,
            "user_id": user.user_id,
            "agent_name": state.rt.config.snapshot_for(&user.user_id).config.agent.name,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

pub async fn logout(State(state): State<AppState>, req: Request<Body>) -> Response {
    let token = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    match state.rt.users.logout(token) {
        Ok(()) => Json(serde_json::json!({ "ok": true })).into_response(),
        Err(e) => error_response(&e),
    }
}
