//! Per-user config view and updates.

use axum::extract::State;
use axum::response::{IntoResponse, Json, Response};
use axum::Extension;

use crate::api::auth::AuthedUser;
use crate::api::error_response;
use crate::state::AppState;

// ── GET /api/config ─────────────────────────────────────────────────

/// The caller's merged snapshot, secrets removed.
pub async fn get_config(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
) -> Response {
    let snapshot = state.rt.config.snapshot_for(&user.user_id);
    Json(serde_json::json!({
        "config": state.rt.config.redacted(&snapshot),
        "version": snapshot.version,
    }))
    .into_response()
}

// ── POST /api/config, /api/config/update ───────────────────────────

/// Merge a patch into the caller's overlay. Secret-typed fields are
/// rejected without write; the merged snapshot comes back.
pub async fn update_config(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let patch = body.get("config").unwrap_or(&body);
    match state.rt.config.update_user_config(&user.user_id, patch) {
        Ok(snapshot) => Json(serde_json::json!({
            "config": state.rt.config.redacted(&snapshot),
            "version": snapshot.version,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

// ── POST /api/config/reset ──────────────────────────────────────────

pub async fn reset_config(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
) -> Response {
    match state.rt.config.reset_user(&user.user_id) {
        Ok(()) => Json(serde_json::json!({ "ok": true })).into_response(),
        Err(e) => error_response(&e),
    }
}
