//! Session listing, detail, and deletion — all scoped to the caller.

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Json, Response};
use axum::Extension;

use crate::api::auth::AuthedUser;
use crate::api::{error_response, RequestId};
use crate::state::AppState;

// ── GET /api/sessions ───────────────────────────────────────────────

pub async fn list_sessions(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
) -> Response {
    let rows = state.rt.sessions.list_sessions(&user.user_id);
    let sessions: Vec<serde_json::Value> = rows
        .iter()
        .map(|s| {
            serde_json::json!({
                "session_id": s.session_id,
                "title": s.title,
                "last_message": s.last_message,
                "created_at": s.created_at,
                "updated_at": s.updated_at,
                "message_count": s.message_count,
            })
        })
        .collect();
    Json(serde_json::json!({ "sessions": sessions })).into_response()
}

// ── GET /api/sessions/:id ───────────────────────────────────────────

pub async fn get_session(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Extension(request_id): Extension<RequestId>,
    Path(session_id): Path<String>,
) -> Response {
    let record = match state.rt.sessions.get_session(&user.user_id, &session_id) {
        Ok(record) => record,
        Err(e) => {
            // Cross-tenant probes surface as 404 and land in the audit
            // log with both sides of the attempt.
            state.rt.logs.append(
                &user.user_id,
                "warn",
                &format!("denied access to session {session_id}"),
                Some(&request_id.0),
                Some(&session_id),
                Some("not_found"),
            );
            return error_response(&e);
        }
    };

    let messages: Vec<serde_json::Value> = record
        .messages
        .iter()
        .map(|m| {
            serde_json::json!({
                "role": m.role,
                "content": m.content,
                "turn_index": m.turn_index,
                "created_at": m.created_at,
            })
        })
        .collect();

    // A reply finished while the client was away is delivered here
    // exactly once.
    let pending_result = state
        .rt
        .connections
        .take_recent(&user.user_id, &session_id);

    Json(serde_json::json!({
        "session_id": record.session_id,
        "title": record.title,
        "messages": messages,
        "pending_result": pending_result,
    }))
    .into_response()
}

// ── DELETE /api/sessions/:id ────────────────────────────────────────

pub async fn delete_session(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Path(session_id): Path<String>,
) -> Response {
    match state.rt.sessions.delete_session(&user.user_id, &session_id) {
        Ok(()) => Json(serde_json::json!({ "ok": true })).into_response(),
        Err(e) => error_response(&e),
    }
}
