//! Chat endpoints — the streamed conversation surface.
//!
//! - `POST /api/chat`         — start/continue a turn; SSE line stream
//!   or a single JSON body per the `stream` flag.
//! - `POST /api/chat/confirm` — resolve a pending tool confirmation;
//!   re-enqueues the suspended turn at the head of its session queue.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::Extension;
use serde::Deserialize;
use tokio::sync::mpsc;

use palaver_domain::frame::Frame;
use palaver_domain::Error;

use crate::api::auth::AuthedUser;
use crate::api::{error_response, RequestId};
use crate::runtime::{ConfirmAction, WorkCtx, WorkItem, WorkKind};
use crate::state::AppState;

const FRAME_CHANNEL_CAPACITY: usize = 256;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/chat
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ChatRequestBody {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Overrides the configured default when present.
    #[serde(default)]
    pub stream: Option<bool>,
}

pub async fn chat(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Extension(request_id): Extension<RequestId>,
    Json(body): Json<ChatRequestBody>,
) -> Response {
    if body.message.trim().is_empty() {
        return error_response(&Error::InvalidArguments("message must not be empty".into()));
    }

    let snapshot = state.rt.config.snapshot_for(&user.user_id);
    let stream = body.stream.unwrap_or(snapshot.config.conversation.stream);

    // Ownership enforced here: a foreign session id 404s before any
    // work is admitted.
    let session = match state
        .rt
        .sessions
        .resolve_or_create(&user.user_id, body.session_id.as_deref())
    {
        Ok(session) => session,
        Err(e) => {
            log_scope_denial(&state, &user.user_id, body.session_id.as_deref(), &request_id.0);
            return error_response(&e);
        }
    };

    let (tx, rx) = mpsc::channel::<Frame>(FRAME_CHANNEL_CAPACITY);
    let connection_id = state.rt.connections.bind(
        &user.user_id,
        Some(&session.session_id),
        if stream { "sse" } else { "http" },
        tx.clone(),
    );

    let ctx = WorkCtx {
        user_id: user.user_id.clone(),
        session_id: session.session_id.clone(),
        request_id: request_id.0.clone(),
        snapshot,
        frames: tx,
        frames_sent: Arc::new(AtomicBool::new(false)),
        cancel: state.scheduler.work_token(),
    };
    let item = WorkItem {
        ctx,
        kind: WorkKind::NewTurn {
            user_message: body.message,
        },
    };

    if let Err(e) = state.scheduler.enqueue(item).await {
        state.rt.connections.unbind(&connection_id);
        return error_response(&e);
    }

    if stream {
        sse_response(state, connection_id, session.session_id, rx)
    } else {
        json_response(state, connection_id, session.session_id, rx).await
    }
}

/// Unbinds the connection when the response stream is dropped, whether
/// it completed or the client went away mid-turn.
struct UnbindGuard {
    state: AppState,
    connection_id: String,
}

impl Drop for UnbindGuard {
    fn drop(&mut self) {
        self.state.rt.connections.unbind(&self.connection_id);
    }
}

/// One JSON object per line over `text/event-stream`, flushed per
/// frame. The terminal frame is `done` (or `error`).
fn sse_response(
    state: AppState,
    connection_id: String,
    _session_id: String,
    mut rx: mpsc::Receiver<Frame>,
) -> Response {
    let guard = UnbindGuard {
        state,
        connection_id,
    };
    let stream = async_stream::stream! {
        let _guard = guard;
        while let Some(frame) = rx.recv().await {
            let terminal = matches!(frame, Frame::Done { .. } | Frame::Error { .. });
            yield Ok::<_, std::convert::Infallible>(axum::body::Bytes::from(frame.to_line()));
            if terminal {
                break;
            }
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Streaming disabled: drain the frames and answer with one body.
async fn json_response(
    state: AppState,
    connection_id: String,
    session_id: String,
    mut rx: mpsc::Receiver<Frame>,
) -> Response {
    let _guard = UnbindGuard {
        state,
        connection_id,
    };

    let mut tool_calls = Vec::new();
    while let Some(frame) = rx.recv().await {
        match frame {
            Frame::Done {
                session_id,
                content,
            } => {
                return Json(serde_json::json!({
                    "content": content.unwrap_or_default(),
                    "session_id": session_id,
                    "tool_calls": tool_calls,
                }))
                .into_response();
            }
            Frame::Error { content } => {
                return (
                    StatusCode::BAD_GATEWAY,
                    Json(serde_json::json!({ "error": content, "session_id": session_id })),
                )
                    .into_response();
            }
            Frame::ToolResult {
                call_id,
                tool_name,
                result,
            } => {
                tool_calls.push(serde_json::json!({
                    "call_id": call_id,
                    "tool_name": tool_name,
                    "result": result,
                }));
            }
            _ => {}
        }
    }

    // Channel closed without a terminal frame; the turn died abnormally.
    error_response(&Error::Internal("turn ended without a result".into()))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/chat/confirm
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ConfirmRequestBody {
    pub session_id: String,
    pub tool_call_id: String,
    /// `approve` or `reject`.
    pub action: String,
}

pub async fn confirm(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Extension(request_id): Extension<RequestId>,
    Json(body): Json<ConfirmRequestBody>,
) -> Response {
    let action = match body.action.as_str() {
        "approve" => ConfirmAction::Approve,
        "reject" => ConfirmAction::Reject,
        other => {
            return error_response(&Error::InvalidArguments(format!(
                "action must be approve or reject, got {other}"
            )))
        }
    };

    let pending =
        match state
            .rt
            .confirmations
            .take(&user.user_id, &body.session_id, &body.tool_call_id)
        {
            Ok(pending) => pending,
            Err(e) => {
                log_scope_denial(&state, &user.user_id, Some(&body.session_id), &request_id.0);
                return error_response(&e);
            }
        };

    let ctx = WorkCtx {
        user_id: user.user_id.clone(),
        session_id: body.session_id.clone(),
        request_id: request_id.0.clone(),
        snapshot: pending.state.snapshot.clone(),
        frames: pending.state.frames.clone(),
        frames_sent: pending.state.frames_sent.clone(),
        cancel: state.scheduler.work_token(),
    };
    let item = WorkItem {
        ctx,
        kind: WorkKind::Resume {
            state: pending.state,
            action,
        },
    };

    if let Err(e) = state.scheduler.enqueue_resume(item).await {
        return error_response(&e);
    }

    Json(serde_json::json!({
        "ok": true,
        "tool_call_id": body.tool_call_id,
        "action": body.action,
    }))
    .into_response()
}

/// Denied/unknown-resource attempts land in the caller's audit log with
/// the attempted scope, which is where cross-tenant probing shows up.
fn log_scope_denial(
    state: &AppState,
    user_id: &str,
    session_id: Option<&str>,
    request_id: &str,
) {
    state.rt.logs.append(
        user_id,
        "warn",
        &format!(
            "denied access to session {}",
            session_id.unwrap_or("<none>")
        ),
        Some(request_id),
        session_id,
        Some("not_found"),
    );
}
