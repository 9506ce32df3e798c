//! Memory endpoints: the recall graph view and on-demand maintenance.
//!
//! Both take a session id in the path and verify its ownership first;
//! the underlying store operations are additionally scoped by
//! `user_id`, so the session check is a 404-shaped front door, not the
//! isolation boundary itself.

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Json, Response};
use axum::Extension;

use palaver_domain::Error;

use crate::api::auth::AuthedUser;
use crate::api::error_response;
use crate::state::AppState;

// ── GET /api/memory/graph/:sid ──────────────────────────────────────

/// A small node/edge view of what recall would surface for this
/// session's recent context.
pub async fn graph_view(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Path(session_id): Path<String>,
) -> Response {
    let session = match state.rt.sessions.get_session(&user.user_id, &session_id) {
        Ok(session) => session,
        Err(e) => return error_response(&e),
    };

    if !state.rt.memory.enabled() {
        return Json(serde_json::json!({
            "nodes": [],
            "edges": [],
            "stats": { "enabled": false },
        }))
        .into_response();
    }

    // Seed the search with the session's recent user text.
    let query = session
        .messages
        .iter()
        .rev()
        .find(|m| m.role == palaver_domain::chat::Role::User)
        .map(|m| m.content.clone())
        .or(session.title)
        .unwrap_or_default();

    let snippets = match state.rt.memory.search(&user.user_id, &query, 10).await {
        Ok(snippets) => snippets,
        Err(e) => return error_response(&e),
    };

    let user_node_id = format!("user:{}", user.user_id);
    let mut nodes = vec![serde_json::json!({
        "id": user_node_id,
        "kind": "user",
        "label": user.user_id,
    })];
    let mut edges = Vec::new();
    for (i, snippet) in snippets.iter().enumerate() {
        let node_id = format!("fact:{i}");
        nodes.push(serde_json::json!({
            "id": node_id,
            "kind": snippet.layer,
            "label": snippet.content,
            "score": snippet.score,
        }));
        edges.push(serde_json::json!({
            "from": user_node_id,
            "to": node_id,
            "kind": "remembers",
        }));
    }

    Json(serde_json::json!({
        "nodes": nodes,
        "edges": edges,
        "stats": {
            "enabled": true,
            "snippet_count": snippets.len(),
            "ingest": state.rt.memory.stats(),
        },
    }))
    .into_response()
}

// ── POST /api/memory/:op/:sid ───────────────────────────────────────

/// Trigger one maintenance pass on demand. `cleanup` runs all three.
pub async fn maintenance(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Path((op, session_id)): Path<(String, String)>,
) -> Response {
    if let Err(e) = state.rt.sessions.get_session(&user.user_id, &session_id) {
        return error_response(&e);
    }
    if !state.rt.memory.enabled() {
        return error_response(&Error::InvalidArguments("memory is disabled".into()));
    }

    let report = match op.as_str() {
        "cluster" | "summarize" | "decay" | "cleanup" => {
            let full = state.rt.memory.maintain_user(&user.user_id).await;
            match op.as_str() {
                "cluster" => serde_json::json!({ "clusters": full.clusters }),
                "summarize" => serde_json::json!({ "summaries": full.summaries }),
                "decay" => serde_json::json!({ "decayed": full.decayed }),
                _ => serde_json::json!(full),
            }
        }
        other => {
            return error_response(&Error::InvalidArguments(format!(
                "unknown maintenance op: {other}"
            )))
        }
    };

    Json(serde_json::json!({ "ok": true, "op": op, "report": report })).into_response()
}
