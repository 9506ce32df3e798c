//! Liveness, diagnostics, and config self-repair.

use axum::extract::State;
use axum::response::{IntoResponse, Json, Response};

use crate::cli::doctor::environment_checks;
use crate::state::AppState;

// ── GET /api/status ─────────────────────────────────────────────────

/// Public liveness probe.
pub async fn status(State(state): State<AppState>) -> Response {
    Json(serde_json::json!({
        "ok": true,
        "memory_active": state.rt.memory.enabled(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
    .into_response()
}

// ── GET /api/doctor ─────────────────────────────────────────────────

/// Structured diagnostics: environment checks plus live runtime state.
pub async fn doctor(State(state): State<AppState>) -> Response {
    let snapshot = state.rt.config.snapshot();
    let env_checks = environment_checks(&snapshot.config);

    Json(serde_json::json!({
        "checks": {
            "environment": env_checks,
            "scheduler": state.scheduler.stats(),
            "bus": {
                "subscribers": state.rt.bus.stats(),
                "total_dropped": state.rt.bus.total_dropped(),
            },
            "memory": {
                "enabled": state.rt.memory.enabled(),
                "ingest": state.rt.memory.stats(),
            },
            "confirmations_pending": state.rt.confirmations.pending_count(),
            "open_turns": state.rt.sessions.open_turn_count(),
            "connections": state.rt.connections.connection_count(),
            "users": state.rt.users.user_count(),
            "rate_limited_users_tracked": state.limiter.tracked_users(),
        }
    }))
    .into_response()
}

// ── POST /api/doctor/migrate-config ─────────────────────────────────

/// Attempt self-repair of on-disk config: any user overlay that no
/// longer parses is backed up and replaced with an empty overlay.
pub async fn migrate_config(State(state): State<AppState>) -> Response {
    let users_dir = state.rt.config.user_config_dir();
    let mut repaired: Vec<serde_json::Value> = Vec::new();
    let mut scanned = 0usize;

    let entries = match std::fs::read_dir(&users_dir) {
        Ok(entries) => entries,
        Err(_) => {
            return Json(serde_json::json!({ "status": "ok", "scanned": 0 })).into_response();
        }
    };

    for entry in entries.filter_map(|e| e.ok()) {
        let file = entry.path().join("config.json");
        if !file.exists() {
            continue;
        }
        scanned += 1;

        let parses = std::fs::read_to_string(&file)
            .ok()
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
            .is_some();
        if parses {
            continue;
        }

        let backup = file.with_extension(format!(
            "json.bak-{}",
            chrono::Utc::now().format("%Y%m%d%H%M%S")
        ));
        if let Err(e) = std::fs::rename(&file, &backup) {
            tracing::warn!(file = %file.display(), error = %e, "config backup failed");
            continue;
        }
        if let Err(e) = std::fs::write(&file, "{}") {
            tracing::warn!(file = %file.display(), error = %e, "config rewrite failed");
            continue;
        }
        repaired.push(serde_json::json!({
            "file": file.display().to_string(),
            "backup": backup.display().to_string(),
        }));
    }

    Json(serde_json::json!({
        "status": if repaired.is_empty() { "ok" } else { "repaired" },
        "scanned": scanned,
        "repaired": repaired,
    }))
    .into_response()
}
