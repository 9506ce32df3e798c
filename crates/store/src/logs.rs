//! Per-user daily log files.
//!
//! One JSON line per entry under `logs/<user_id>/YYYY-MM-DD.log`,
//! UTF-8. These are audit trails for a single tenant (turn errors,
//! denied cross-tenant attempts); process-wide logs go through
//! `tracing` as usual.

use std::io::Write;
use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct LogLine<'a> {
    timestamp: chrono::DateTime<Utc>,
    level: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_kind: Option<&'a str>,
}

pub struct UserLogWriter {
    root: PathBuf,
}

impl UserLogWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Append one entry to today's file for `user_id`. Failures are
    /// swallowed after a process-level warning: audit logging must never
    /// fail a request.
    pub fn append(
        &self,
        user_id: &str,
        level: &str,
        message: &str,
        request_id: Option<&str>,
        session_id: Option<&str>,
        error_kind: Option<&str>,
    ) {
        let line = LogLine {
            timestamp: Utc::now(),
            level,
            message,
            request_id,
            session_id,
            error_kind,
        };
        if let Err(e) = self.try_append(user_id, &line) {
            tracing::warn!(user_id = %user_id, error = %e, "user log append failed");
        }
    }

    fn try_append(&self, user_id: &str, line: &LogLine<'_>) -> std::io::Result<()> {
        let dir = self.root.join(user_id);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.log", Utc::now().format("%Y-%m-%d")));
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let json = serde_json::to_string(line).map_err(std::io::Error::other)?;
        writeln!(file, "{json}")
    }
}
