//! Client-facing stream frames.
//!
//! A chat response stream is a sequence of newline-delimited JSON
//! objects; each object is one [`Frame`]. The final frame of a
//! successful stream is always `done`.

use serde::{Deserialize, Serialize};

use crate::chat::ToolCallStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "text")]
    Text { content: String },

    #[serde(rename = "tool_detected")]
    ToolDetected { content: String },

    #[serde(rename = "tool_start")]
    ToolStart {
        call_id: String,
        tool_name: String,
        args: serde_json::Value,
        status: ToolCallStatus,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        call_id: String,
        tool_name: String,
        result: serde_json::Value,
    },

    #[serde(rename = "tool_error")]
    ToolError { call_id: String, content: String },

    /// Terminal frame. `content` re-renders the normalized final text
    /// so non-streaming callers (and reconnecting clients) get the
    /// committed body, not the raw stream.
    #[serde(rename = "done")]
    Done {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },

    #[serde(rename = "error")]
    Error { content: String },
}

impl Frame {
    /// Encode as a single wire line (JSON object + `\n`).
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, "frame serialization failed");
            r#"{"type":"error","content":"frame serialization failed"}"#.to_string()
        });
        line.push('\n');
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_frame_line_shape() {
        let line = Frame::Done {
            session_id: "s1".into(),
            content: None,
        }
        .to_line();
        assert_eq!(line, "{\"type\":\"done\",\"session_id\":\"s1\"}\n");
    }

    #[test]
    fn done_frame_carries_normalized_content_when_set() {
        let line = Frame::Done {
            session_id: "s1".into(),
            content: Some("Hello.\n\nWorld.".into()),
        }
        .to_line();
        let v: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(v["content"], "Hello.\n\nWorld.");
    }

    #[test]
    fn tool_start_carries_status() {
        let frame = Frame::ToolStart {
            call_id: "tc_1".into(),
            tool_name: "shell.exec".into(),
            args: serde_json::json!({"command": "ls"}),
            status: ToolCallStatus::AwaitingConfirm,
        };
        let v: serde_json::Value = serde_json::from_str(frame.to_line().trim()).unwrap();
        assert_eq!(v["type"], "tool_start");
        assert_eq!(v["status"], "awaiting_confirm");
    }
}
