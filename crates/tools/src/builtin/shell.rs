//! `shell.exec` — run a shell command and capture its output.
//!
//! On the confirmation list by default: the model proposes the command,
//! a human approves it, then it runs. Output is truncated so a noisy
//! command cannot blow up the prompt.

use serde_json::{json, Value};
use tokio::process::Command;

use palaver_domain::{Error, Result};

use crate::{require_str, Tool, ToolContext};

const MAX_CAPTURE_BYTES: usize = 16 * 1024;

#[derive(Default)]
pub struct ShellExec;

#[async_trait::async_trait]
impl Tool for ShellExec {
    fn name(&self) -> &'static str {
        "shell.exec"
    }

    fn description(&self) -> &'static str {
        "Run a shell command on the server and return its exit code, stdout, and stderr."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The command line to execute with `sh -c`."
                }
            },
            "required": ["command"]
        })
    }

    async fn invoke(&self, args: &Value, ctx: &ToolContext) -> Result<Value> {
        let command = require_str(args, "command")?;
        tracing::info!(user_id = %ctx.user_id, command = %command, "shell.exec");

        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::ToolRuntime {
                message: format!("spawning shell: {e}"),
                retriable: false,
            })?;

        Ok(json!({
            "exit_code": output.status.code().unwrap_or(-1),
            "stdout": capture(&output.stdout),
            "stderr": capture(&output.stderr),
        }))
    }
}

fn capture(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= MAX_CAPTURE_BYTES {
        return text.into_owned();
    }
    let mut end = MAX_CAPTURE_BYTES;
    while !text.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    format!("{}\n… [truncated]", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ToolContext {
        ToolContext {
            user_id: "u1".into(),
            session_id: "s1".into(),
        }
    }

    #[tokio::test]
    async fn runs_and_captures_stdout() {
        let tool = ShellExec;
        let out = tool
            .invoke(&json!({"command": "printf palaver"}), &ctx())
            .await
            .unwrap();
        assert_eq!(out["exit_code"], 0);
        assert_eq!(out["stdout"], "palaver");
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_not_an_error() {
        let tool = ShellExec;
        let out = tool.invoke(&json!({"command": "exit 3"}), &ctx()).await.unwrap();
        assert_eq!(out["exit_code"], 3);
    }

    #[tokio::test]
    async fn missing_command_is_invalid_arguments() {
        let tool = ShellExec;
        let err = tool.invoke(&json!({}), &ctx()).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_arguments");
    }
}
