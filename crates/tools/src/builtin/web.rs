//! `web.fetch` — bounded HTTP GET.

use serde_json::{json, Value};

use palaver_domain::{Error, Result};

use crate::{require_str, Tool, ToolContext};

const MAX_BODY_BYTES: usize = 64 * 1024;

pub struct WebFetch {
    client: reqwest::Client,
}

impl WebFetch {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(20))
                .user_agent("palaver/0.1")
                .build()
                .expect("static client config is valid"),
        }
    }
}

impl Default for WebFetch {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Tool for WebFetch {
    fn name(&self) -> &'static str {
        "web.fetch"
    }

    fn description(&self) -> &'static str {
        "Fetch a http(s) URL and return status, content type, and the first 64KB of the body."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "Absolute http or https URL." }
            },
            "required": ["url"]
        })
    }

    async fn invoke(&self, args: &Value, _ctx: &ToolContext) -> Result<Value> {
        let url = require_str(args, "url")?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(Error::InvalidArguments(
                "url must be absolute http(s)".into(),
            ));
        }

        let resp = self.client.get(url).send().await.map_err(|e| Error::ToolRuntime {
            message: format!("fetch failed: {e}"),
            retriable: e.is_timeout() || e.is_connect(),
        })?;

        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_owned();
        let body = resp.text().await.map_err(|e| Error::ToolRuntime {
            message: format!("reading body: {e}"),
            retriable: false,
        })?;

        let truncated = body.len() > MAX_BODY_BYTES;
        let body = if truncated {
            let mut end = MAX_BODY_BYTES;
            while !body.is_char_boundary(end) && end > 0 {
                end -= 1;
            }
            body[..end].to_owned()
        } else {
            body
        };

        Ok(json!({
            "status": status,
            "content_type": content_type,
            "truncated": truncated,
            "body": body,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_non_http_schemes() {
        let tool = WebFetch::new();
        let ctx = ToolContext {
            user_id: "u1".into(),
            session_id: "s1".into(),
        };
        let err = tool
            .invoke(&json!({"url": "file:///etc/passwd"}), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_arguments");
    }
}
