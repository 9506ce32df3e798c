//! `clock.now` — current time, for models without a reliable clock.

use serde_json::{json, Value};

use palaver_domain::Result;

use crate::{Tool, ToolContext};

pub struct ClockNow;

#[async_trait::async_trait]
impl Tool for ClockNow {
    fn name(&self) -> &'static str {
        "clock.now"
    }

    fn description(&self) -> &'static str {
        "Return the current UTC time."
    }

    fn parameters(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn invoke(&self, _args: &Value, _ctx: &ToolContext) -> Result<Value> {
        let now = chrono::Utc::now();
        Ok(json!({
            "utc": now.to_rfc3339(),
            "unix": now.timestamp(),
        }))
    }
}
