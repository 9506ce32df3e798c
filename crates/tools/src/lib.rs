//! Tool registry and invocation.
//!
//! Tools are in-tree implementations of the [`Tool`] trait, registered
//! at startup — there is no dynamic code loading. Invocation resolves
//! the name, checks the allow-list from the turn's config snapshot,
//! enforces the per-tool deadline, and returns a structured
//! [`ToolEnvelope`]; arguments are untrusted input.

pub mod builtin;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use palaver_domain::chat::ToolDefinition;
use palaver_domain::config::ToolsConfig;
use palaver_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Who is invoking, for scoping and audit.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub user_id: String,
    pub session_id: String,
}

#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// JSON Schema for the tool's parameters.
    fn parameters(&self) -> Value;

    async fn invoke(&self, args: &Value, ctx: &ToolContext) -> Result<Value>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Result envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorCategory {
    NotFound,
    Denied,
    Timeout,
    InvalidArguments,
    Runtime,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolError {
    pub category: ToolErrorCategory,
    pub message: String,
}

/// What a tool invocation produced, success or not.
#[derive(Debug, Clone, Serialize)]
pub struct ToolEnvelope {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
}

impl ToolEnvelope {
    pub fn ok(value: Value) -> Self {
        Self {
            ok: true,
            value: Some(value),
            error: None,
        }
    }

    pub fn err(category: ToolErrorCategory, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            value: None,
            error: Some(ToolError {
                category,
                message: message.into(),
            }),
        }
    }

    /// Render for the tool-role prompt message.
    pub fn to_prompt_text(&self) -> String {
        match (&self.value, &self.error) {
            (Some(value), _) => serde_json::to_string(value).unwrap_or_default(),
            (None, Some(error)) => format!("tool error ({:?}): {}", error.category, error.message),
            (None, None) => String::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard registry: shell, web fetch, clock.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(builtin::ShellExec::default()));
        registry.register(Arc::new(builtin::WebFetch::new()));
        registry.register(Arc::new(builtin::ClockNow));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_owned(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Definitions exposed to the model, filtered by the allow-list in
    /// the turn's config snapshot.
    pub fn definitions(&self, cfg: &ToolsConfig) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .filter(|t| cfg.is_allowed(t.name()))
            .map(|t| ToolDefinition {
                name: t.name().to_owned(),
                description: t.description().to_owned(),
                parameters: t.parameters(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Resolve, gate, run with a deadline, and wrap the outcome.
    ///
    /// Never returns `Err`: every failure mode is encoded in the
    /// envelope so the turn engine has exactly one shape to forward.
    pub async fn invoke(
        &self,
        name: &str,
        args: &Value,
        cfg: &ToolsConfig,
        ctx: &ToolContext,
    ) -> ToolEnvelope {
        let Some(tool) = self.get(name) else {
            return ToolEnvelope::err(ToolErrorCategory::NotFound, format!("unknown tool: {name}"));
        };
        if !cfg.is_allowed(name) {
            return ToolEnvelope::err(
                ToolErrorCategory::Denied,
                format!("tool not allowed by policy: {name}"),
            );
        }

        let deadline = cfg.timeout_for(name);
        let started = std::time::Instant::now();
        let result = tokio::time::timeout(deadline, tool.invoke(args, ctx)).await;
        let elapsed = started.elapsed();

        match result {
            Ok(Ok(value)) => {
                tracing::debug!(tool = name, elapsed_ms = elapsed.as_millis() as u64, "tool ok");
                ToolEnvelope::ok(value)
            }
            Ok(Err(Error::InvalidArguments(msg))) => {
                ToolEnvelope::err(ToolErrorCategory::InvalidArguments, msg)
            }
            Ok(Err(e)) => {
                tracing::warn!(tool = name, error = %e, "tool failed");
                ToolEnvelope::err(ToolErrorCategory::Runtime, e.to_string())
            }
            Err(_) => {
                tracing::warn!(tool = name, deadline_ms = deadline.as_millis() as u64, "tool timed out");
                ToolEnvelope::err(
                    ToolErrorCategory::Timeout,
                    format!("tool exceeded its {}s deadline", deadline.as_secs()),
                )
            }
        }
    }
}

/// Required string argument helper; tools treat arguments as untrusted.
pub fn require_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| Error::InvalidArguments(format!("missing required string argument: {key}")))
}
