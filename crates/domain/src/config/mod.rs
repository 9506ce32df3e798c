//! Layered configuration tree.
//!
//! Precedence, low → high: embedded defaults (serde `Default`), the
//! system file `config/default.json`, the per-user file
//! `config/users/<user_id>/config.json`, environment overrides. Secrets
//! (provider API key, graph store credentials) are accepted **only**
//! from the environment; user patches naming them are rejected.

mod api;
mod conversation;
mod memory;
mod scheduler;
mod server;
mod tools;

pub use api::*;
pub use conversation::*;
pub use memory::*;
pub use scheduler::*;
pub use server::*;
pub use tools::*;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent persona
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The assistant persona presented to a user. Per-user files typically
/// override both fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "d_agent_name")]
    pub name: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: d_agent_name(),
            system_prompt: None,
        }
    }
}

fn d_agent_name() -> String {
    "Palaver".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Storage paths
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root for session/user state files.
    #[serde(default = "d_data_dir")]
    pub data_dir: std::path::PathBuf,
    /// Root for `default.json` and `users/<user_id>/config.json`.
    #[serde(default = "d_config_dir")]
    pub config_dir: std::path::PathBuf,
    /// Root for per-user daily log files.
    #[serde(default = "d_logs_dir")]
    pub logs_dir: std::path::PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: d_data_dir(),
            config_dir: d_config_dir(),
            logs_dir: d_logs_dir(),
        }
    }
}

fn d_data_dir() -> std::path::PathBuf {
    "data".into()
}
fn d_config_dir() -> std::path::PathBuf {
    "config".into()
}
fn d_logs_dir() -> std::path::PathBuf {
    "logs".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "server.port".into(),
                message: "port must be greater than 0".into(),
            });
        }
        if self.server.host.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "server.host".into(),
                message: "host must not be empty".into(),
            });
        }
        if self.api.base_url.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "api.base_url".into(),
                message: "LLM endpoint base_url must not be empty".into(),
            });
        }
        if self.api.api_key.is_none() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "api.api_key".into(),
                message: "no API key set (API__API_KEY) — provider calls will fail".into(),
            });
        }
        if self.scheduler.workers == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "scheduler.workers".into(),
                message: "worker pool size must be at least 1".into(),
            });
        }
        if self.scheduler.queue_depth == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "scheduler.queue_depth".into(),
                message: "per-session queue depth must be at least 1".into(),
            });
        }
        if self.conversation.tool_hops_max == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "conversation.tool_hops_max".into(),
                message: "tool hops disabled — tool calls will always fail the turn".into(),
            });
        }
        if self.memory.enabled && self.memory.neo4j.enabled && self.memory.neo4j.uri.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "memory.neo4j.uri".into(),
                message: "neo4j enabled but MEMORY__NEO4J__URI is empty".into(),
            });
        }

        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Layering: merge, secrets, environment overlay
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Dotted paths that may only be populated from the environment.
pub const SECRET_PATHS: &[&str] = &[
    "api.api_key",
    "memory.neo4j.username",
    "memory.neo4j.password",
];

/// Return the first secret-typed dotted path present in `patch`, if any.
///
/// Walks the patch object; a key chain matching any [`SECRET_PATHS`]
/// entry (regardless of value, including null) is a violation.
pub fn find_secret_path(patch: &Value) -> Option<String> {
    fn walk(value: &Value, prefix: &mut Vec<String>, hit: &mut Option<String>) {
        if hit.is_some() {
            return;
        }
        if let Value::Object(map) = value {
            for (key, child) in map {
                prefix.push(key.clone());
                let dotted = prefix.join(".");
                if SECRET_PATHS.contains(&dotted.as_str()) {
                    *hit = Some(dotted);
                    prefix.pop();
                    return;
                }
                walk(child, prefix, hit);
                prefix.pop();
            }
        }
    }

    let mut hit = None;
    walk(patch, &mut Vec::new(), &mut hit);
    hit
}

/// RFC 7396-style merge: objects merge recursively, `null` removes a
/// key, anything else replaces.
pub fn merge_patch(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, patch_val) in patch_map {
                if patch_val.is_null() {
                    base_map.remove(key);
                } else {
                    merge_patch(
                        base_map.entry(key.clone()).or_insert(Value::Null),
                        patch_val,
                    );
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

/// Top-level sections the environment overlay is allowed to touch.
const ENV_SECTIONS: &[&str] = &[
    "server",
    "api",
    "agent",
    "conversation",
    "scheduler",
    "memory",
    "tools",
    "storage",
];

/// Apply `SECTION__SUB__FIELD=value` environment overrides onto a config
/// JSON tree. Double underscore denotes nesting; segments are
/// lowercased. Values parse as bool/number where they look like one,
/// string otherwise. Unknown top-level sections are ignored.
pub fn apply_env_overrides<I>(tree: &mut Value, vars: I)
where
    I: IntoIterator<Item = (String, String)>,
{
    for (name, raw) in vars {
        let segments: Vec<String> = name.split("__").map(|s| s.to_ascii_lowercase()).collect();
        if segments.len() < 2 || !ENV_SECTIONS.contains(&segments[0].as_str()) {
            continue;
        }

        let parsed = parse_env_value(&raw);

        let mut node = &mut *tree;
        for segment in &segments[..segments.len() - 1] {
            if !node.is_object() {
                *node = Value::Object(Default::default());
            }
            node = node
                .as_object_mut()
                .expect("just coerced to object")
                .entry(segment.clone())
                .or_insert(Value::Object(Default::default()));
        }
        if !node.is_object() {
            *node = Value::Object(Default::default());
        }
        node.as_object_mut()
            .expect("just coerced to object")
            .insert(segments[segments.len() - 1].clone(), parsed);
    }
}

fn parse_env_value(raw: &str) -> Value {
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Value::Number(n.into());
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(raw.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_clean_of_errors() {
        let issues = Config::default().validate();
        assert!(
            issues
                .iter()
                .all(|i| i.severity != ConfigSeverity::Error),
            "default config must not carry hard errors: {issues:?}"
        );
    }

    #[test]
    fn zero_port_is_an_error() {
        let mut cfg = Config::default();
        cfg.server.port = 0;
        assert!(cfg
            .validate()
            .iter()
            .any(|i| i.field == "server.port" && i.severity == ConfigSeverity::Error));
    }

    #[test]
    fn secret_paths_detected_at_any_depth() {
        let patch = serde_json::json!({"memory": {"neo4j": {"password": "hunter2"}}});
        assert_eq!(
            find_secret_path(&patch).as_deref(),
            Some("memory.neo4j.password")
        );

        let patch = serde_json::json!({"api": {"api_key": null}});
        assert_eq!(find_secret_path(&patch).as_deref(), Some("api.api_key"));

        let patch = serde_json::json!({"conversation": {"history_rounds": 4}});
        assert_eq!(find_secret_path(&patch), None);
    }

    #[test]
    fn merge_patch_is_recursive_and_null_removes() {
        let mut base = serde_json::json!({
            "agent": {"name": "Palaver", "system_prompt": "old"},
            "conversation": {"history_rounds": 8}
        });
        merge_patch(
            &mut base,
            &serde_json::json!({
                "agent": {"system_prompt": null, "name": "Nyx"},
                "conversation": {"stream": false}
            }),
        );
        assert_eq!(base["agent"]["name"], "Nyx");
        assert!(base["agent"].get("system_prompt").is_none());
        assert_eq!(base["conversation"]["history_rounds"], 8);
        assert_eq!(base["conversation"]["stream"], false);
    }

    #[test]
    fn merge_patch_is_idempotent() {
        let patch = serde_json::json!({"agent": {"name": "Nyx"}, "conversation": {"stream": false}});
        let mut once = serde_json::to_value(Config::default()).unwrap();
        merge_patch(&mut once, &patch);
        let mut twice = once.clone();
        merge_patch(&mut twice, &patch);
        assert_eq!(once, twice);
    }

    #[test]
    fn env_overlay_nests_on_double_underscore() {
        let mut tree = serde_json::to_value(Config::default()).unwrap();
        apply_env_overrides(
            &mut tree,
            vec![
                ("API__API_KEY".into(), "sk-test".into()),
                ("API__BASE_URL".into(), "https://llm.example".into()),
                ("API__MODEL".into(), "gpt-4o".into()),
                ("MEMORY__ENABLED".into(), "true".into()),
                ("MEMORY__NEO4J__URI".into(), "http://localhost:7474".into()),
                ("SERVER__PORT".into(), "9001".into()),
                ("PATH".into(), "/usr/bin".into()), // not a config section
            ],
        );
        let cfg: Config = serde_json::from_value(tree).unwrap();
        assert_eq!(cfg.api.api_key.as_deref(), Some("sk-test"));
        assert_eq!(cfg.api.base_url, "https://llm.example");
        assert_eq!(cfg.api.model, "gpt-4o");
        assert!(cfg.memory.enabled);
        assert_eq!(cfg.memory.neo4j.uri, "http://localhost:7474");
        assert_eq!(cfg.server.port, 9001);
    }
}
