use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Tools the model may see and call. Empty = all registered tools.
    #[serde(default)]
    pub allow: BTreeSet<String>,
    /// Tools that require human confirmation before running.
    #[serde(default = "d_confirm_required")]
    pub confirm_required: BTreeSet<String>,
    /// How long a pending confirmation lives before it counts as a
    /// rejection.
    #[serde(default = "d_confirm_ttl_secs")]
    pub confirm_ttl_secs: u64,
    /// Whether a rejected confirmation ends the turn or resumes the LLM
    /// with the rejection as the tool result.
    #[serde(default)]
    pub reject_ends_turn: bool,
    /// Default invocation deadline.
    #[serde(default = "d_timeout_secs")]
    pub timeout_secs: u64,
    /// Per-tool deadline overrides, by tool name.
    #[serde(default)]
    pub timeout_overrides: BTreeMap<String, u64>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            allow: BTreeSet::new(),
            confirm_required: d_confirm_required(),
            confirm_ttl_secs: d_confirm_ttl_secs(),
            reject_ends_turn: false,
            timeout_secs: d_timeout_secs(),
            timeout_overrides: BTreeMap::new(),
        }
    }
}

impl ToolsConfig {
    /// Whether the allow-list admits `name`.
    pub fn is_allowed(&self, name: &str) -> bool {
        self.allow.is_empty() || self.allow.contains(name)
    }

    /// Whether `name` must be confirmed by the user before running.
    pub fn needs_confirmation(&self, name: &str) -> bool {
        self.confirm_required.contains(name)
    }

    /// Effective deadline for `name`.
    pub fn timeout_for(&self, name: &str) -> std::time::Duration {
        let secs = self
            .timeout_overrides
            .get(name)
            .copied()
            .unwrap_or(self.timeout_secs);
        std::time::Duration::from_secs(secs)
    }
}

fn d_confirm_required() -> BTreeSet<String> {
    ["shell.exec".to_string()].into_iter().collect()
}
fn d_confirm_ttl_secs() -> u64 {
    300
}
fn d_timeout_secs() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allow_list_admits_everything() {
        let cfg = ToolsConfig::default();
        assert!(cfg.is_allowed("web.fetch"));
        assert!(cfg.is_allowed("anything"));
    }

    #[test]
    fn allow_list_is_exclusive_when_set() {
        let mut cfg = ToolsConfig::default();
        cfg.allow.insert("clock.now".into());
        assert!(cfg.is_allowed("clock.now"));
        assert!(!cfg.is_allowed("shell.exec"));
    }

    #[test]
    fn shell_exec_confirmed_by_default() {
        let cfg = ToolsConfig::default();
        assert!(cfg.needs_confirmation("shell.exec"));
        assert!(!cfg.needs_confirmation("clock.now"));
    }

    #[test]
    fn timeout_override_wins() {
        let mut cfg = ToolsConfig::default();
        cfg.timeout_overrides.insert("web.fetch".into(), 5);
        assert_eq!(
            cfg.timeout_for("web.fetch"),
            std::time::Duration::from_secs(5)
        );
        assert_eq!(
            cfg.timeout_for("shell.exec"),
            std::time::Duration::from_secs(30)
        );
    }
}
