use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Conversation / turn limits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// How many (user, assistant) pairs of history enter the prompt.
    #[serde(default = "d_history_rounds")]
    pub history_rounds: usize,
    /// Maximum (LLM → tool → LLM) rounds within one turn.
    #[serde(default = "d_tool_hops_max")]
    pub tool_hops_max: u32,
    /// Default streaming behavior; a request's `stream` field wins.
    #[serde(default = "d_stream")]
    pub stream: bool,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            history_rounds: d_history_rounds(),
            tool_hops_max: d_tool_hops_max(),
            stream: d_stream(),
        }
    }
}

fn d_history_rounds() -> usize {
    8
}
fn d_tool_hops_max() -> u32 {
    6
}
fn d_stream() -> bool {
    true
}
