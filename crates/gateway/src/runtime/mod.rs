//! Core runtime — the scheduler and turn engine plus the context they
//! share.
//!
//! [`TurnRuntime`] is the bundle of services a turn needs; it is built
//! once at startup and threaded through explicitly. A unit of work is a
//! [`WorkItem`]: either a fresh user message or the resumption of a
//! turn suspended for tool confirmation.

pub mod confirm;
pub mod dedup;
pub mod scheduler;
pub mod turn;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use palaver_bus::EventBus;
use palaver_domain::config::Config;
use palaver_domain::frame::Frame;
use palaver_memory::MemoryService;
use palaver_providers::LlmProvider;
use palaver_store::{SessionStore, UserLogWriter, UserStore};
use palaver_tools::ToolRegistry;

use crate::config_service::{ConfigService, ConfigSnapshot};
use crate::connections::ConnectionRegistry;
use confirm::ConfirmationStore;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TurnRuntime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything a turn touches. No globals: handlers receive this via
/// `AppState`, the scheduler hands it to the turn engine.
pub struct TurnRuntime {
    pub bus: Arc<EventBus>,
    pub users: Arc<UserStore>,
    pub sessions: Arc<SessionStore>,
    pub logs: Arc<UserLogWriter>,
    pub memory: Arc<MemoryService>,
    pub tools: Arc<ToolRegistry>,
    pub provider: Arc<dyn LlmProvider>,
    pub config: Arc<ConfigService>,
    pub confirmations: Arc<ConfirmationStore>,
    pub connections: Arc<ConnectionRegistry>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Work items
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The user's decision on a pending tool confirmation. TTL expiry is
/// delivered as `Reject`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmAction {
    Approve,
    Reject,
}

pub enum WorkKind {
    NewTurn { user_message: String },
    Resume {
        state: confirm::SuspendedTurn,
        action: ConfirmAction,
    },
}

/// Request-scoped context that survives retries and suspension.
#[derive(Clone)]
pub struct WorkCtx {
    pub user_id: String,
    pub session_id: String,
    pub request_id: String,
    pub snapshot: Arc<ConfigSnapshot>,
    /// Outbound frame channel for this turn's client.
    pub frames: mpsc::Sender<Frame>,
    /// Set once any frame reached the client; gates retries so a
    /// half-streamed reply is never replayed.
    pub frames_sent: Arc<AtomicBool>,
    pub cancel: CancellationToken,
}

pub struct WorkItem {
    pub ctx: WorkCtx,
    pub kind: WorkKind,
}

impl WorkCtx {
    pub fn config(&self) -> &Config {
        &self.snapshot.config
    }

    /// Deliver one frame; delivery failure (client gone) is not a turn
    /// failure — the turn runs to completion server-side.
    pub async fn send_frame(&self, frame: Frame) {
        self.frames_sent
            .store(true, std::sync::atomic::Ordering::Relaxed);
        let _ = self.frames.send(frame).await;
    }

    pub fn any_frames_sent(&self) -> bool {
        self.frames_sent
            .load(std::sync::atomic::Ordering::Relaxed)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Prompt assembly
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The persona block. Per-user config overrides both the name and the
/// full prompt text.
pub(crate) fn build_system_prompt(config: &Config) -> String {
    match &config.agent.system_prompt {
        Some(prompt) if !prompt.trim().is_empty() => prompt.clone(),
        _ => format!(
            "You are {}, a helpful assistant. Answer concisely and use the \
             available tools when they genuinely help.",
            config.agent.name
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_persona_uses_agent_name() {
        let mut config = Config::default();
        config.agent.name = "Nyx".into();
        assert!(build_system_prompt(&config).contains("You are Nyx"));
    }

    #[test]
    fn explicit_prompt_wins() {
        let mut config = Config::default();
        config.agent.system_prompt = Some("Custom persona.".into());
        assert_eq!(build_system_prompt(&config), "Custom persona.");
    }

    #[test]
    fn blank_prompt_falls_back() {
        let mut config = Config::default();
        config.agent.system_prompt = Some("   ".into());
        assert!(build_system_prompt(&config).contains("You are Palaver"));
    }
}
