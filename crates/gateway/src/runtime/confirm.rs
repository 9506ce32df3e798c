//! Pending tool confirmations.
//!
//! A suspended turn is a value, not a parked task: the worker that hit
//! the confirmation serialized its state here and went back to the
//! pool. `POST /api/chat/confirm` (or the TTL sweep, as a rejection)
//! takes the state back out and re-enqueues a resume item at the head
//! of the session queue.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use palaver_domain::chat::{ChatMessage, ToolCall};
use palaver_domain::frame::Frame;
use palaver_domain::stream::Usage;
use palaver_domain::{Error, Result};
use palaver_store::TurnHandle;

use crate::config_service::ConfigSnapshot;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Suspended turn state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The serialized partial turn: everything needed to build a fresh
/// worker task on resume. The open [`TurnHandle`] rides along, which is
/// what keeps the session's "one open turn" slot held while the user
/// thinks.
#[derive(Debug)]
pub struct SuspendedTurn {
    pub handle: TurnHandle,
    pub user_text: String,
    /// Prompt so far, including the assistant message that requested
    /// the pending call.
    pub messages: Vec<ChatMessage>,
    /// Visible text accumulated across hops.
    pub text_buf: String,
    pub hops: u32,
    pub usage: Usage,
    /// The call awaiting a decision.
    pub pending_call: ToolCall,
    /// Later calls from the same assistant message, not yet dispatched.
    pub queued_calls: VecDeque<ToolCall>,
    pub frames: mpsc::Sender<Frame>,
    pub frames_sent: Arc<AtomicBool>,
    pub snapshot: Arc<ConfigSnapshot>,
}

#[derive(Debug)]
pub struct PendingConfirmation {
    pub call_id: String,
    pub user_id: String,
    pub session_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub created_at: DateTime<Utc>,
    expires_at: Instant,
    pub state: SuspendedTurn,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct ConfirmationStore {
    pending: Mutex<HashMap<String, PendingConfirmation>>,
}

impl ConfirmationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a suspended turn keyed by its pending call.
    pub fn insert(&self, state: SuspendedTurn, user_id: &str, session_id: &str, ttl: Duration) {
        let call = &state.pending_call;
        let pending = PendingConfirmation {
            call_id: call.call_id.clone(),
            user_id: user_id.to_owned(),
            session_id: session_id.to_owned(),
            tool_name: call.tool_name.clone(),
            arguments: call.arguments.clone(),
            created_at: Utc::now(),
            expires_at: Instant::now() + ttl,
            state,
        };
        self.pending.lock().insert(pending.call_id.clone(), pending);
    }

    /// Take a pending confirmation for resolution. Ownership is part of
    /// the key: a mismatched user or session is `NotFound`, and the
    /// entry stays parked.
    pub fn take(
        &self,
        user_id: &str,
        session_id: &str,
        call_id: &str,
    ) -> Result<PendingConfirmation> {
        let mut pending = self.pending.lock();
        let matches = pending
            .get(call_id)
            .is_some_and(|p| p.user_id == user_id && p.session_id == session_id);
        if !matches {
            return Err(Error::NotFound(format!("pending confirmation {call_id}")));
        }
        Ok(pending.remove(call_id).expect("checked present"))
    }

    /// Remove and return every expired entry; the caller re-enqueues
    /// each as a rejection.
    pub fn take_expired(&self) -> Vec<PendingConfirmation> {
        let now = Instant::now();
        let mut pending = self.pending.lock();
        let expired_ids: Vec<String> = pending
            .values()
            .filter(|p| p.expires_at <= now)
            .map(|p| p.call_id.clone())
            .collect();
        expired_ids
            .into_iter()
            .filter_map(|id| pending.remove(&id))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_domain::config::Config;

    fn suspended(call_id: &str) -> SuspendedTurn {
        let (tx, _rx) = mpsc::channel(4);
        SuspendedTurn {
            handle: test_handle(),
            user_text: "run it".into(),
            messages: Vec::new(),
            text_buf: String::new(),
            hops: 1,
            usage: Usage::default(),
            pending_call: ToolCall {
                call_id: call_id.into(),
                tool_name: "shell.exec".into(),
                arguments: serde_json::json!({"command": "ls"}),
            },
            queued_calls: VecDeque::new(),
            frames: tx,
            frames_sent: Arc::new(AtomicBool::new(false)),
            snapshot: Arc::new(ConfigSnapshot {
                config: Config::default(),
                version: 0,
            }),
        }
    }

    fn test_handle() -> TurnHandle {
        let dir = tempfile::tempdir().unwrap();
        let store = palaver_store::SessionStore::new(dir.path()).unwrap();
        let session = store.create_session("u1").unwrap();
        store.begin_turn("u1", &session.session_id).unwrap()
    }

    #[test]
    fn take_requires_matching_owner_and_session() {
        let store = ConfirmationStore::new();
        store.insert(suspended("tc_1"), "u1", "s1", Duration::from_secs(300));

        assert_eq!(
            store.take("u2", "s1", "tc_1").unwrap_err().kind(),
            "not_found"
        );
        assert_eq!(
            store.take("u1", "sX", "tc_1").unwrap_err().kind(),
            "not_found"
        );
        // The failed attempts did not consume it.
        assert_eq!(store.pending_count(), 1);
        assert!(store.take("u1", "s1", "tc_1").is_ok());
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn expired_entries_are_swept() {
        let store = ConfirmationStore::new();
        store.insert(suspended("tc_old"), "u1", "s1", Duration::from_millis(0));
        store.insert(suspended("tc_new"), "u1", "s2", Duration::from_secs(300));
        std::thread::sleep(Duration::from_millis(5));

        let expired = store.take_expired();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].call_id, "tc_old");
        assert_eq!(store.pending_count(), 1);
        assert!(store.take_expired().is_empty());
    }
}
