//! Sessions, turn-indexed messages, and the open-turn transaction.
//!
//! One JSON file per user (`sessions/<user_id>.json`), written with
//! temp-file + atomic rename: a committed turn is either fully on disk
//! or not at all. Drafts accumulated during streaming live only on the
//! [`TurnHandle`] until commit.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use palaver_domain::chat::{ChatMessage, Role, ToolCall};
use palaver_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message_id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    pub created_at: DateTime<Utc>,
    pub turn_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<StoredMessage>,
    /// Next turn index to hand out; monotone per session.
    pub next_turn_index: u64,
}

/// Listing row for `GET /api/sessions`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub title: Option<String>,
    pub last_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An open turn transaction. Obtained from [`SessionStore::begin_turn`];
/// exactly one of `commit_turn` / `abort_turn` must consume it.
///
/// The handle is a plain value so a suspended turn (awaiting tool
/// confirmation) can park it alongside the rest of its state.
#[derive(Debug)]
pub struct TurnHandle {
    pub user_id: String,
    pub session_id: String,
    pub turn_index: u64,
    drafts: Vec<StoredMessage>,
}

impl TurnHandle {
    /// Stage a message; durable only after commit.
    pub fn push(&mut self, role: Role, content: impl Into<String>, tool_calls: Vec<ToolCall>) {
        self.drafts.push(StoredMessage {
            message_id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            tool_calls,
            created_at: Utc::now(),
            turn_index: self.turn_index,
        });
    }

    pub fn draft_count(&self) -> usize {
        self.drafts.len()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionStore {
    dir: PathBuf,
    /// user_id → (session_id → record). Users load lazily on first touch.
    state: RwLock<HashMap<String, HashMap<String, SessionRecord>>>,
    /// Sessions with an open turn. At most one entry per session,
    /// system-wide.
    open_turns: Mutex<HashSet<String>>,
}

impl SessionStore {
    pub fn new(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join("sessions");
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            state: RwLock::new(HashMap::new()),
            open_turns: Mutex::new(HashSet::new()),
        })
    }

    // ── session CRUD ─────────────────────────────────────────────────

    pub fn create_session(&self, user_id: &str) -> Result<SessionRecord> {
        self.ensure_loaded(user_id);
        let now = Utc::now();
        let record = SessionRecord {
            session_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_owned(),
            title: None,
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
            next_turn_index: 0,
        };
        {
            let mut state = self.state.write();
            state
                .entry(user_id.to_owned())
                .or_default()
                .insert(record.session_id.clone(), record.clone());
        }
        self.persist_user(user_id)?;
        tracing::info!(user_id = %user_id, session_id = %record.session_id, "session created");
        Ok(record)
    }

    /// Resolve `session_id` for `user_id`, or create a fresh session
    /// when none was supplied.
    pub fn resolve_or_create(
        &self,
        user_id: &str,
        session_id: Option<&str>,
    ) -> Result<SessionRecord> {
        match session_id {
            Some(sid) => self.get_session(user_id, sid),
            None => self.create_session(user_id),
        }
    }

    /// Fetch a session. A session owned by someone else is `NotFound` —
    /// indistinguishable from one that does not exist.
    pub fn get_session(&self, user_id: &str, session_id: &str) -> Result<SessionRecord> {
        self.ensure_loaded(user_id);
        let state = self.state.read();
        state
            .get(user_id)
            .and_then(|sessions| sessions.get(session_id))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))
    }

    pub fn list_sessions(&self, user_id: &str) -> Vec<SessionSummary> {
        self.ensure_loaded(user_id);
        let state = self.state.read();
        let mut rows: Vec<SessionSummary> = state
            .get(user_id)
            .map(|sessions| {
                sessions
                    .values()
                    .map(|s| SessionSummary {
                        session_id: s.session_id.clone(),
                        title: s.title.clone(),
                        last_message: s.messages.last().map(|m| truncate(&m.content, 120)),
                        created_at: s.created_at,
                        updated_at: s.updated_at,
                        message_count: s.messages.len(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        rows
    }

    pub fn delete_session(&self, user_id: &str, session_id: &str) -> Result<()> {
        self.ensure_loaded(user_id);
        {
            let mut state = self.state.write();
            let sessions = state
                .get_mut(user_id)
                .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
            if sessions.remove(session_id).is_none() {
                return Err(Error::NotFound(format!("session {session_id}")));
            }
        }
        self.open_turns.lock().remove(session_id);
        self.persist_user(user_id)?;
        Ok(())
    }

    // ── turn transaction ─────────────────────────────────────────────

    /// Open a turn. Fails `Busy` if the session already has one open —
    /// the invariant is at most one open turn per session, system-wide.
    pub fn begin_turn(&self, user_id: &str, session_id: &str) -> Result<TurnHandle> {
        // Ownership check first: a foreign session must 404 before any
        // turn bookkeeping happens.
        let record = self.get_session(user_id, session_id)?;

        let mut open = self.open_turns.lock();
        if !open.insert(session_id.to_owned()) {
            return Err(Error::Busy(format!(
                "session {session_id} already has an open turn"
            )));
        }

        Ok(TurnHandle {
            user_id: user_id.to_owned(),
            session_id: session_id.to_owned(),
            turn_index: record.next_turn_index,
            drafts: Vec::new(),
        })
    }

    /// Commit: append all drafts atomically, bump the turn index, set
    /// the title from the first user message, persist.
    pub fn commit_turn(&self, handle: TurnHandle) -> Result<()> {
        let TurnHandle {
            user_id,
            session_id,
            turn_index,
            drafts,
        } = handle;

        {
            let mut state = self.state.write();
            let record = state
                .get_mut(&user_id)
                .and_then(|sessions| sessions.get_mut(&session_id))
                .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;

            if record.title.is_none() {
                if let Some(first_user) = drafts.iter().find(|m| m.role == Role::User) {
                    record.title = Some(truncate(&first_user.content, 60));
                }
            }
            record.messages.extend(drafts);
            record.next_turn_index = record.next_turn_index.max(turn_index + 1);
            record.updated_at = Utc::now();
        }
        self.open_turns.lock().remove(&session_id);
        self.persist_user(&user_id)?;
        Ok(())
    }

    /// Abort: discard drafts, release the open-turn mark. Nothing is
    /// persisted.
    pub fn abort_turn(&self, handle: TurnHandle) {
        self.open_turns.lock().remove(&handle.session_id);
    }

    pub fn has_open_turn(&self, session_id: &str) -> bool {
        self.open_turns.lock().contains(session_id)
    }

    pub fn open_turn_count(&self) -> usize {
        self.open_turns.lock().len()
    }

    // ── prompt history ───────────────────────────────────────────────

    /// The tail of committed history as provider messages: the last
    /// `rounds` (user, assistant) pairs. Tool and system rows are
    /// excluded — the prompt rebuilds those per turn.
    pub fn history_tail(
        &self,
        user_id: &str,
        session_id: &str,
        rounds: usize,
    ) -> Result<Vec<ChatMessage>> {
        let record = self.get_session(user_id, session_id)?;
        let convo: Vec<&StoredMessage> = record
            .messages
            .iter()
            .filter(|m| matches!(m.role, Role::User | Role::Assistant))
            .collect();
        let keep = rounds.saturating_mul(2);
        let start = convo.len().saturating_sub(keep);
        Ok(convo[start..]
            .iter()
            .map(|m| ChatMessage {
                role: m.role,
                content: m.content.clone(),
                tool_calls: Vec::new(),
                tool_call_id: None,
            })
            .collect())
    }

    // ── persistence ──────────────────────────────────────────────────

    fn user_file(&self, user_id: &str) -> PathBuf {
        self.dir.join(format!("{user_id}.json"))
    }

    fn ensure_loaded(&self, user_id: &str) {
        if self.state.read().contains_key(user_id) {
            return;
        }
        let path = self.user_file(user_id);
        let sessions: HashMap<String, SessionRecord> = if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
                Err(e) => {
                    tracing::warn!(user_id = %user_id, error = %e, "session file unreadable");
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };
        self.state
            .write()
            .entry(user_id.to_owned())
            .or_insert(sessions);
    }

    fn persist_user(&self, user_id: &str) -> Result<()> {
        let json = {
            let state = self.state.read();
            let Some(sessions) = state.get(user_id) else {
                return Ok(());
            };
            serde_json::to_vec_pretty(sessions)?
        };
        crate::write_atomic(&self.user_file(user_id), &json)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        (dir, store)
    }

    fn commit_exchange(store: &SessionStore, user: &str, sid: &str, q: &str, a: &str) {
        let mut turn = store.begin_turn(user, sid).unwrap();
        turn.push(Role::User, q, Vec::new());
        turn.push(Role::Assistant, a, Vec::new());
        store.commit_turn(turn).unwrap();
    }

    #[test]
    fn cross_tenant_read_is_not_found() {
        let (_dir, store) = make_store();
        let session = store.create_session("u1").unwrap();

        let err = store.get_session("u2", &session.session_id).unwrap_err();
        assert_eq!(err.kind(), "not_found");
        // Same shape as a genuinely missing session.
        let err2 = store.get_session("u2", "no-such-session").unwrap_err();
        assert_eq!(err2.kind(), err.kind());
    }

    #[test]
    fn cross_tenant_delete_and_begin_turn_are_not_found() {
        let (_dir, store) = make_store();
        let session = store.create_session("u1").unwrap();
        assert_eq!(
            store
                .delete_session("u2", &session.session_id)
                .unwrap_err()
                .kind(),
            "not_found"
        );
        assert_eq!(
            store
                .begin_turn("u2", &session.session_id)
                .unwrap_err()
                .kind(),
            "not_found"
        );
    }

    #[test]
    fn at_most_one_open_turn_per_session() {
        let (_dir, store) = make_store();
        let session = store.create_session("u1").unwrap();

        let turn = store.begin_turn("u1", &session.session_id).unwrap();
        let err = store.begin_turn("u1", &session.session_id).unwrap_err();
        assert_eq!(err.kind(), "busy");

        store.abort_turn(turn);
        // Released: a new turn may open.
        store.begin_turn("u1", &session.session_id).unwrap();
    }

    #[test]
    fn commit_appends_all_drafts_and_bumps_index() {
        let (_dir, store) = make_store();
        let session = store.create_session("u1").unwrap();
        let sid = session.session_id;

        commit_exchange(&store, "u1", &sid, "hello", "hi there");
        let record = store.get_session("u1", &sid).unwrap();
        assert_eq!(record.messages.len(), 2);
        assert!(record.messages.iter().all(|m| m.turn_index == 0));
        assert_eq!(record.next_turn_index, 1);
        assert_eq!(record.title.as_deref(), Some("hello"));

        commit_exchange(&store, "u1", &sid, "second", "reply");
        let record = store.get_session("u1", &sid).unwrap();
        assert_eq!(record.messages.len(), 4);
        assert_eq!(record.messages[2].turn_index, 1);
        assert_eq!(record.next_turn_index, 2);
        // Title keeps the first turn's text.
        assert_eq!(record.title.as_deref(), Some("hello"));
    }

    #[test]
    fn abort_leaves_no_trace() {
        let (_dir, store) = make_store();
        let session = store.create_session("u1").unwrap();

        let mut turn = store.begin_turn("u1", &session.session_id).unwrap();
        turn.push(Role::User, "draft only", Vec::new());
        store.abort_turn(turn);

        let record = store.get_session("u1", &session.session_id).unwrap();
        assert!(record.messages.is_empty());
        assert_eq!(record.next_turn_index, 0);
    }

    #[test]
    fn list_sessions_sorted_by_recency_and_scoped() {
        let (_dir, store) = make_store();
        let s1 = store.create_session("u1").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let s2 = store.create_session("u1").unwrap();
        store.create_session("u2").unwrap();

        commit_exchange(&store, "u1", &s1.session_id, "ping", "pong");

        let rows = store.list_sessions("u1");
        assert_eq!(rows.len(), 2);
        // s1 was touched last, so it sorts first.
        assert_eq!(rows[0].session_id, s1.session_id);
        assert_eq!(rows[0].message_count, 2);
        assert_eq!(rows[0].last_message.as_deref(), Some("pong"));
        assert_eq!(rows[1].session_id, s2.session_id);
    }

    #[test]
    fn history_tail_keeps_last_rounds_only() {
        let (_dir, store) = make_store();
        let session = store.create_session("u1").unwrap();
        let sid = session.session_id;
        for i in 0..5 {
            commit_exchange(&store, "u1", &sid, &format!("q{i}"), &format!("a{i}"));
        }

        let tail = store.history_tail("u1", &sid, 2).unwrap();
        assert_eq!(tail.len(), 4);
        assert_eq!(tail[0].content, "q3");
        assert_eq!(tail[3].content, "a4");
    }

    #[test]
    fn sessions_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let sid = {
            let store = SessionStore::new(dir.path()).unwrap();
            let session = store.create_session("u1").unwrap();
            commit_exchange(&store, "u1", &session.session_id, "persist me", "done");
            session.session_id
        };
        let store = SessionStore::new(dir.path()).unwrap();
        let record = store.get_session("u1", &sid).unwrap();
        assert_eq!(record.messages.len(), 2);
        assert_eq!(record.messages[0].content, "persist me");
    }
}
