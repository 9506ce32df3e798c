//! User accounts and bearer tokens.
//!
//! Users persist in `users.json` (atomic rename). Tokens are opaque
//! UUIDs; only their SHA-256 digests are stored, so a leaked state file
//! does not leak live credentials. Token resolution is the **only**
//! thing the rest of the gateway trusts for identity.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use palaver_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub agent_name: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Hex SHA-256 of `salt:password`.
    pub password_hash: String,
    pub salt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenRecord {
    user_id: String,
    issued_at: DateTime<Utc>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UsersFile {
    /// user_id → user
    users: HashMap<String, User>,
    /// hex SHA-256 of token → record
    tokens: HashMap<String, TokenRecord>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct UserStore {
    path: PathBuf,
    state: RwLock<UsersFile>,
    token_ttl: Option<Duration>,
}

/// Marker type for token operations exposed separately in diagnostics.
pub struct AuthTokens;

impl UserStore {
    /// Load or create the user store at `data_dir/users.json`.
    ///
    /// `token_ttl = None` means issued tokens never expire.
    pub fn new(data_dir: &Path, token_ttl: Option<Duration>) -> Result<Self> {
        let path = data_dir.join("users.json");
        let state = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            UsersFile::default()
        };
        tracing::info!(
            users = state.users.len(),
            path = %path.display(),
            "user store loaded"
        );
        Ok(Self {
            path,
            state: RwLock::new(state),
            token_ttl,
        })
    }

    // ── registration / login ─────────────────────────────────────────

    /// Create a user and issue their first token.
    ///
    /// Usernames are unique; re-registering an existing name is
    /// `InvalidArguments` (registration is unauthenticated, so there is
    /// no tenant to hide the conflict from).
    pub fn register(
        &self,
        username: &str,
        password: &str,
        agent_name: Option<&str>,
    ) -> Result<(User, String)> {
        if username.trim().is_empty() || password.is_empty() {
            return Err(Error::InvalidArguments(
                "username and password must be non-empty".into(),
            ));
        }

        let mut state = self.state.write();
        if state.users.values().any(|u| u.username == username) {
            return Err(Error::InvalidArguments(format!(
                "username already taken: {username}"
            )));
        }

        let salt = uuid::Uuid::new_v4().simple().to_string();
        let user = User {
            user_id: uuid::Uuid::new_v4().to_string(),
            username: username.to_owned(),
            created_at: Utc::now(),
            agent_name: agent_name.unwrap_or("Palaver").to_owned(),
            system_prompt: None,
            password_hash: hash_password(&salt, password),
            salt,
        };
        state.users.insert(user.user_id.clone(), user.clone());

        let token = self.issue_token_locked(&mut state, &user.user_id);
        self.persist_locked(&state)?;

        tracing::info!(user_id = %user.user_id, username = %username, "user registered");
        Ok((user, token))
    }

    /// Verify credentials and issue a fresh token.
    pub fn login(&self, username: &str, password: &str) -> Result<(User, String)> {
        let mut state = self.state.write();
        let user = state
            .users
            .values()
            .find(|u| u.username == username)
            .cloned()
            .ok_or_else(|| Error::Unauthorized("unknown username or bad password".into()))?;

        let provided = hash_password(&user.salt, password);
        let ok: bool = provided
            .as_bytes()
            .ct_eq(user.password_hash.as_bytes())
            .into();
        if !ok {
            return Err(Error::Unauthorized("unknown username or bad password".into()));
        }

        let token = self.issue_token_locked(&mut state, &user.user_id);
        self.persist_locked(&state)?;
        Ok((user, token))
    }

    /// Revoke a token. Idempotent.
    pub fn logout(&self, token: &str) -> Result<()> {
        let digest = token_digest(token);
        let mut state = self.state.write();
        if state.tokens.remove(&digest).is_some() {
            self.persist_locked(&state)?;
        }
        Ok(())
    }

    /// Resolve a bearer token to its `user_id`. Expired tokens resolve
    /// to `None` and are swept lazily.
    pub fn resolve_token(&self, token: &str) -> Option<String> {
        let digest = token_digest(token);
        let state = self.state.read();
        let record = state.tokens.get(&digest)?;
        if let Some(expires) = record.expires_at {
            if expires < Utc::now() {
                return None;
            }
        }
        Some(record.user_id.clone())
    }

    /// Drop expired tokens; returns how many were removed.
    pub fn sweep_expired_tokens(&self) -> usize {
        let now = Utc::now();
        let mut state = self.state.write();
        let before = state.tokens.len();
        state
            .tokens
            .retain(|_, t| t.expires_at.map_or(true, |e| e >= now));
        let removed = before - state.tokens.len();
        if removed > 0 {
            if let Err(e) = self.persist_locked(&state) {
                tracing::warn!(error = %e, "token sweep persist failed");
            }
        }
        removed
    }

    // ── lookups ──────────────────────────────────────────────────────

    pub fn get(&self, user_id: &str) -> Result<User> {
        self.state
            .read()
            .users
            .get(user_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("user {user_id}")))
    }

    pub fn user_count(&self) -> usize {
        self.state.read().users.len()
    }

    /// All user ids (maintenance passes iterate these).
    pub fn user_ids(&self) -> Vec<String> {
        self.state.read().users.keys().cloned().collect()
    }

    // ── internals ────────────────────────────────────────────────────

    fn issue_token_locked(&self, state: &mut UsersFile, user_id: &str) -> String {
        let token = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        state.tokens.insert(
            token_digest(&token),
            TokenRecord {
                user_id: user_id.to_owned(),
                issued_at: now,
                expires_at: self.token_ttl.map(|ttl| {
                    now + chrono::Duration::from_std(ttl)
                        .unwrap_or_else(|_| chrono::Duration::zero())
                }),
            },
        );
        token
    }

    fn persist_locked(&self, state: &UsersFile) -> Result<()> {
        let json = serde_json::to_vec_pretty(state)?;
        crate::write_atomic(&self.path, &json)
    }
}

fn hash_password(salt: &str, password: &str) -> String {
    hex::encode(Sha256::digest(format!("{salt}:{password}").as_bytes()))
}

fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (tempfile::TempDir, UserStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = UserStore::new(dir.path(), None).unwrap();
        (dir, store)
    }

    #[test]
    fn register_then_login_resolves_same_user() {
        let (_dir, store) = make_store();
        let (user, reg_token) = store.register("wang_er", "pw123", None).unwrap();
        let (login_user, login_token) = store.login("wang_er", "pw123").unwrap();

        assert_eq!(user.user_id, login_user.user_id);
        assert_eq!(
            store.resolve_token(&reg_token).as_deref(),
            Some(user.user_id.as_str())
        );
        assert_eq!(
            store.resolve_token(&login_token).as_deref(),
            Some(user.user_id.as_str())
        );
    }

    #[test]
    fn duplicate_username_rejected() {
        let (_dir, store) = make_store();
        store.register("wang_er", "pw", None).unwrap();
        let err = store.register("wang_er", "other", None).unwrap_err();
        assert_eq!(err.kind(), "invalid_arguments");
    }

    #[test]
    fn wrong_password_is_unauthorized() {
        let (_dir, store) = make_store();
        store.register("wang_er", "pw123", None).unwrap();
        let err = store.login("wang_er", "nope").unwrap_err();
        assert_eq!(err.kind(), "unauthorized");
    }

    #[test]
    fn logout_revokes_token() {
        let (_dir, store) = make_store();
        let (_, token) = store.register("u", "pw", None).unwrap();
        assert!(store.resolve_token(&token).is_some());
        store.logout(&token).unwrap();
        assert!(store.resolve_token(&token).is_none());
        // Idempotent.
        store.logout(&token).unwrap();
    }

    #[test]
    fn expired_tokens_do_not_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let store = UserStore::new(dir.path(), Some(Duration::from_secs(0))).unwrap();
        let (_, token) = store.register("u", "pw", None).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert!(store.resolve_token(&token).is_none());
        assert_eq!(store.sweep_expired_tokens(), 1);
    }

    #[test]
    fn store_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let token = {
            let store = UserStore::new(dir.path(), None).unwrap();
            let (_, token) = store.register("wang_er", "pw", Some("Nyx")).unwrap();
            token
        };
        let store = UserStore::new(dir.path(), None).unwrap();
        assert_eq!(store.user_count(), 1);
        let user_id = store.resolve_token(&token).unwrap();
        assert_eq!(store.get(&user_id).unwrap().agent_name, "Nyx");
    }
}
