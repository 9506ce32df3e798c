//! User, session, and message persistence.
//!
//! Everything in this crate is scoped by `user_id`: every public
//! operation takes the caller's id explicitly, and a session owned by
//! another user is indistinguishable from a missing one (`NotFound`,
//! never `Forbidden`).

pub mod logs;
pub mod sessions;
pub mod users;

pub use logs::UserLogWriter;
pub use sessions::{SessionStore, SessionSummary, StoredMessage, TurnHandle};
pub use users::{AuthTokens, User, UserStore};

use std::path::Path;

use palaver_domain::{Error, Result};

/// Write `bytes` to `path` via a same-directory temp file and atomic
/// rename. A reader never observes a partial file.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Internal(format!("no parent dir for {}", path.display())))?;
    std::fs::create_dir_all(dir)?;

    let tmp = dir.join(format!(
        ".{}.tmp-{}",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state".into()),
        uuid::Uuid::new_v4().simple()
    ));
    std::fs::write(&tmp, bytes)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}
