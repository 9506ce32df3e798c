//! The five-operation graph store contract.

use crate::types::{Fact, MaintenanceParams, Snippet};
use palaver_domain::{Error, Result};

/// Refuse any store call that arrives without a tenant scope. A session
/// id alone is never sufficient.
pub fn require_user_scope(user_id: &str) -> Result<()> {
    if user_id.trim().is_empty() {
        return Err(Error::InvalidArguments(
            "memory operations require a user_id scope".into(),
        ));
    }
    Ok(())
}

/// The contract the gateway depends on, regardless of backing store.
///
/// Every operation is scoped by `user_id` and implementations must
/// apply that scope as a filter on the store side, not only on the
/// returned rows.
#[async_trait::async_trait]
pub trait GraphStore: Send + Sync {
    /// Insert or refresh a fact. Returns `false` when the store skipped
    /// a near-duplicate.
    async fn upsert_fact(&self, user_id: &str, fact: Fact) -> Result<bool>;

    /// Top-`k` snippets relevant to `query`, best first.
    async fn search(&self, user_id: &str, query: &str, k: usize) -> Result<Vec<Snippet>>;

    /// Warm layer: group related facts into concepts. Returns how many
    /// concepts were produced. Idempotent.
    async fn cluster(&self, user_id: &str, params: &MaintenanceParams) -> Result<usize>;

    /// Cold layer: condense aged concepts into summaries. Returns how
    /// many summaries were produced. Idempotent.
    async fn summarize(&self, user_id: &str, params: &MaintenanceParams) -> Result<usize>;

    /// Forgetting: lower salience with age and drop what fell below the
    /// floor. Returns how many rows were removed. Idempotent.
    async fn decay(&self, user_id: &str, params: &MaintenanceParams) -> Result<usize>;
}
