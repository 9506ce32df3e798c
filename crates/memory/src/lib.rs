//! Graph-shaped long-term memory.
//!
//! The gateway consumes five store operations (`upsert_fact`, `search`,
//! `cluster`, `summarize`, `decay`) through the [`GraphStore`] trait;
//! any backing implementation can be substituted. Shipped backends: a
//! Neo4j HTTP client and an in-memory store for tests and
//! memory-disabled mode.
//!
//! [`MemoryService`] layers the gateway-facing behavior on top:
//! write-behind ingest of committed turns, gated cross-user-safe
//! recall, and the periodic cluster → summarize → decay maintenance
//! pass. Every store call carries `user_id`; an empty scope fails
//! closed.

pub mod mem_store;
pub mod neo4j;
pub mod recall;
pub mod service;
pub mod store;
pub(crate) mod text;
pub mod types;

pub use mem_store::InMemoryGraphStore;
pub use neo4j::Neo4jStore;
pub use service::{IngestStats, MemoryService};
pub use store::{require_user_scope, GraphStore};
pub use types::{Fact, FactKind, MaintenanceParams, MaintenanceReport, MemoryCandidate, RecallLayer, Snippet};
