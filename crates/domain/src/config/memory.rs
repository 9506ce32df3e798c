use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Memory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Master switch. Off = no ingest, no recall, no maintenance.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub recall: RecallConfig,
    /// Bounded ingest queue; overflow drops the oldest candidate.
    #[serde(default = "d_ingest_queue")]
    pub ingest_queue: usize,
    /// Maintenance tick period (cluster → summarize → decay).
    #[serde(default = "d_maintenance_secs")]
    pub maintenance_interval_secs: u64,
    /// Per-pass work bound for one maintenance invocation.
    #[serde(default = "d_maintenance_batch")]
    pub maintenance_batch: usize,
    #[serde(default)]
    pub neo4j: Neo4jConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            recall: RecallConfig::default(),
            ingest_queue: d_ingest_queue(),
            maintenance_interval_secs: d_maintenance_secs(),
            maintenance_batch: d_maintenance_batch(),
            neo4j: Neo4jConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Queries shorter than this skip recall entirely.
    #[serde(default = "d_min_query_chars")]
    pub min_query_chars: usize,
    /// Hits returned per layer from the store.
    #[serde(default = "d_top_k")]
    pub top_k: usize,
    /// Recall deadline; on expiry the turn proceeds without a block.
    #[serde(default = "d_recall_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            enabled: d_true(),
            min_query_chars: d_min_query_chars(),
            top_k: d_top_k(),
            timeout_ms: d_recall_timeout_ms(),
        }
    }
}

/// Graph store connection. Credentials only ever arrive from
/// `MEMORY__NEO4J__USERNAME` / `MEMORY__NEO4J__PASSWORD`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Neo4jConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "d_database")]
    pub database: String,
    #[serde(default = "d_neo4j_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "d_neo4j_retries")]
    pub max_retries: u32,
}

// ── serde default helpers ───────────────────────────────────────────

fn d_true() -> bool {
    true
}
fn d_ingest_queue() -> usize {
    256
}
fn d_maintenance_secs() -> u64 {
    600
}
fn d_maintenance_batch() -> usize {
    64
}
fn d_min_query_chars() -> usize {
    6
}
fn d_top_k() -> usize {
    5
}
fn d_recall_timeout_ms() -> u64 {
    1_500
}
fn d_database() -> String {
    "neo4j".into()
}
fn d_neo4j_timeout_ms() -> u64 {
    5_000
}
fn d_neo4j_retries() -> u32 {
    2
}
