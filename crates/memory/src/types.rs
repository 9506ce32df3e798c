use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Facts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Storage temperature of a fact: raw facts are hot, clustered
/// concepts warm, summaries cold. Maintenance moves content downward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactKind {
    Fact,
    Concept,
    Summary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub fact_id: String,
    pub content: String,
    pub kind: FactKind,
    /// Hex SHA-256 of the normalized content, for dedup.
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Relevance weight; decay lowers it, access raises it.
    #[serde(default = "d_salience")]
    pub salience: f64,
}

fn d_salience() -> f64 {
    1.0
}

impl Fact {
    pub fn new(content: impl Into<String>, session_id: Option<String>) -> Self {
        let content = content.into();
        Self {
            fact_id: uuid::Uuid::new_v4().to_string(),
            content_hash: content_hash(&content),
            content,
            kind: FactKind::Fact,
            created_at: Utc::now(),
            session_id,
            salience: 1.0,
        }
    }
}

/// Hex SHA-256 of whitespace-normalized, lowercased content.
pub fn content_hash(content: &str) -> String {
    use sha2::{Digest, Sha256};
    let normalized = content
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Recall
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Layer a snippet was drawn from; the recall block groups by these in
/// a fixed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecallLayer {
    Summary,
    Concept,
    Direct,
    Related,
    Recent,
}

impl RecallLayer {
    pub fn heading(&self) -> &'static str {
        match self {
            RecallLayer::Summary => "Summaries",
            RecallLayer::Concept => "Concepts",
            RecallLayer::Direct => "Relevant facts",
            RecallLayer::Related => "Related",
            RecallLayer::Recent => "Recent",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snippet {
    pub content: String,
    pub layer: RecallLayer,
    pub score: f64,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Ingest / maintenance
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One committed exchange queued for write-behind ingest.
#[derive(Debug, Clone)]
pub struct MemoryCandidate {
    pub user_id: String,
    pub session_id: String,
    pub user_text: String,
    pub assistant_text: String,
    pub timestamp: DateTime<Utc>,
}

/// Work bound for one maintenance pass invocation.
#[derive(Debug, Clone, Copy)]
pub struct MaintenanceParams {
    pub batch: usize,
}

impl Default for MaintenanceParams {
    fn default() -> Self {
        Self { batch: 64 }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MaintenanceReport {
    pub clusters: usize,
    pub summaries: usize,
    pub decayed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_normalizes_whitespace_and_case() {
        assert_eq!(
            content_hash("My name  is Wang Er."),
            content_hash("my name is wang er.")
        );
        assert_ne!(content_hash("a"), content_hash("b"));
    }
}
