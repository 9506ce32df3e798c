//! In-memory [`GraphStore`] — backs tests and memory-disabled mode.
//!
//! Scoring is token overlap weighted by salience: no embeddings, no
//! network. Maintenance mirrors the real store's semantics (cluster by
//! dominant token, summarize aged concepts, recompute salience from
//! age) so the service-level behavior is exercised end to end.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;

use crate::store::{require_user_scope, GraphStore};
use crate::text::{group_by_dominant, overlap, tokenize};
use crate::types::{content_hash, Fact, FactKind, MaintenanceParams, RecallLayer, Snippet};
use palaver_domain::Result;

/// Salience half-life in days; rows falling below the floor are dropped.
const HALF_LIFE_DAYS: f64 = 30.0;
const SALIENCE_FLOOR: f64 = 0.1;

#[derive(Default)]
pub struct InMemoryGraphStore {
    rows: RwLock<HashMap<String, Vec<Fact>>>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fact_count(&self, user_id: &str) -> usize {
        self.rows.read().get(user_id).map_or(0, |v| v.len())
    }
}

fn layer_for(kind: FactKind) -> RecallLayer {
    match kind {
        FactKind::Fact => RecallLayer::Direct,
        FactKind::Concept => RecallLayer::Concept,
        FactKind::Summary => RecallLayer::Summary,
    }
}

#[async_trait::async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn upsert_fact(&self, user_id: &str, fact: Fact) -> Result<bool> {
        require_user_scope(user_id)?;
        let mut rows = self.rows.write();
        let user_rows = rows.entry(user_id.to_owned()).or_default();
        if user_rows.iter().any(|f| f.content_hash == fact.content_hash) {
            return Ok(false);
        }
        user_rows.push(fact);
        Ok(true)
    }

    async fn search(&self, user_id: &str, query: &str, k: usize) -> Result<Vec<Snippet>> {
        require_user_scope(user_id)?;
        let query_tokens = tokenize(query);
        let rows = self.rows.read();
        let Some(user_rows) = rows.get(user_id) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<(f64, &Fact)> = user_rows
            .iter()
            .filter_map(|f| {
                let hits = overlap(&query_tokens, &f.content);
                if hits == 0 {
                    return None;
                }
                Some((hits as f64 * f.salience, f))
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut out: Vec<Snippet> = Vec::new();

        // Matching rows land in their kind's layer; plain facts split
        // into direct hits (top k) and related (next k).
        let mut direct_seen = 0usize;
        for (score, fact) in &scored {
            let layer = match fact.kind {
                FactKind::Fact => {
                    direct_seen += 1;
                    if direct_seen <= k {
                        RecallLayer::Direct
                    } else if direct_seen <= k * 2 {
                        RecallLayer::Related
                    } else {
                        continue;
                    }
                }
                other => {
                    if out.iter().filter(|s| s.layer == layer_for(other)).count() >= k {
                        continue;
                    }
                    layer_for(other)
                }
            };
            out.push(Snippet {
                content: fact.content.clone(),
                layer,
                score: *score,
                created_at: fact.created_at,
            });
        }

        // Recency layer: newest facts not already selected.
        let mut recent: Vec<&Fact> = user_rows
            .iter()
            .filter(|f| f.kind == FactKind::Fact)
            .filter(|f| !out.iter().any(|s| s.content == f.content))
            .collect();
        recent.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        for fact in recent.into_iter().take(k.min(2)) {
            out.push(Snippet {
                content: fact.content.clone(),
                layer: RecallLayer::Recent,
                score: 0.0,
                created_at: fact.created_at,
            });
        }

        Ok(out)
    }

    async fn cluster(&self, user_id: &str, params: &MaintenanceParams) -> Result<usize> {
        require_user_scope(user_id)?;
        let mut rows = self.rows.write();
        let Some(user_rows) = rows.get_mut(user_id) else {
            return Ok(0);
        };

        // Group plain facts by their longest token; a group of 3+ facts
        // becomes one concept. Content-hash dedup makes re-runs no-ops.
        let groups = group_by_dominant(
            user_rows
                .iter()
                .filter(|f| f.kind == FactKind::Fact)
                .take(params.batch)
                .map(|f| f.content.clone()),
            3,
        );

        let mut created = 0;
        let mut topics: Vec<_> = groups.into_iter().collect();
        topics.sort_by(|a, b| a.0.cmp(&b.0));
        for (topic, members) in topics {
            let content = format!("{topic}: {}", members.join(" | "));
            let hash = content_hash(&content);
            if user_rows.iter().any(|f| f.content_hash == hash) {
                continue;
            }
            user_rows.push(Fact {
                fact_id: uuid::Uuid::new_v4().to_string(),
                content,
                kind: FactKind::Concept,
                content_hash: hash,
                created_at: Utc::now(),
                session_id: None,
                salience: 1.0,
            });
            created += 1;
        }
        Ok(created)
    }

    async fn summarize(&self, user_id: &str, params: &MaintenanceParams) -> Result<usize> {
        require_user_scope(user_id)?;
        let mut rows = self.rows.write();
        let Some(user_rows) = rows.get_mut(user_id) else {
            return Ok(0);
        };

        let concepts: Vec<String> = user_rows
            .iter()
            .filter(|f| f.kind == FactKind::Concept)
            .take(params.batch)
            .map(|f| f.content.clone())
            .collect();
        if concepts.len() < 3 {
            return Ok(0);
        }

        let content = format!("Summary of {} concepts: {}", concepts.len(), concepts.join("; "));
        let hash = content_hash(&content);
        if user_rows.iter().any(|f| f.content_hash == hash) {
            return Ok(0);
        }
        user_rows.push(Fact {
            fact_id: uuid::Uuid::new_v4().to_string(),
            content,
            kind: FactKind::Summary,
            content_hash: hash,
            created_at: Utc::now(),
            session_id: None,
            salience: 1.0,
        });
        Ok(1)
    }

    async fn decay(&self, user_id: &str, _params: &MaintenanceParams) -> Result<usize> {
        require_user_scope(user_id)?;
        let mut rows = self.rows.write();
        let Some(user_rows) = rows.get_mut(user_id) else {
            return Ok(0);
        };

        // Salience is recomputed from age (not multiplied down), so a
        // second pass with no intervening writes reaches the same state.
        let now = Utc::now();
        for fact in user_rows.iter_mut() {
            let age_days = (now - fact.created_at).num_seconds().max(0) as f64 / 86_400.0;
            fact.salience = 0.5_f64.powf(age_days / HALF_LIFE_DAYS);
        }
        let before = user_rows.len();
        user_rows.retain(|f| f.salience >= SALIENCE_FLOOR);
        Ok(before - user_rows.len())
    }
}
