//! The gateway-facing memory service.
//!
//! Ingest is write-behind: `enqueue` never blocks a turn and never
//! surfaces failures to the user. A dedicated worker drains a bounded
//! queue (overflow drops the oldest candidate and logs), extracts
//! salient facts from the exchange, and upserts them under the owner's
//! `user_id`. Recall and maintenance are thin, scoped wrappers over the
//! store contract.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use palaver_bus::EventBus;
use palaver_domain::config::{MemoryConfig, RecallConfig};
use palaver_domain::events::{Event, EventPayload};
use palaver_domain::Result;

use crate::recall::{build_block, should_recall};
use crate::store::GraphStore;
use crate::types::{Fact, MaintenanceParams, MaintenanceReport, MemoryCandidate};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stats
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default)]
pub struct IngestStats {
    pub enqueued: AtomicU64,
    pub ingested: AtomicU64,
    pub dropped: AtomicU64,
    pub failed: AtomicU64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct IngestStatsSnapshot {
    pub enqueued: u64,
    pub ingested: u64,
    pub dropped: u64,
    pub failed: u64,
    pub queued: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Service
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct MemoryService {
    cfg: MemoryConfig,
    store: Arc<dyn GraphStore>,
    bus: Arc<EventBus>,
    queue: Mutex<VecDeque<MemoryCandidate>>,
    notify: Notify,
    stats: IngestStats,
}

impl MemoryService {
    /// Build the service and start its ingest worker.
    pub fn start(cfg: MemoryConfig, store: Arc<dyn GraphStore>, bus: Arc<EventBus>) -> Arc<Self> {
        let service = Arc::new(Self {
            cfg,
            store,
            bus,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            stats: IngestStats::default(),
        });

        if service.cfg.enabled {
            let worker = service.clone();
            tokio::spawn(async move {
                loop {
                    let candidate = {
                        let taken = worker.queue.lock().pop_front();
                        match taken {
                            Some(c) => c,
                            None => {
                                worker.notify.notified().await;
                                continue;
                            }
                        }
                    };
                    worker.ingest_candidate(candidate).await;
                }
            });
        }

        service
    }

    pub fn enabled(&self) -> bool {
        self.cfg.enabled
    }

    // ── ingest ───────────────────────────────────────────────────────

    /// Queue a committed exchange for ingestion. Non-blocking; the
    /// calling turn is already finished from the user's point of view.
    pub fn enqueue(&self, candidate: MemoryCandidate) {
        if !self.cfg.enabled {
            return;
        }
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.cfg.ingest_queue.max(1) {
                queue.pop_front();
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("memory ingest queue full — dropped oldest candidate");
            }
            queue.push_back(candidate);
        }
        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
    }

    async fn ingest_candidate(&self, candidate: MemoryCandidate) {
        let facts = extract_facts(&candidate);
        if facts.is_empty() {
            return;
        }

        let mut saved = 0usize;
        for content in facts {
            let fact = Fact::new(content, Some(candidate.session_id.clone()));
            match self.store.upsert_fact(&candidate.user_id, fact).await {
                Ok(true) => saved += 1,
                Ok(false) => {} // near-duplicate, store skipped it
                Err(e) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        user_id = %candidate.user_id,
                        error = %e,
                        "memory ingest failed"
                    );
                    return;
                }
            }
        }
        self.stats.ingested.fetch_add(1, Ordering::Relaxed);

        if saved > 0 {
            self.bus.emit(Event::new(EventPayload::MemorySaved {
                user_id: candidate.user_id,
                fact_count: saved,
            }));
        }
    }

    /// Block until the ingest queue is empty (tests and shutdown).
    pub async fn drain(&self) {
        while !self.queue.lock().is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        // One more yield so the in-flight candidate finishes.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    // ── recall ───────────────────────────────────────────────────────

    /// Produce the recall block for a turn, or `None` when gating
    /// declines, the store times out, or nothing relevant exists.
    /// Failures degrade to `None`: a turn never fails because of
    /// memory.
    pub async fn recall(
        &self,
        user_id: &str,
        session_id: &str,
        query: &str,
        recall_cfg: &RecallConfig,
    ) -> Option<String> {
        if !self.cfg.enabled || !should_recall(query, recall_cfg) {
            return None;
        }

        let deadline = std::time::Duration::from_millis(recall_cfg.timeout_ms);
        let search = self.store.search(user_id, query, recall_cfg.top_k);
        let snippets = match tokio::time::timeout(deadline, search).await {
            Ok(Ok(snippets)) => snippets,
            Ok(Err(e)) => {
                tracing::warn!(user_id = %user_id, error = %e, "memory recall failed");
                return None;
            }
            Err(_) => {
                tracing::warn!(user_id = %user_id, "memory recall timed out — skipping");
                return None;
            }
        };

        let block = build_block(&snippets)?;
        self.bus.emit(Event::new(EventPayload::MemoryRecalled {
            user_id: user_id.to_owned(),
            session_id: session_id.to_owned(),
            snippet_count: snippets.len(),
        }));
        Some(block)
    }

    // ── maintenance ──────────────────────────────────────────────────

    /// Run cluster → summarize → decay for one user. Each pass is
    /// bounded and idempotent; failures are logged per pass and the
    /// remaining passes still run.
    pub async fn maintain_user(&self, user_id: &str) -> MaintenanceReport {
        let params = MaintenanceParams {
            batch: self.cfg.maintenance_batch,
        };
        let mut report = MaintenanceReport::default();

        match self.store.cluster(user_id, &params).await {
            Ok(n) => {
                report.clusters = n;
                self.bus.emit(Event::new(EventPayload::MemoryClusterDone {
                    user_id: user_id.to_owned(),
                    clusters: n,
                }));
            }
            Err(e) => tracing::warn!(user_id = %user_id, error = %e, "cluster pass failed"),
        }

        match self.store.summarize(user_id, &params).await {
            Ok(n) => {
                report.summaries = n;
                self.bus.emit(Event::new(EventPayload::MemorySummaryDone {
                    user_id: user_id.to_owned(),
                    summaries: n,
                }));
            }
            Err(e) => tracing::warn!(user_id = %user_id, error = %e, "summarize pass failed"),
        }

        match self.store.decay(user_id, &params).await {
            Ok(n) => report.decayed = n,
            Err(e) => tracing::warn!(user_id = %user_id, error = %e, "decay pass failed"),
        }

        report
    }

    /// Maintenance over a set of users (the timer tick passes everyone).
    pub async fn maintain(&self, user_ids: &[String]) -> MaintenanceReport {
        let mut total = MaintenanceReport::default();
        if !self.cfg.enabled {
            return total;
        }
        for user_id in user_ids {
            let report = self.maintain_user(user_id).await;
            total.clusters += report.clusters;
            total.summaries += report.summaries;
            total.decayed += report.decayed;
        }
        total
    }

    pub fn maintenance_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.cfg.maintenance_interval_secs.max(1))
    }

    pub fn stats(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            enqueued: self.stats.enqueued.load(Ordering::Relaxed),
            ingested: self.stats.ingested.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            queued: self.queue.lock().len(),
        }
    }

    /// Direct scoped search, used by the graph-view API.
    pub async fn search(
        &self,
        user_id: &str,
        query: &str,
        k: usize,
    ) -> Result<Vec<crate::types::Snippet>> {
        self.store.search(user_id, query, k).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fact extraction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pull salient sentences out of a committed exchange.
///
/// User sentences carry most durable personal state ("my name is…",
/// "I moved to…"), so every substantial user sentence is kept verbatim;
/// the assistant reply is folded into one compact exchange record.
fn extract_facts(candidate: &MemoryCandidate) -> Vec<String> {
    let mut facts = Vec::new();

    for sentence in split_sentences(&candidate.user_text) {
        if facts.len() >= 5 {
            break;
        }
        facts.push(sentence);
    }

    if !candidate.assistant_text.trim().is_empty() {
        let reply = one_line(&candidate.assistant_text, 160);
        let asked = one_line(&candidate.user_text, 100);
        facts.push(format!("Asked \"{asked}\" and was told: {reply}"));
    }

    facts
}

fn split_sentences(text: &str) -> Vec<String> {
    text.split(['.', '!', '?', '\n', '；', '。'])
        .map(str::trim)
        .filter(|s| {
            let words = s.split_whitespace().count();
            words >= 3 && s.chars().count() <= 200
        })
        .map(|s| format!("{s}."))
        .collect()
}

fn one_line(text: &str, max: usize) -> String {
    let joined = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if joined.chars().count() <= max {
        joined
    } else {
        let cut: String = joined.chars().take(max).collect();
        format!("{cut}…")
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
