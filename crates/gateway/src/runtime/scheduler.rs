//! The conversation scheduler.
//!
//! A bounded worker pool (semaphore of `W` permits) over per-session
//! FIFO queues. One worker owns one session at a time and drains its
//! queue in order — session affinity is what makes turns within a
//! session strictly serial. After the queue empties the worker lingers
//! briefly on the session before releasing its slot, so a fast back-
//! and-forth reuses the same worker.
//!
//! Retriable failures (provider 429/5xx before anything streamed) re-
//! run the item in place with exponential backoff plus jitter; the item
//! never leaves the head of its queue. Everything else fails the turn
//! once, visibly.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use palaver_domain::config::SchedulerConfig;
use palaver_domain::{Error, Result};

use super::{turn, TurnRuntime, WorkItem, WorkKind};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct SessionQueue {
    items: VecDeque<WorkItem>,
    notify: Arc<Notify>,
    /// A worker currently owns this session.
    active: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SchedulerStats {
    pub active_sessions: usize,
    pub queued_items: usize,
    pub available_workers: usize,
    pub completed: u64,
    pub failed: u64,
    pub retries: u64,
}

pub struct Scheduler {
    cfg: SchedulerConfig,
    rt: Arc<TurnRuntime>,
    workers: Arc<Semaphore>,
    sessions: Mutex<HashMap<String, SessionQueue>>,
    shutdown: CancellationToken,
    completed: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
}

impl Scheduler {
    pub fn new(cfg: SchedulerConfig, rt: Arc<TurnRuntime>) -> Arc<Self> {
        let workers = Arc::new(Semaphore::new(cfg.workers.max(1)));
        Arc::new(Self {
            cfg,
            rt,
            workers,
            sessions: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        })
    }

    /// A child token for one work item; cancelled by shutdown.
    pub fn work_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    // ── enqueue ──────────────────────────────────────────────────────

    /// Queue a new-turn item. `Busy` when the session queue is full, or
    /// when no worker frees up within the configured wait.
    pub async fn enqueue(self: &Arc<Self>, item: WorkItem) -> Result<()> {
        self.enqueue_inner(item, false).await
    }

    /// Queue a resume item at the head of its session queue. Resume
    /// items bypass the depth bound: they continue work already
    /// admitted.
    pub async fn enqueue_resume(self: &Arc<Self>, item: WorkItem) -> Result<()> {
        self.enqueue_inner(item, true).await
    }

    async fn enqueue_inner(self: &Arc<Self>, item: WorkItem, at_head: bool) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Cancelled("gateway is shutting down".into()));
        }
        let session_id = item.ctx.session_id.clone();

        // Fast path: the session already has a worker — append.
        {
            let mut sessions = self.sessions.lock();
            let queue = sessions.entry(session_id.clone()).or_default();
            if queue.active {
                if !at_head && queue.items.len() >= self.cfg.queue_depth {
                    return Err(Error::Busy(format!(
                        "session queue full ({} items)",
                        queue.items.len()
                    )));
                }
                if at_head {
                    queue.items.push_front(item);
                } else {
                    queue.items.push_back(item);
                }
                queue.notify.notify_one();
                return Ok(());
            }
        }

        // Slow path: claim a worker slot, bounded wait.
        let permit = match tokio::time::timeout(
            Duration::from_millis(self.cfg.enqueue_wait_ms),
            self.workers.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::Cancelled("worker pool closed".into())),
            Err(_) => {
                return Err(Error::Busy("no worker available within the wait bound".into()))
            }
        };

        let notify = {
            let mut sessions = self.sessions.lock();
            let queue = sessions.entry(session_id.clone()).or_default();
            if queue.active {
                // Raced with another enqueue that claimed the session.
                if !at_head && queue.items.len() >= self.cfg.queue_depth {
                    return Err(Error::Busy(format!(
                        "session queue full ({} items)",
                        queue.items.len()
                    )));
                }
                if at_head {
                    queue.items.push_front(item);
                } else {
                    queue.items.push_back(item);
                }
                queue.notify.notify_one();
                return Ok(()); // permit drops, slot returns to the pool
            }
            queue.active = true;
            queue.items.push_back(item);
            queue.notify.clone()
        };

        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.session_worker(session_id, permit, notify).await;
        });
        Ok(())
    }

    // ── worker ───────────────────────────────────────────────────────

    async fn session_worker(
        self: Arc<Self>,
        session_id: String,
        permit: OwnedSemaphorePermit,
        notify: Arc<Notify>,
    ) {
        tracing::debug!(session_id = %session_id, "worker bound to session");
        loop {
            let item = self.sessions.lock().get_mut(&session_id).and_then(|q| q.items.pop_front());

            match item {
                Some(item) => self.process(item).await,
                None => {
                    if self.shutdown.is_cancelled() {
                        let mut sessions = self.sessions.lock();
                        if let Some(queue) = sessions.get_mut(&session_id) {
                            queue.active = false;
                        }
                        sessions.remove(&session_id);
                        break;
                    }
                    // Linger on the session before giving the slot back.
                    let lingered = tokio::time::timeout(
                        Duration::from_secs(self.cfg.idle_linger_secs),
                        notify.notified(),
                    )
                    .await;
                    if lingered.is_ok() {
                        continue; // new work arrived
                    }
                    let mut sessions = self.sessions.lock();
                    if let Some(queue) = sessions.get_mut(&session_id) {
                        if !queue.items.is_empty() {
                            continue; // raced with a late enqueue
                        }
                        queue.active = false;
                    }
                    sessions.remove(&session_id);
                    break;
                }
            }
        }
        tracing::debug!(session_id = %session_id, "worker released session");
        drop(permit);
    }

    async fn process(&self, item: WorkItem) {
        let WorkItem { ctx, kind } = item;
        match kind {
            WorkKind::NewTurn { user_message } => {
                let mut attempt: u32 = 0;
                loop {
                    match turn::run_new_turn(&self.rt, &ctx, &user_message).await {
                        Ok(_) => {
                            self.completed.fetch_add(1, Ordering::Relaxed);
                            return;
                        }
                        Err(e) => {
                            let may_retry = e.is_retriable()
                                && !ctx.any_frames_sent()
                                && attempt < self.cfg.retry_max
                                && !self.shutdown.is_cancelled();
                            if !may_retry {
                                self.failed.fetch_add(1, Ordering::Relaxed);
                                turn::fail_turn(&self.rt, &ctx, &e).await;
                                return;
                            }
                            let delay = e
                                .retry_after()
                                .unwrap_or_else(|| self.backoff(attempt))
                                .min(Duration::from_secs(30));
                            self.retries.fetch_add(1, Ordering::Relaxed);
                            tracing::info!(
                                session_id = %ctx.session_id,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "retrying turn after transient provider failure"
                            );
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                    }
                }
            }
            WorkKind::Resume { state, action } => {
                // Resumes never retry: the turn has already streamed.
                match turn::run_resume(&self.rt, &ctx, state, action).await {
                    Ok(_) => {
                        self.completed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        self.failed.fetch_add(1, Ordering::Relaxed);
                        turn::fail_turn(&self.rt, &ctx, &e).await;
                    }
                }
            }
        }
    }

    /// `base · 2^attempt` plus up to 50% jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.cfg.retry_base_ms.max(1);
        let exp = base.saturating_mul(1u64 << attempt.min(16));
        let jitter = uuid::Uuid::new_v4().as_u128() as u64 % (exp / 2 + 1);
        Duration::from_millis(exp + jitter)
    }

    // ── lifecycle / diagnostics ──────────────────────────────────────

    /// Begin shutdown: stop admitting work, cancel in-flight tokens.
    pub fn begin_shutdown(&self) {
        self.shutdown.cancel();
        let sessions = self.sessions.lock();
        for queue in sessions.values() {
            queue.notify.notify_one();
        }
    }

    /// Wait until every session worker has exited, up to `deadline`.
    /// Returns `true` when fully drained.
    pub async fn drain(&self, deadline: Duration) -> bool {
        let poll = Duration::from_millis(50);
        let started = std::time::Instant::now();
        while started.elapsed() < deadline {
            if self.sessions.lock().values().all(|q| !q.active) {
                return true;
            }
            tokio::time::sleep(poll).await;
        }
        false
    }

    pub fn stats(&self) -> SchedulerStats {
        let sessions = self.sessions.lock();
        SchedulerStats {
            active_sessions: sessions.values().filter(|q| q.active).count(),
            queued_items: sessions.values().map(|q| q.items.len()).sum(),
            available_workers: self.workers.available_permits(),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}
