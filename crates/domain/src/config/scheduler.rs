use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Global worker pool size.
    #[serde(default = "d_workers")]
    pub workers: usize,
    /// Bounded depth of each per-session FIFO; overflow is `Busy`.
    #[serde(default = "d_queue_depth")]
    pub queue_depth: usize,
    /// How long `enqueue` waits for a free worker before `Busy`.
    #[serde(default = "d_enqueue_wait_ms")]
    pub enqueue_wait_ms: u64,
    /// Retry budget for retriable turn failures.
    #[serde(default = "d_retry_max")]
    pub retry_max: u32,
    /// Backoff base; attempt `n` waits `base · 2^n` plus jitter.
    #[serde(default = "d_retry_base_ms")]
    pub retry_base_ms: u64,
    /// How long a worker lingers on an empty session queue before
    /// releasing its pool slot.
    #[serde(default = "d_idle_linger_secs")]
    pub idle_linger_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: d_workers(),
            queue_depth: d_queue_depth(),
            enqueue_wait_ms: d_enqueue_wait_ms(),
            retry_max: d_retry_max(),
            retry_base_ms: d_retry_base_ms(),
            idle_linger_secs: d_idle_linger_secs(),
        }
    }
}

fn d_workers() -> usize {
    8
}
fn d_queue_depth() -> usize {
    32
}
fn d_enqueue_wait_ms() -> u64 {
    2_000
}
fn d_retry_max() -> u32 {
    3
}
fn d_retry_base_ms() -> u64 {
    500
}
fn d_idle_linger_secs() -> u64 {
    60
}
