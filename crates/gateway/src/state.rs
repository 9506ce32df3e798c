//! Shared application state passed to all API handlers.

use std::sync::Arc;
use std::time::Instant;

use crate::rate_limit::UserRateLimiter;
use crate::runtime::scheduler::Scheduler;
use crate::runtime::TurnRuntime;

#[derive(Clone)]
pub struct AppState {
    /// The service bundle the turn engine runs against.
    pub rt: Arc<TurnRuntime>,
    pub scheduler: Arc<Scheduler>,
    /// Per-user leaky bucket, enforced after auth resolution.
    pub limiter: Arc<UserRateLimiter>,
    pub started_at: Instant,
}
