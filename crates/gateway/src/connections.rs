//! Live transport connections and briefly-retained turn results.
//!
//! A binding ties a transport connection to an authenticated user (and
//! optionally a session). When a client drops mid-turn the turn runs to
//! completion server-side; the final reply parks in the recent-results
//! map so a reconnecting client fetches it exactly once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use palaver_bus::EventBus;
use palaver_domain::events::{Event, EventPayload};
use palaver_domain::frame::Frame;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
pub struct ConnectionBinding {
    pub connection_id: String,
    pub user_id: String,
    pub session_id: Option<String>,
    pub transport: String,
    /// Outbound frame channel; sends serialize per connection.
    pub tx: mpsc::Sender<Frame>,
}

struct RecentResult {
    user_id: String,
    content: String,
    stored_at: Instant,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, ConnectionBinding>>,
    recent: Mutex<HashMap<String, RecentResult>>,
    recent_ttl: Duration,
    bus: Arc<EventBus>,
}

impl ConnectionRegistry {
    pub fn new(recent_ttl: Duration, bus: Arc<EventBus>) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            recent: Mutex::new(HashMap::new()),
            recent_ttl,
            bus,
        }
    }

    // ── bindings ─────────────────────────────────────────────────────

    /// Bind an authenticated connection; returns its id.
    pub fn bind(
        &self,
        user_id: &str,
        session_id: Option<&str>,
        transport: &str,
        tx: mpsc::Sender<Frame>,
    ) -> String {
        let connection_id = uuid::Uuid::new_v4().to_string();
        let binding = ConnectionBinding {
            connection_id: connection_id.clone(),
            user_id: user_id.to_owned(),
            session_id: session_id.map(str::to_owned),
            transport: transport.to_owned(),
            tx,
        };
        self.connections
            .lock()
            .insert(connection_id.clone(), binding);
        self.bus.emit(Event::new(EventPayload::ConnectionBound {
            connection_id: connection_id.clone(),
            user_id: user_id.to_owned(),
            transport: transport.to_owned(),
        }));
        connection_id
    }

    /// Remove a binding. Idempotent; only the first removal emits.
    pub fn unbind(&self, connection_id: &str) {
        if self.connections.lock().remove(connection_id).is_some() {
            self.bus.emit(Event::new(EventPayload::ConnectionClosed {
                connection_id: connection_id.to_owned(),
            }));
        }
    }

    /// Send one frame to one connection. `false` when the connection is
    /// gone or its channel is full (slow consumer).
    pub fn send(&self, connection_id: &str, frame: Frame) -> bool {
        let tx = match self.connections.lock().get(connection_id) {
            Some(binding) => binding.tx.clone(),
            None => return false,
        };
        tx.try_send(frame).is_ok()
    }

    /// Fan a frame out to every connection bound to `user_id`.
    pub fn broadcast(&self, user_id: &str, frame: Frame) -> usize {
        let targets: Vec<mpsc::Sender<Frame>> = self
            .connections
            .lock()
            .values()
            .filter(|b| b.user_id == user_id)
            .map(|b| b.tx.clone())
            .collect();
        targets
            .into_iter()
            .filter(|tx| tx.try_send(frame.clone()).is_ok())
            .count()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    // ── recent results ───────────────────────────────────────────────

    /// Retain a completed turn's final text for reconnect pickup.
    pub fn retain_result(&self, user_id: &str, session_id: &str, content: &str) {
        self.recent.lock().insert(
            session_id.to_owned(),
            RecentResult {
                user_id: user_id.to_owned(),
                content: content.to_owned(),
                stored_at: Instant::now(),
            },
        );
    }

    /// Fetch-and-remove the retained result for a session. Scoped: a
    /// caller who does not own the session sees nothing.
    pub fn take_recent(&self, user_id: &str, session_id: &str) -> Option<String> {
        let mut recent = self.recent.lock();
        match recent.get(session_id) {
            Some(result) if result.user_id == user_id => {
                Some(recent.remove(session_id).expect("checked present").content)
            }
            _ => None,
        }
    }

    /// Drop retained results older than the TTL.
    pub fn sweep_recent(&self) -> usize {
        let mut recent = self.recent.lock();
        let before = recent.len();
        recent.retain(|_, r| r.stored_at.elapsed() < self.recent_ttl);
        before - recent.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_registry() -> ConnectionRegistry {
        ConnectionRegistry::new(Duration::from_secs(120), Arc::new(EventBus::new()))
    }

    #[tokio::test]
    async fn bind_send_unbind_roundtrip() {
        let registry = make_registry();
        let (tx, mut rx) = mpsc::channel(4);
        let id = registry.bind("u1", Some("s1"), "sse", tx);
        assert_eq!(registry.connection_count(), 1);

        assert!(registry.send(
            &id,
            Frame::Text {
                content: "hi".into()
            }
        ));
        assert!(matches!(rx.recv().await, Some(Frame::Text { .. })));

        registry.unbind(&id);
        registry.unbind(&id); // idempotent
        assert_eq!(registry.connection_count(), 0);
        assert!(!registry.send(
            &id,
            Frame::Text {
                content: "gone".into()
            }
        ));
    }

    #[tokio::test]
    async fn broadcast_reaches_only_that_user() {
        let registry = make_registry();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        registry.bind("u1", None, "sse", tx1);
        registry.bind("u2", None, "sse", tx2);

        let sent = registry.broadcast(
            "u1",
            Frame::Text {
                content: "only u1".into(),
            },
        );
        assert_eq!(sent, 1);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn recent_results_are_scoped_and_single_shot() {
        let registry = make_registry();
        registry.retain_result("u1", "s1", "the reply");

        // Wrong owner sees nothing, and does not consume it.
        assert!(registry.take_recent("u2", "s1").is_none());
        assert_eq!(
            registry.take_recent("u1", "s1").as_deref(),
            Some("the reply")
        );
        // Fetched exactly once.
        assert!(registry.take_recent("u1", "s1").is_none());
    }

    #[test]
    fn sweep_drops_expired_results() {
        let registry = ConnectionRegistry::new(Duration::from_millis(0), Arc::new(EventBus::new()));
        registry.retain_result("u1", "s1", "stale");
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(registry.sweep_recent(), 1);
        assert!(registry.take_recent("u1", "s1").is_none());
    }
}
