//! Typed publish/subscribe fabric.
//!
//! Each subscriber owns a bounded mailbox and a dedicated consumer task;
//! [`EventBus::emit`] enqueues to every subscriber of the event's kind in
//! registration order and returns without waiting for handlers. A full
//! mailbox drops its **oldest** event and bumps a counter (surfaced by
//! the doctor endpoint). Handler failures are logged and never reach the
//! emitter or sibling subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use palaver_domain::events::{Event, EventKind};
use palaver_domain::Result;

/// Default per-subscriber mailbox capacity.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An asynchronous event handler. One value may be registered for any
/// number of event kinds; it is invoked sequentially per registration,
/// so a slow handler only delays its own mailbox.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: Event) -> Result<()>;
}

/// Blanket impl so plain async closures wrapped in a newtype are not
/// required for simple subscribers.
#[async_trait::async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, event: Event) -> Result<()> {
        (self)(event).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Mailbox
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Bounded drop-oldest queue feeding one consumer task.
struct Mailbox {
    queue: Mutex<std::collections::VecDeque<Event>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
    delivered: AtomicU64,
}

impl Mailbox {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(std::collections::VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        }
    }

    /// Enqueue, evicting the oldest event when full.
    fn push(&self, event: Event) {
        {
            let mut queue = self.queue.lock();
            if queue.len() == self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    async fn next(&self) -> Option<Event> {
        loop {
            if let Some(event) = self.queue.lock().pop_front() {
                return Some(event);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bus
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Subscription {
    name: String,
    mailbox: Arc<Mailbox>,
}

/// Per-subscriber statistics for diagnostics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SubscriberStats {
    pub name: String,
    pub kind: String,
    pub queued: usize,
    pub delivered: u64,
    pub dropped: u64,
}

pub struct EventBus {
    subscribers: RwLock<HashMap<EventKind, Vec<Subscription>>>,
    mailbox_capacity: usize,
    closed: AtomicBool,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAILBOX_CAPACITY)
    }

    pub fn with_capacity(mailbox_capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            mailbox_capacity: mailbox_capacity.max(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Register `handler` for `kind` under a diagnostic `name`.
    ///
    /// Spawns the consumer task immediately; events emitted after this
    /// call returns are guaranteed to be offered to the new mailbox.
    pub fn subscribe(
        &self,
        kind: EventKind,
        name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) {
        let name = name.into();
        let mailbox = Arc::new(Mailbox::new(self.mailbox_capacity));

        {
            let consumer_name = name.clone();
            let mailbox = mailbox.clone();
            tokio::spawn(async move {
                while let Some(event) = mailbox.next().await {
                    let event_kind = event.kind();
                    if let Err(e) = handler.handle(event).await {
                        tracing::warn!(
                            subscriber = %consumer_name,
                            event = event_kind.as_str(),
                            error = %e,
                            "event handler failed"
                        );
                    }
                    mailbox.delivered.fetch_add(1, Ordering::Relaxed);
                }
            });
        }

        self.subscribers
            .write()
            .entry(kind)
            .or_default()
            .push(Subscription { name, mailbox });
    }

    /// Deliver `event` to every subscriber of its kind, in registration
    /// order. Returns once every mailbox has been offered the event; it
    /// never waits for handlers to run.
    pub fn emit(&self, event: Event) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let kind = event.kind();
        let subscribers = self.subscribers.read();
        let Some(subs) = subscribers.get(&kind) else {
            return;
        };
        for sub in subs {
            sub.mailbox.push(event.clone());
        }
    }

    /// Snapshot of queue depth / delivery / drop counters per subscriber.
    pub fn stats(&self) -> Vec<SubscriberStats> {
        let subscribers = self.subscribers.read();
        let mut out = Vec::new();
        for (kind, subs) in subscribers.iter() {
            for sub in subs {
                out.push(SubscriberStats {
                    name: sub.name.clone(),
                    kind: kind.as_str().to_string(),
                    queued: sub.mailbox.queue.lock().len(),
                    delivered: sub.mailbox.delivered.load(Ordering::Relaxed),
                    dropped: sub.mailbox.dropped.load(Ordering::Relaxed),
                });
            }
        }
        out.sort_by(|a, b| a.kind.cmp(&b.kind).then(a.name.cmp(&b.name)));
        out
    }

    /// Total events dropped across all mailboxes.
    pub fn total_dropped(&self) -> u64 {
        self.stats().iter().map(|s| s.dropped).sum()
    }

    /// Stop accepting emits and let consumer tasks drain and exit.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let subscribers = self.subscribers.read();
        for subs in subscribers.values() {
            for sub in subs {
                sub.mailbox.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_domain::events::EventPayload;
    use palaver_domain::Error;
    use parking_lot::Mutex as PlMutex;
    use std::time::Duration;

    fn text_event(n: usize) -> Event {
        Event::new(EventPayload::ConversationStreamText {
            session_id: "s1".into(),
            content: format!("chunk-{n}"),
        })
    }

    /// Handler that records the content of every text event it sees.
    struct Recorder {
        seen: Arc<PlMutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, event: Event) -> Result<()> {
            if let EventPayload::ConversationStreamText { content, .. } = event.payload {
                self.seen.lock().push(content);
            }
            Ok(())
        }
    }

    async fn settle() {
        // Give consumer tasks a few polls to drain.
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn delivery_preserves_emission_order() {
        let bus = EventBus::new();
        let seen = Arc::new(PlMutex::new(Vec::new()));
        bus.subscribe(
            EventKind::ConversationStreamText,
            "recorder",
            Arc::new(Recorder { seen: seen.clone() }),
        );

        for n in 0..50 {
            bus.emit(text_event(n));
        }
        settle().await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 50);
        for (i, content) in seen.iter().enumerate() {
            assert_eq!(content, &format!("chunk-{i}"));
        }
    }

    #[tokio::test]
    async fn failing_handler_does_not_abort_siblings() {
        let bus = EventBus::new();
        let seen = Arc::new(PlMutex::new(Vec::new()));

        bus.subscribe(
            EventKind::ConversationStreamText,
            "faulty",
            Arc::new(|_event: Event| async {
                Err::<(), _>(Error::Internal("boom".into()))
            }),
        );
        bus.subscribe(
            EventKind::ConversationStreamText,
            "recorder",
            Arc::new(Recorder { seen: seen.clone() }),
        );

        bus.emit(text_event(0));
        bus.emit(text_event(1));
        settle().await;

        assert_eq!(seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        // A handler that blocks until released, letting the mailbox fill.
        let gate = Arc::new(Notify::new());
        let seen = Arc::new(PlMutex::new(Vec::new()));

        struct Gated {
            gate: Arc<Notify>,
            seen: Arc<PlMutex<Vec<String>>>,
        }

        #[async_trait::async_trait]
        impl EventHandler for Gated {
            async fn handle(&self, event: Event) -> Result<()> {
                self.gate.notified().await;
                if let EventPayload::ConversationStreamText { content, .. } = event.payload {
                    self.seen.lock().push(content);
                }
                Ok(())
            }
        }

        let bus = EventBus::with_capacity(4);
        bus.subscribe(
            EventKind::ConversationStreamText,
            "gated",
            Arc::new(Gated {
                gate: gate.clone(),
                seen: seen.clone(),
            }),
        );

        // First event is pulled by the consumer and parks on the gate;
        // the next 4 fill the mailbox; 2 more evict the oldest 2.
        for n in 0..7 {
            bus.emit(text_event(n));
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        for _ in 0..7 {
            gate.notify_one();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        settle().await;

        let stats = bus.stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].dropped, 2);

        // The survivors form a suffix of the emission sequence: drops
        // only ever remove from the front.
        let seen = seen.lock();
        assert_eq!(seen.first().map(String::as_str), Some("chunk-0"));
        assert_eq!(seen.last().map(String::as_str), Some("chunk-6"));
        assert!(!seen.iter().any(|c| c == "chunk-1" || c == "chunk-2"));
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_a_no_op() {
        let bus = EventBus::new();
        bus.emit(text_event(0));
        assert!(bus.stats().is_empty());
    }

    #[tokio::test]
    async fn kinds_are_isolated() {
        let bus = EventBus::new();
        let seen = Arc::new(PlMutex::new(Vec::new()));
        bus.subscribe(
            EventKind::ConversationComplete,
            "recorder",
            Arc::new(Recorder { seen: seen.clone() }),
        );

        bus.emit(text_event(0));
        settle().await;

        assert!(seen.lock().is_empty());
        assert_eq!(bus.stats()[0].delivered, 0);
    }
}
