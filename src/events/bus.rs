//! `EventBus`: in-memory ring plus bounded subscriber mailboxes.
//!
//! A bounded `VecDeque` snapshot serves late-joining subscribers and
//! dashboard polls; a live fan-out path serves subscribers that are
//! already attached.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::events::store::EventStore;
use crate::model::Event;

/// Per-subscriber mailbox bound.
const DEFAULT_MAILBOX_CAPACITY: usize = 32;

struct Subscriber {
    session_filter: Option<String>,
    tx: mpsc::Sender<Event>,
}

struct Inner {
    ring: VecDeque<Event>,
    capacity: usize,
    subscribers: Vec<(String, Subscriber)>,
}

/// Process-wide singleton. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Inner>>,
    store: Option<Arc<EventStore>>,
    mailbox_capacity: usize,
    /// Count of events dropped because a subscriber's mailbox was full.
    /// The only observable trace of the bus's non-blocking drop policy.
    dropped: Arc<AtomicU64>,
}

/// Handle returned by `subscribe`: the receiving half plus a close token
/// that unregisters the mailbox when dropped.
pub struct Subscription {
    pub rx: mpsc::Receiver<Event>,
    id: String,
    bus: EventBus,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.id);
    }
}

impl EventBus {
    pub fn new(ring_capacity: usize) -> Self {
        Self::with_mailbox_capacity(ring_capacity, DEFAULT_MAILBOX_CAPACITY)
    }

    pub fn with_mailbox_capacity(ring_capacity: usize, mailbox_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                ring: VecDeque::with_capacity(ring_capacity),
                capacity: ring_capacity,
                subscribers: Vec::new(),
            })),
            store: None,
            mailbox_capacity,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_store(mut self, store: Arc<EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Append to the ring (evicting the head when full), fan out to live
    /// subscribers without blocking, and forward to the store if attached.
    /// Store failures are logged and never propagate.
    pub fn publish(&self, event: Event) {
        let mut inner = self.inner.lock();
        if inner.ring.len() == inner.capacity && inner.capacity > 0 {
            inner.ring.pop_front();
        }
        inner.ring.push_back(event.clone());

        inner.subscribers.retain(|(_, sub)| {
            if let Some(filter) = &sub.session_filter {
                if event.session_id.as_deref() != Some(filter.as_str()) {
                    return true;
                }
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!("subscriber mailbox full, dropping event");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        drop(inner);

        if let Some(store) = &self.store {
            let store = store.clone();
            tokio::spawn(async move {
                if let Err(err) = store.record_event(&event).await {
                    debug!(error = %err, "event store write failed, dropping");
                }
            });
        }
    }

    /// Snapshot of the tail of the ring after filtering by session id.
    pub fn recent(&self, session_filter: Option<&str>, limit: usize) -> Vec<Event> {
        let inner = self.inner.lock();
        inner
            .ring
            .iter()
            .rev()
            .filter(|e| match session_filter {
                Some(f) => e.session_id.as_deref() == Some(f),
                None => true,
            })
            .take(limit)
            .cloned()
            .rev()
            .collect()
    }

    /// Register a bounded mailbox, optionally filtered to one session.
    pub fn subscribe(&self, session_filter: Option<String>) -> Subscription {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.mailbox_capacity);
        self.inner.lock().subscribers.push((id.clone(), Subscriber { session_filter, tx }));
        Subscription { rx, id, bus: self.clone() }
    }

    fn unsubscribe(&self, id: &str) {
        self.inner.lock().subscribers.retain(|(sid, _)| sid != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// Total events dropped across all subscribers because a mailbox was
    /// full at publish time. Monotonically increasing for the life of the
    /// bus.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
