//! Fan-out of engine events to the sessions joined to a document.
//!
//! Every session owns one bounded mailbox ([`EventSink`]). A document's
//! [`BroadcastGroup`] holds the mailboxes of its subscribers; publishing
//! wraps the event in an `Arc` once and `try_send`s it to each of them, so
//! the publisher never waits on a slow connection.
//!
//! ```text
//! publish(doc, event) ──► BroadcastGroup(doc) ──┬──► sink(session A)
//!                                               ├──► sink(session B)
//!                                               └──► sink(session C)
//! send_direct(sink, event) ─────────────────────────► sink(origin only)
//! ```
//!
//! Delivery is at-least-once per connection; recipients de-duplicate by
//! change id / version. A session whose mailbox is full is marked lagging
//! and receives nothing further, so what it did receive is always a gap-free
//! prefix. The engine evicts lagging sessions (see [`take_lagging`]) and the
//! client re-syncs from a fresh snapshot. Devices are never pushed to.
//!
//! [`take_lagging`]: BroadcastDispatcher::take_lagging

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::change::DocumentUri;
use crate::protocol::OutboundEvent;
use crate::session::SessionId;

/// Outbound mailbox of one session.
pub type EventSink = mpsc::Sender<Arc<OutboundEvent>>;

/// Receiving end of an [`EventSink`].
pub type EventStream = mpsc::Receiver<Arc<OutboundEvent>>;

/// Create a session mailbox holding up to `capacity` undelivered events.
pub fn mailbox(capacity: usize) -> (EventSink, EventStream) {
    mpsc::channel(capacity.max(1))
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_documents: usize,
    pub subscriptions: usize,
}

/// Lock-free counters, read via [`BroadcastDispatcher::stats`].
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Subscribers of a single document.
#[derive(Default)]
pub struct BroadcastGroup {
    subscribers: HashMap<SessionId, EventSink>,
}

impl BroadcastGroup {
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.subscribers.contains_key(session_id)
    }
}

/// Document-keyed publish/subscribe.
#[derive(Default)]
pub struct BroadcastDispatcher {
    groups: DashMap<DocumentUri, BroadcastGroup>,
    /// Sessions that missed an event and must be evicted
    lagging: Mutex<HashSet<SessionId>>,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `sink` to events of `uri`. Returns `false` if the session
    /// was already subscribed (its sink is replaced).
    pub fn subscribe(&self, uri: &str, session_id: SessionId, sink: EventSink) -> bool {
        self.groups
            .entry(uri.to_string())
            .or_default()
            .subscribers
            .insert(session_id, sink)
            .is_none()
    }

    /// Remove a subscription; empty groups are dropped.
    pub fn unsubscribe(&self, uri: &str, session_id: SessionId) -> bool {
        let removed = self
            .groups
            .get_mut(uri)
            .is_some_and(|mut group| group.subscribers.remove(&session_id).is_some());
        self.groups.remove_if(uri, |_, group| group.is_empty());
        removed
    }

    /// Deliver `event` to every subscriber of `uri`.
    ///
    /// Returns the number of mailboxes that accepted the event. Full or
    /// closed mailboxes are skipped and counted as dropped; a full one marks
    /// its session lagging.
    pub fn publish(&self, uri: &str, event: OutboundEvent) -> usize {
        let Some(group) = self.groups.get(uri) else {
            return 0;
        };

        let event = Arc::new(event);
        let mut delivered = 0;
        for (session_id, sink) in &group.subscribers {
            if self.deliver(*session_id, sink, event.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver `event` to a single session's mailbox.
    pub fn send_direct(&self, session_id: SessionId, sink: &EventSink, event: OutboundEvent) -> bool {
        self.deliver(session_id, sink, Arc::new(event))
    }

    fn deliver(&self, session_id: SessionId, sink: &EventSink, event: Arc<OutboundEvent>) -> bool {
        if self.lagging.lock().contains(&session_id) {
            self.atomic_stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        match sink.try_send(event) {
            Ok(()) => {
                self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                self.atomic_stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Mailbox of session {session_id} is full, marking it lagging");
                self.lagging.lock().insert(session_id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.atomic_stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("Session {session_id} is gone, event undeliverable");
                false
            }
        }
    }

    /// Take the sessions marked lagging since the last call.
    pub fn take_lagging(&self) -> Vec<SessionId> {
        self.lagging.lock().drain().collect()
    }

    /// Sessions subscribed to `uri`.
    pub fn subscribers(&self, uri: &str) -> Vec<SessionId> {
        self.groups
            .get(uri)
            .map(|group| group.subscribers.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, uri: &str, session_id: &SessionId) -> bool {
        self.groups
            .get(uri)
            .is_some_and(|group| group.contains(session_id))
    }

    /// Documents with at least one subscriber.
    pub fn active_documents(&self) -> Vec<DocumentUri> {
        self.groups.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_documents: self.groups.len(),
            subscriptions: self.groups.iter().map(|g| g.len()).sum(),
        }
    }
}
