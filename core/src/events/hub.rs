//! # Event Hub
//!
//! One process-wide instance owns the log ring and the set of live
//! observers. It is constructed once in `main` and handed around as
//! `Arc<EventHub>`; there is no global.
//!
//! ## Ordering guarantees
//!
//! `insert` appends and fans out while holding the hub lock, and
//! `subscribe` snapshots the backlog and registers the observer under the
//! same lock. An observer therefore sees every record exactly once: either
//! in its backlog or as a live event, never both and never neither.
//!
//! ## Slow and dead observers
//!
//! Each observer has a bounded queue fed with `try_send`. A full queue or a
//! dropped receiver removes the observer on the spot. Producers never wait
//! on consumers.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::config::OBSERVER_QUEUE_CAPACITY;

use super::record::{LogRecord, NewRecord};
use super::redact::Redactor;
use super::sink::{HubStats, LogRing, Order};

// ---------------------------------------------------------------------------
// Observer identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ObserverId(u64);

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obs-{}", self.0)
    }
}

/// Transport flavour of an observer. Only used for logging and stats;
/// delivery is identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ObserverKind {
    Stream,
    Socket,
}

struct ObserverSlot {
    kind: ObserverKind,
    tx: mpsc::Sender<LogRecord>,
}

struct HubState {
    ring: LogRing,
    observers: BTreeMap<ObserverId, ObserverSlot>,
}

// ---------------------------------------------------------------------------
// EventHub
// ---------------------------------------------------------------------------

pub struct EventHub {
    state: Mutex<HubState>,
    redactor: Redactor,
    next_observer: AtomicU64,
    queue_capacity: usize,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self::with_queue_capacity(capacity, OBSERVER_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(capacity: usize, queue_capacity: usize) -> Self {
        Self {
            state: Mutex::new(HubState {
                ring: LogRing::new(capacity),
                observers: BTreeMap::new(),
            }),
            redactor: Redactor::new(),
            next_observer: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Stamp, redact, store and fan out a new event. Returns the stored
    /// (redacted) record.
    pub fn insert(&self, event: NewRecord) -> LogRecord {
        let mut record = event.stamp();
        self.redactor.redact_record(&mut record);

        let mut state = self.state.lock();
        state.ring.push(record.clone());
        Self::fan_out(&mut state, &record);
        record
    }

    /// Push an already-stored record to every live observer. Returns how
    /// many observers accepted it.
    pub fn broadcast(&self, record: &LogRecord) -> usize {
        let mut state = self.state.lock();
        Self::fan_out(&mut state, record)
    }

    fn fan_out(state: &mut HubState, record: &LogRecord) -> usize {
        let mut delivered = 0;
        state.observers.retain(|id, slot| match slot.tx.try_send(record.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!(observer = %id, kind = ?slot.kind, "observer queue full, disconnecting");
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(observer = %id, kind = ?slot.kind, "observer gone, removing");
                false
            }
        });
        delivered
    }

    /// Register a new observer. The returned subscription yields the
    /// current backlog first, then every record inserted afterwards.
    pub fn subscribe(self: &Arc<Self>, kind: ObserverKind) -> Subscription {
        let id = ObserverId(self.next_observer.fetch_add(1, AtomicOrdering::Relaxed));
        let (tx, rx) = mpsc::channel(self.queue_capacity);

        let backlog = {
            let mut state = self.state.lock();
            let backlog: VecDeque<LogRecord> = state.ring.all().into();
            state.observers.insert(id, ObserverSlot { kind, tx });
            backlog
        };

        tracing::debug!(observer = %id, ?kind, backlog = backlog.len(), "observer subscribed");

        Subscription {
            id,
            kind,
            backlog,
            rx,
            hub: Arc::clone(self),
        }
    }

    /// Remove an observer. Returns `false` if it was already gone, so a
    /// connection is only ever removed once.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let removed = self.state.lock().observers.remove(&id).is_some();
        if removed {
            tracing::debug!(observer = %id, "observer unsubscribed");
        }
        removed
    }

    pub fn observer_count(&self) -> usize {
        self.state.lock().observers.len()
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().ring.capacity()
    }

    pub fn len(&self) -> usize {
        self.state.lock().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().ring.is_empty()
    }

    // -- Queries ------------------------------------------------------------

    pub fn all(&self) -> Vec<LogRecord> {
        self.state.lock().ring.all()
    }

    pub fn recent(&self, limit: usize, order: Order) -> Vec<LogRecord> {
        self.state.lock().ring.recent(limit, order)
    }

    pub fn recent_of_type(&self, limit: usize, kind: Option<&str>, order: Order) -> Vec<LogRecord> {
        self.state.lock().ring.recent_of_type(limit, kind, order)
    }

    pub fn between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        kind: Option<&str>,
    ) -> Vec<LogRecord> {
        self.state.lock().ring.between(start, end, kind)
    }

    pub fn stats(&self) -> HubStats {
        let state = self.state.lock();
        state.ring.stats(state.observers.len())
    }
}

impl fmt::Debug for EventHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("EventHub")
            .field("records", &state.ring.len())
            .field("capacity", &state.ring.capacity())
            .field("observers", &state.observers.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// A live observer handle. Dropping it deregisters the observer.
pub struct Subscription {
    id: ObserverId,
    kind: ObserverKind,
    backlog: VecDeque<LogRecord>,
    rx: mpsc::Receiver<LogRecord>,
    hub: Arc<EventHub>,
}

impl Subscription {
    pub fn id(&self) -> ObserverId {
        self.id
    }

    pub fn kind(&self) -> ObserverKind {
        self.kind
    }

    /// Take the backlog in one piece, for transports that send it as a
    /// single message. Subsequent `next` calls only yield live records.
    pub fn take_backlog(&mut self) -> Vec<LogRecord> {
        self.backlog.drain(..).collect()
    }

    /// Next record: backlog first, then live. `None` once the hub has
    /// dropped this observer (queue overflow).
    pub async fn next(&mut self) -> Option<LogRecord> {
        if let Some(record) = self.backlog.pop_front() {
            return Some(record);
        }
        self.rx.recv().await
    }

    /// Non-blocking variant of [`next`](Self::next).
    pub fn try_next(&mut self) -> Option<LogRecord> {
        self.backlog
            .pop_front()
            .or_else(|| self.rx.try_recv().ok())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("backlog", &self.backlog.len())
            .finish()
    }
}
