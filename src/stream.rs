//! Change Stream (C4): a multicast subject of decoded row changes.
//!
//! Implemented as a plain observer list with lock-on-mutation rather than a
//! buffered channel (subscribers need no replay of history before they
//! subscribed).

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::errors::ReplicationError;
use crate::model::ChangeEvent;
use crate::tracing_context::CorrelationId;

/// Receives events fanned out by a [`ChangeStream`]. Implementors must not
/// panic across the call; a panic is caught and isolated so it cannot break
/// delivery to other subscribers, but the offending subscriber's remaining
/// notifications are still attempted on each subsequent event.
pub trait ChangeObserver: Send + Sync {
    fn on_next(&self, event: &ChangeEvent);
    fn on_complete(&self) {}
    fn on_error(&self, _err: &Arc<ReplicationError>) {}
}

/// Handle returned by [`ChangeStream::subscribe`]; dropping it does not
/// unsubscribe, call [`ChangeStream::unsubscribe`] explicitly.
pub type SubscriptionId = u64;

enum Terminal {
    Completed,
    Errored(Arc<ReplicationError>),
}

struct Inner {
    observers: Vec<(SubscriptionId, Arc<dyn ChangeObserver>)>,
    terminal: Option<Terminal>,
}

/// Multicast subject of [`ChangeEvent`]s for one stream's lifetime.
pub struct ChangeStream {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
    /// Minted once per stream and threaded through every log line the slot
    /// manager, poller, and decoder emit for it, so operators can grep one
    /// stream's lifecycle out of a shared log.
    correlation_id: CorrelationId,
}

impl ChangeStream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner { observers: Vec::new(), terminal: None }),
            next_id: AtomicU64::new(1),
            correlation_id: CorrelationId::new(),
        })
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Register an observer. If the stream has already reached a terminal
    /// state, the observer is notified immediately (complete/error) and
    /// never registered (§4.6: post-teardown subscriptions get an
    /// immediate complete with no events).
    pub fn subscribe(&self, observer: Arc<dyn ChangeObserver>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        match &inner.terminal {
            Some(Terminal::Completed) => {
                drop(inner);
                Self::notify_complete(&observer);
            }
            Some(Terminal::Errored(err)) => {
                let err = err.clone();
                drop(inner);
                Self::notify_error(&observer, &err);
            }
            None => {
                inner.observers.push((id, observer));
            }
        }
        id
    }

    /// Idempotent: dropping an already-unknown id is a no-op.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut inner = self.inner.lock();
        inner.observers.retain(|(observer_id, _)| *observer_id != id);
    }

    /// Fan out one event to every currently registered observer, in
    /// registration order. A no-op once the stream has reached a terminal
    /// state.
    pub fn publish(&self, event: ChangeEvent) {
        let observers: Vec<_> = {
            let inner = self.inner.lock();
            if inner.terminal.is_some() {
                return;
            }
            inner.observers.iter().map(|(_, o)| o.clone()).collect()
        };
        for observer in observers {
            let event_ref = &event;
            let result =
                std::panic::catch_unwind(AssertUnwindSafe(|| observer.on_next(event_ref)));
            if result.is_err() {
                warn!("change stream observer panicked during on_next, isolating");
            }
        }
    }

    /// Terminal: no further `publish` calls have any effect. Idempotent.
    pub fn complete(&self) {
        let observers = {
            let mut inner = self.inner.lock();
            if inner.terminal.is_some() {
                return;
            }
            inner.terminal = Some(Terminal::Completed);
            std::mem::take(&mut inner.observers)
        };
        for (_, observer) in observers {
            Self::notify_complete(&observer);
        }
    }

    /// Terminal: analogous to `complete` but with an error. Idempotent.
    pub fn error(&self, err: ReplicationError) {
        let err = Arc::new(err);
        let observers = {
            let mut inner = self.inner.lock();
            if inner.terminal.is_some() {
                return;
            }
            inner.terminal = Some(Terminal::Errored(err.clone()));
            std::mem::take(&mut inner.observers)
        };
        for (_, observer) in observers {
            Self::notify_error(&observer, &err);
        }
    }

    fn notify_complete(observer: &Arc<dyn ChangeObserver>) {
        let _ = std::panic::catch_unwind(AssertUnwindSafe(|| observer.on_complete()));
    }

    fn notify_error(observer: &Arc<dyn ChangeObserver>, err: &Arc<ReplicationError>) {
        let _ = std::panic::catch_unwind(AssertUnwindSafe(|| observer.on_error(err)));
    }
}
