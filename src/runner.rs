//! Reactive Query Runner (C5): runs a user query, consults per-table/
//! per-event predicate handlers against the change stream, and coalesces
//! invalidations so a query is at most once in flight and at most one
//! further run is ever queued behind it.
//!
//! Handler evaluation for a given runner is strictly sequential (one change
//! at a time, in delivery order) since it all happens inside a single
//! driver task pulling off one channel; query execution itself runs in a
//! spawned task so that evaluating further handlers never blocks on a slow
//! query, and the driver task is free to fold additional invalidations into
//! `queued` while a run is in flight.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use tracing::{instrument, warn};

use crate::errors::ReplicationError;
use crate::model::{ChangeEvent, ColumnMap, EventKind};
use crate::stream::{ChangeObserver, ChangeStream, SubscriptionId};

/// Receives results and terminal notifications from a [`QueryRunner`].
#[async_trait]
pub trait QueryObserver<R>: Send + Sync {
    async fn on_next(&self, value: &R);
    async fn on_error(&self, err: &ReplicationError);
    /// The upstream change stream completed (not an error); no further runs
    /// will occur. Default no-op: most callers only care about `on_next`.
    async fn on_complete(&self) {}
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// The query thunk: re-invoked once per accepted invalidation burst.
pub type QueryFn<R> = Arc<dyn Fn() -> BoxFuture<Result<R, ReplicationError>> + Send + Sync>;

/// A predicate over an event's payload (`row` for insert/update, `identity`
/// for delete) and the previous result, deciding whether this change
/// invalidates the last run. `R` must be `Clone` so the runner can hand the
/// previous value to a handler while also retaining it for the next
/// notification.
pub type Handler<R> =
    Arc<dyn Fn(ColumnMap, Option<R>) -> BoxFuture<bool> + Send + Sync>;

/// Handlers for one table, keyed by event kind. A missing entry for a kind
/// means "ignore" (§4.5).
pub struct TableHandlers<R> {
    pub insert: Option<Handler<R>>,
    pub update: Option<Handler<R>>,
    pub delete: Option<Handler<R>>,
}

// Derived `Default`/`Clone` would add a spurious `R: Default`/`R: Clone`
// bound on the whole struct (neither field actually needs it: they're
// `Option<Arc<..>>`), so these are written out by hand.
impl<R> Default for TableHandlers<R> {
    fn default() -> Self {
        Self { insert: None, update: None, delete: None }
    }
}

impl<R> Clone for TableHandlers<R> {
    fn clone(&self) -> Self {
        Self {
            insert: self.insert.clone(),
            update: self.update.clone(),
            delete: self.delete.clone(),
        }
    }
}

impl<R> TableHandlers<R> {
    fn for_kind(&self, kind: EventKind) -> Option<&Handler<R>> {
        match kind {
            EventKind::Insert => self.insert.as_ref(),
            EventKind::Update => self.update.as_ref(),
            EventKind::Delete => self.delete.as_ref(),
        }
    }
}

/// `table -> { insert?, update?, delete? }`, per §4.5.
pub type HandlerMap<R> = HashMap<String, TableHandlers<R>>;

enum RunnerMessage<R> {
    Change(ChangeEvent),
    UpstreamComplete,
    UpstreamError(Arc<ReplicationError>),
    QueryDone(Result<R, ReplicationError>),
}

/// Forwards a [`ChangeStream`]'s notifications into the runner's driver
/// task via an unbounded channel, so a slow handler backpressures this
/// runner's own processing without ever blocking the producing poll or any
/// other subscriber.
struct StreamForwarder<R> {
    tx: mpsc::UnboundedSender<RunnerMessage<R>>,
}

impl<R: Send + 'static> ChangeObserver for StreamForwarder<R> {
    fn on_next(&self, event: &ChangeEvent) {
        let _ = self.tx.send(RunnerMessage::Change(event.clone()));
    }

    fn on_complete(&self) {
        let _ = self.tx.send(RunnerMessage::UpstreamComplete);
    }

    fn on_error(&self, err: &Arc<ReplicationError>) {
        let _ = self.tx.send(RunnerMessage::UpstreamError(err.clone()));
    }
}

/// Handle to a live runner. Dropping this handle does not unsubscribe;
/// call [`QueryRunnerHandle::unsubscribe`] explicitly (mirrors
/// [`ChangeStream`]'s own subscription handles).
pub struct QueryRunnerHandle {
    changes: Arc<ChangeStream>,
    subscription: SubscriptionId,
    unsubscribed: Arc<AtomicBool>,
    /// Wakes the driver task out of `rx.recv().await` on unsubscribe even
    /// when no further change/query-result message will ever arrive to do
    /// it naturally (the task itself holds a live `Sender`, so the channel
    /// never closes on its own).
    stop: Arc<Notify>,
}

impl QueryRunnerHandle {
    /// Detach from the change stream. Idempotent. Any in-flight query is
    /// allowed to run to completion; its result is discarded. No new query
    /// is started and no further handler invocations occur (§4.5).
    #[instrument(skip(self))]
    pub fn unsubscribe(&self) {
        if self.unsubscribed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.changes.unsubscribe(self.subscription);
        self.stop.notify_one();
    }
}

/// Runs `query_fn` and re-runs it on coalesced invalidations from `changes`,
/// notifying `observer` of each result. Returns a handle the caller uses to
/// unsubscribe; the runner otherwise drives itself via a spawned task.
pub fn spawn<R>(
    changes: Arc<ChangeStream>,
    query_fn: QueryFn<R>,
    handlers: HandlerMap<R>,
    observer: Arc<dyn QueryObserver<R>>,
) -> Arc<QueryRunnerHandle>
where
    R: Clone + Send + Sync + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<RunnerMessage<R>>();
    let unsubscribed = Arc::new(AtomicBool::new(false));
    let stop = Arc::new(Notify::new());

    // Subscribe before the initial query runs, so invalidations arriving
    // while it's in flight are buffered in the channel rather than lost.
    let subscription = changes.subscribe(Arc::new(StreamForwarder { tx: tx.clone() }));

    let handle = Arc::new(QueryRunnerHandle {
        changes: changes.clone(),
        subscription,
        unsubscribed: unsubscribed.clone(),
        stop: stop.clone(),
    });

    tokio::spawn(async move {
        let mut running = false;
        let mut queued = false;
        let mut last_result: Option<R> = None;

        match query_fn().await {
            Ok(value) => {
                last_result = Some(value);
                if !unsubscribed.load(Ordering::SeqCst) {
                    observer.on_next(last_result.as_ref().expect("just set")).await;
                }
            }
            Err(err) => {
                if !unsubscribed.load(Ordering::SeqCst) {
                    observer.on_error(&err).await;
                }
                return;
            }
        }

        loop {
            let message = tokio::select! {
                _ = stop.notified() => break,
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            if unsubscribed.load(Ordering::SeqCst) {
                // No further runs, no further handler invocations (§4.5).
                // An in-flight query keeps running to completion; its
                // result lands on a now-closed channel and is dropped by
                // `spawn_run`'s send-error branch instead of leaking this
                // task parked on a channel that will never close.
                break;
            }
            match message {
                RunnerMessage::Change(event) => {
                    let Some(table_handlers) = handlers.get(event.table()) else {
                        continue;
                    };
                    let Some(handler) = table_handlers.for_kind(event.kind()) else {
                        continue;
                    };
                    let is_invalidation =
                        handler(event.payload().clone(), last_result.clone()).await;
                    if unsubscribed.load(Ordering::SeqCst) || !is_invalidation {
                        continue;
                    }
                    if !running {
                        running = true;
                        spawn_run(query_fn.clone(), tx.clone());
                    } else if !queued {
                        queued = true;
                    }
                    // running && queued: already covered, drop silently.
                }
                RunnerMessage::QueryDone(Ok(value)) => {
                    last_result = Some(value);
                    if !unsubscribed.load(Ordering::SeqCst) {
                        observer.on_next(last_result.as_ref().expect("just set")).await;
                    }
                    if queued {
                        queued = false;
                        spawn_run(query_fn.clone(), tx.clone());
                    } else {
                        running = false;
                    }
                }
                RunnerMessage::QueryDone(Err(err)) => {
                    if !unsubscribed.load(Ordering::SeqCst) {
                        observer.on_error(&err).await;
                    }
                    return;
                }
                RunnerMessage::UpstreamError(err) => {
                    if !unsubscribed.load(Ordering::SeqCst) {
                        observer.on_error(&err).await;
                    }
                    return;
                }
                RunnerMessage::UpstreamComplete => {
                    if !unsubscribed.load(Ordering::SeqCst) {
                        observer.on_complete().await;
                    }
                    return;
                }
            }
        }
    });

    handle
}

fn spawn_run<R>(query_fn: QueryFn<R>, tx: mpsc::UnboundedSender<RunnerMessage<R>>)
where
    R: Send + 'static,
{
    tokio::spawn(async move {
        let result = query_fn().await;
        if tx.send(RunnerMessage::QueryDone(result)).is_err() {
            warn!("query runner channel closed before result could be delivered");
        }
    });
}
