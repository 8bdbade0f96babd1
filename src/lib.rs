//! Turns a Postgres logical replication slot into a push-based stream of
//! row-level change events, and uses that stream to keep the results of
//! user-supplied queries continuously fresh.
//!
//! Two subsystems carry the design:
//!
//! - the **Change Tailer** ([`tailer`], [`slot`], [`poller`], [`decoder`],
//!   [`stream`]): lifecycle of a temporary logical replication slot,
//!   periodic extraction and decoding of WAL records, and a multicast
//!   [`stream::ChangeStream`] of typed [`model::ChangeEvent`]s;
//! - the **Reactive Query Runner** ([`runner`]): a per-subscription engine
//!   that re-runs an async query when table/event-keyed predicate handlers
//!   accept a change as an invalidation, coalescing concurrent
//!   invalidations into at most one queued re-run.
//!
//! The database driver and connection pool are out of scope for this
//! crate; callers bring their own implementation of the narrow [`db`]
//! traits, or enable the `tokio-postgres-adapter` feature for a reference
//! implementation.

pub mod config;
pub mod db;
pub mod decoder;
pub mod errors;
pub mod model;
pub mod poller;
pub mod runner;
pub mod slot;
pub mod stream;
pub mod tailer;
pub mod tracing_context;

pub use config::StreamConfig;
pub use errors::{ReplicationError, ReplicationResult};
pub use model::{ChangeEvent, ColumnMap, EventKind};
pub use runner::{HandlerMap, QueryFn, QueryObserver, QueryRunnerHandle, TableHandlers};
pub use stream::{ChangeObserver, ChangeStream, SubscriptionId};
pub use tailer::ChangeTailer;
