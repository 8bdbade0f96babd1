//! Typed row-change events produced by the [`crate::decoder`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single column value as surfaced by the decoder. Kept as the raw JSON
/// value the decoder plugin emitted, so callers get round-trip fidelity
/// without this crate guessing at type coercion.
pub type ColumnMap = BTreeMap<String, Value>;

/// A decoded row-level change, tagged by kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ChangeEvent {
    Insert { table: String, row: ColumnMap },
    Update { table: String, row: ColumnMap },
    Delete { table: String, identity: ColumnMap },
}

impl ChangeEvent {
    /// The qualified table name this event concerns.
    pub fn table(&self) -> &str {
        match self {
            ChangeEvent::Insert { table, .. } => table,
            ChangeEvent::Update { table, .. } => table,
            ChangeEvent::Delete { table, .. } => table,
        }
    }

    /// The short event-kind tag, used to key handler lookups.
    pub fn kind(&self) -> EventKind {
        match self {
            ChangeEvent::Insert { .. } => EventKind::Insert,
            ChangeEvent::Update { .. } => EventKind::Update,
            ChangeEvent::Delete { .. } => EventKind::Delete,
        }
    }

    /// The payload-bearing column map, whichever field it lives in for this
    /// variant. Handler predicates are dispatched against this rather than
    /// matching structurally on the enum shape.
    pub fn payload(&self) -> &ColumnMap {
        match self {
            ChangeEvent::Insert { row, .. } => row,
            ChangeEvent::Update { row, .. } => row,
            ChangeEvent::Delete { identity, .. } => identity,
        }
    }
}

/// Event-kind tag, independent of payload, used as a handler-map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Insert,
    Update,
    Delete,
}
