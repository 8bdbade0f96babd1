//! A hand-rolled in-memory fake of the [`DbPool`]/[`DbSession`] traits,
//! standing in for a real Postgres connection (out of scope for this
//! crate). Exercises the same narrow trait boundary a real
//! `tokio-postgres`-backed adapter would, so these tests double as a
//! contract check on that boundary.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pg_reactive_stream::db::{DbError, DbPool, DbSession, Param, Row};
use serde_json::{Value, json};

#[derive(Debug, Clone)]
pub struct FakeDbError {
    pub message: String,
    pub code: Option<String>,
}

impl std::fmt::Display for FakeDbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}
impl std::error::Error for FakeDbError {}
impl DbError for FakeDbError {
    fn sqlstate(&self) -> Option<&str> {
        self.code.as_deref()
    }
}

struct State {
    slots: Vec<String>,
    /// Queued `(lsn, data)` rows returned on the next `get_changes` call.
    pending_changes: Vec<(String, String)>,
    /// When set, the next `get_changes` call fails once with `42704`.
    inject_missing_slot: bool,
    next_lsn: u64,
    decoder_missing: bool,
    drop_errors: bool,
}

/// Cheaply cloneable fake pool backing both the general pool interface and
/// the Slot Manager's dedicated session, so tests can inspect/drive catalog
/// state and inject wal2json payloads from outside the tailer.
#[derive(Clone)]
pub struct FakePool {
    state: Arc<Mutex<State>>,
}

impl FakePool {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                slots: Vec::new(),
                pending_changes: Vec::new(),
                inject_missing_slot: false,
                next_lsn: 1,
                decoder_missing: false,
                drop_errors: false,
            })),
        }
    }

    pub fn decoder_missing(self) -> Self {
        self.state.lock().unwrap().decoder_missing = true;
        self
    }

    pub fn drop_errors(self) -> Self {
        self.state.lock().unwrap().drop_errors = true;
        self
    }

    /// Queue a wal2json `data` payload (a JSON object with a `change`
    /// array) to be returned by the next poll.
    pub fn push_change(&self, data: Value) {
        let mut state = self.state.lock().unwrap();
        let lsn = state.next_lsn;
        state.next_lsn += 1;
        state.pending_changes.push((lsn.to_string(), data.to_string()));
    }

    /// Simulate an operator dropping the slot: the next `get_changes` call
    /// fails with `42704`, recovered by the one-shot slot-recreate path.
    pub fn inject_slot_missing(&self) {
        self.state.lock().unwrap().inject_missing_slot = true;
    }

    pub fn slot_names(&self) -> Vec<String> {
        self.state.lock().unwrap().slots.clone()
    }

    fn handle_query(&self, sql: &str, params: &[Param]) -> Result<Vec<Row>, Box<dyn DbError>> {
        let mut state = self.state.lock().unwrap();

        if sql.contains("pg_create_logical_replication_slot") {
            if state.decoder_missing {
                return Err(Box::new(FakeDbError {
                    message: "wal2json is not installed".to_string(),
                    code: Some("58P01".to_string()),
                }));
            }
            if let Some(Param::Text(name)) = params.first() {
                state.slots.push(name.clone());
            }
            return Ok(vec![]);
        }

        if sql.contains("pg_drop_replication_slot") {
            if state.drop_errors {
                return Err(Box::new(FakeDbError {
                    message: "drop failed".to_string(),
                    code: None,
                }));
            }
            if let Some(Param::Text(name)) = params.first() {
                state.slots.retain(|s| s != name);
            }
            return Ok(vec![]);
        }

        if sql.contains("pg_logical_slot_get_changes") {
            if state.inject_missing_slot {
                state.inject_missing_slot = false;
                return Err(Box::new(FakeDbError {
                    message: "replication slot does not exist".to_string(),
                    code: Some("42704".to_string()),
                }));
            }
            let rows = std::mem::take(&mut state.pending_changes)
                .into_iter()
                .map(|(lsn, data)| {
                    let mut row = Row::new();
                    row.insert("lsn".to_string(), json!(lsn));
                    row.insert("data".to_string(), json!(data));
                    row
                })
                .collect();
            return Ok(rows);
        }

        if sql.contains("pg_replication_slots") {
            return Ok(state
                .slots
                .iter()
                .map(|name| {
                    let mut row = Row::new();
                    row.insert("slot_name".to_string(), json!(name));
                    row
                })
                .collect());
        }

        Ok(vec![])
    }
}

/// `ChangeTailer` expects an owned `Box<dyn DbSession>`; the fake session
/// holds the same ref-counted state the pool does, so the Slot Manager's
/// dedicated session and general-pool queries observe one shared catalog.
pub struct OwnedFakeSession {
    pool: FakePool,
}

#[async_trait]
impl DbSession for OwnedFakeSession {
    async fn query(&self, sql: &str, params: &[Param]) -> Result<Vec<Row>, Box<dyn DbError>> {
        self.pool.handle_query(sql, params)
    }

    async fn release(self: Box<Self>) {}
}

#[async_trait]
impl DbPool for FakePool {
    async fn acquire(&self) -> Result<Box<dyn DbSession>, Box<dyn DbError>> {
        Ok(Box::new(OwnedFakeSession { pool: self.clone() }))
    }

    async fn query(&self, sql: &str, params: &[Param]) -> Result<Vec<Row>, Box<dyn DbError>> {
        self.handle_query(sql, params)
    }
}

pub fn insert_change(schema: &str, table: &str, columns: &[(&str, Value)]) -> Value {
    json!({
        "change": [{
            "kind": "insert",
            "schema": schema,
            "table": table,
            "columnnames": columns.iter().map(|(k, _)| k.to_string()).collect::<Vec<_>>(),
            "columntypes": columns.iter().map(|_| "text".to_string()).collect::<Vec<_>>(),
            "columnvalues": columns.iter().map(|(_, v)| v.clone()).collect::<Vec<_>>(),
        }]
    })
}

pub fn update_change(schema: &str, table: &str, columns: &[(&str, Value)]) -> Value {
    json!({
        "change": [{
            "kind": "update",
            "schema": schema,
            "table": table,
            "columnnames": columns.iter().map(|(k, _)| k.to_string()).collect::<Vec<_>>(),
            "columntypes": columns.iter().map(|_| "text".to_string()).collect::<Vec<_>>(),
            "columnvalues": columns.iter().map(|(_, v)| v.clone()).collect::<Vec<_>>(),
        }]
    })
}

pub fn delete_change(schema: &str, table: &str, keys: &[(&str, Value)]) -> Value {
    json!({
        "change": [{
            "kind": "delete",
            "schema": schema,
            "table": table,
            "oldkeys": {
                "keynames": keys.iter().map(|(k, _)| k.to_string()).collect::<Vec<_>>(),
                "keytypes": keys.iter().map(|_| "text".to_string()).collect::<Vec<_>>(),
                "keyvalues": keys.iter().map(|(_, v)| v.clone()).collect::<Vec<_>>(),
            }
        }]
    })
}
