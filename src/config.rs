//! Configuration for a change stream.
//!
//! Validation happens eagerly at construction, not deep inside the poll
//! loop: a misconfigured stream should never be created in the first place.

use std::collections::HashMap;

use crate::errors::{ReplicationError, ReplicationResult};

/// Default polling cadence, in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

/// Default schema used to qualify unqualified table names.
pub const DEFAULT_SCHEMA: &str = "public";

/// Default identity columns for a table with no explicit mapping.
pub fn default_identity_columns() -> Vec<String> {
    vec!["id".to_string()]
}

/// Configuration for a single [`crate::stream::ChangeStream`].
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Suffix of the slot name (`app_slot_<slot_id>`). Random if not set
    /// explicitly by the caller.
    pub slot_id: Option<String>,
    /// Poll cadence.
    pub poll_interval_ms: u64,
    /// Schema used to qualify table names that carry no explicit schema.
    pub assume_schema: String,
    /// Per-table identity (not necessarily the database primary key).
    pub primary_key_map: HashMap<String, Vec<String>>,
    /// Tables to include in the slot's change filter. Required, non-empty.
    pub only_include_tables: Vec<String>,
}

impl StreamConfig {
    /// Build and validate a new configuration.
    pub fn new(only_include_tables: Vec<String>) -> ReplicationResult<Self> {
        Self::builder(only_include_tables).build()
    }

    /// Start a builder seeded with the required table list.
    pub fn builder(only_include_tables: Vec<String>) -> StreamConfigBuilder {
        StreamConfigBuilder {
            slot_id: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            assume_schema: DEFAULT_SCHEMA.to_string(),
            primary_key_map: HashMap::new(),
            only_include_tables,
        }
    }

    /// Identity columns declared for `table`, or the default `["id"]`.
    pub fn identity_columns(&self, table: &str) -> Vec<String> {
        self.primary_key_map
            .get(table)
            .cloned()
            .unwrap_or_else(default_identity_columns)
    }

    /// Whether any configured table name is schema-qualified, which fixes
    /// the stream's single-vs-multi-schema emission policy for its whole
    /// lifetime.
    pub fn multi_schema_mode(&self) -> bool {
        self.only_include_tables.iter().any(|t| t.contains('.'))
    }

    /// Qualify a bare table name with `assume_schema`; leave schema-qualified
    /// names untouched.
    pub fn qualify(&self, table: &str) -> String {
        if table.contains('.') {
            table.to_string()
        } else {
            format!("{}.{}", self.assume_schema, table)
        }
    }

    /// Whether `qualified_table` (e.g. `"public.widgets"`) is in the
    /// configured table set. The slot's `add-tables` filter already
    /// guarantees this at the source; decoders call this too as a second,
    /// independent check (I3).
    pub fn includes_table(&self, qualified_table: &str) -> bool {
        self.only_include_tables.iter().any(|t| self.qualify(t) == qualified_table)
    }

    /// The comma-joined `add-tables` filter value passed to
    /// `pg_logical_slot_get_changes`.
    pub fn add_tables_filter(&self) -> String {
        self.only_include_tables
            .iter()
            .map(|t| self.qualify(t))
            .collect::<Vec<_>>()
            .join(",")
    }
}

pub struct StreamConfigBuilder {
    slot_id: Option<String>,
    poll_interval_ms: u64,
    assume_schema: String,
    primary_key_map: HashMap<String, Vec<String>>,
    only_include_tables: Vec<String>,
}

impl StreamConfigBuilder {
    pub fn slot_id<S: Into<String>>(mut self, slot_id: S) -> Self {
        self.slot_id = Some(slot_id.into());
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn assume_schema<S: Into<String>>(mut self, schema: S) -> Self {
        self.assume_schema = schema.into();
        self
    }

    pub fn identity<S: Into<String>>(mut self, table: S, columns: Vec<String>) -> Self {
        self.primary_key_map.insert(table.into(), columns);
        self
    }

    pub fn build(self) -> ReplicationResult<StreamConfig> {
        if self.only_include_tables.is_empty() {
            return Err(ReplicationError::config(
                "only_include_tables must contain at least one table",
            ));
        }
        if self.assume_schema.trim().is_empty() {
            return Err(ReplicationError::config("assume_schema must not be empty"));
        }
        for (table, cols) in &self.primary_key_map {
            if cols.is_empty() {
                return Err(ReplicationError::config(format!(
                    "primary_key_map entry for {table} must list at least one column"
                )));
            }
        }
        if self.poll_interval_ms == 0 {
            return Err(ReplicationError::config("poll_interval_ms must be positive"));
        }

        Ok(StreamConfig {
            slot_id: self.slot_id,
            poll_interval_ms: self.poll_interval_ms,
            assume_schema: self.assume_schema,
            primary_key_map: self.primary_key_map,
            only_include_tables: self.only_include_tables,
        })
    }
}
