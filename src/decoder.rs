//! Event Decoder (C3): turns raw wal2json records into typed [`ChangeEvent`]s.

use serde::Deserialize;
use serde_json::Value;

use crate::config::StreamConfig;
use crate::errors::{ReplicationError, ReplicationResult};
use crate::model::{ChangeEvent, ColumnMap};

/// The `data` payload of one `pg_logical_slot_get_changes` row, as emitted
/// by wal2json (v1 format; §6).
#[derive(Debug, Deserialize)]
struct Wal2JsonPayload {
    #[serde(default)]
    change: Vec<Wal2JsonChange>,
}

#[derive(Debug, Deserialize)]
struct Wal2JsonChange {
    kind: String,
    schema: String,
    table: String,
    #[serde(default)]
    columnnames: Vec<String>,
    #[serde(default)]
    columnvalues: Vec<Value>,
    #[serde(default)]
    oldkeys: Option<Wal2JsonOldKeys>,
}

#[derive(Debug, Deserialize)]
struct Wal2JsonOldKeys {
    #[serde(default)]
    keynames: Vec<String>,
    #[serde(default)]
    keyvalues: Vec<Value>,
}

/// Decode one raw `data` JSON document into zero or more change events.
/// Unknown `kind` values are dropped for forward compatibility.
pub fn decode_payload(data: &str, config: &StreamConfig) -> ReplicationResult<Vec<ChangeEvent>> {
    let payload: Wal2JsonPayload = serde_json::from_str(data).map_err(|e| {
        ReplicationError::decode_with_context(
            "failed to parse wal2json payload",
            format!("{e}: {data}"),
        )
    })?;

    let mut events = Vec::with_capacity(payload.change.len());
    for change in payload.change {
        if let Some(event) = decode_change(change, config)? {
            events.push(event);
        }
    }
    Ok(events)
}

fn decode_change(
    change: Wal2JsonChange,
    config: &StreamConfig,
) -> ReplicationResult<Option<ChangeEvent>> {
    let raw_table = format!("{}.{}", change.schema, change.table);
    if !config.includes_table(&raw_table) {
        // Defense in depth (I3): the slot's own `add-tables` filter should
        // already guarantee this, but don't trust it blindly.
        return Ok(None);
    }
    let table = emitted_table_name(&raw_table, config);

    let event = match change.kind.as_str() {
        "insert" => ChangeEvent::Insert {
            table,
            row: zip_columns(&change.columnnames, &change.columnvalues),
        },
        "update" => ChangeEvent::Update {
            table,
            row: zip_columns(&change.columnnames, &change.columnvalues),
        },
        "delete" => {
            let oldkeys = change.oldkeys.ok_or_else(|| {
                ReplicationError::decode("delete record missing oldkeys")
            })?;
            let raw_identity = zip_columns(&oldkeys.keynames, &oldkeys.keyvalues);
            let identity = narrow_identity(raw_identity, &table, config);
            ChangeEvent::Delete { table, identity }
        }
        _ => return Ok(None),
    };

    Ok(Some(event))
}

/// Apply the single-vs-multi-schema emission policy (§3): in single-schema
/// mode, the schema prefix is dropped from the emitted table name if it
/// matches the assumed default schema.
fn emitted_table_name(qualified: &str, config: &StreamConfig) -> String {
    if config.multi_schema_mode() {
        qualified.to_string()
    } else {
        let prefix = format!("{}.", config.assume_schema);
        qualified.strip_prefix(&prefix).unwrap_or(qualified).to_string()
    }
}

/// Drop any column the decoder's `oldkeys` carried that isn't part of the
/// table's declared identity (§9: "implementations should explicitly drop
/// non-declared columns from delete events" — a documented correction, the
/// source relies on static typing alone and leaves the raw columns intact
/// at runtime). Columns declared but absent from `oldkeys` are left out
/// entirely rather than surfaced as null (§3.1: "others are absent, not
/// null-valued").
fn narrow_identity(raw: ColumnMap, table: &str, config: &StreamConfig) -> ColumnMap {
    let declared = config.identity_columns(table);
    raw.into_iter().filter(|(column, _)| declared.iter().any(|c| c == column)).collect()
}

fn zip_columns(names: &[String], values: &[Value]) -> ColumnMap {
    names
        .iter()
        .cloned()
        .zip(values.iter().cloned())
        .collect()
}
