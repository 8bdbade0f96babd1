//! Narrow interface onto the database driver/connection pool.
//!
//! The driver itself is out of scope for this crate: callers bring their
//! own pool implementing these traits. An optional `tokio-postgres`-backed
//! adapter is provided behind the `tokio-postgres-adapter` feature as a
//! reference implementation, not as the only supported one.

use async_trait::async_trait;
use serde_json::Value;

/// A single returned row: column name to JSON-ish value. Concrete adapters
/// are responsible for converting their native row type into this shape.
pub type Row = std::collections::BTreeMap<String, Value>;

/// Catalog error codes this crate recognizes and reacts to.
pub const SQLSTATE_DECODER_MISSING: &str = "58P01";
pub const SQLSTATE_SLOT_MISSING: &str = "42704";

/// Narrow error surface a driver error must expose for slot-recovery logic
/// to key off of, without this crate depending on a concrete driver error
/// type.
pub trait DbError: std::error::Error + Send + Sync + 'static {
    /// The Postgres SQLSTATE code, if the error originated from the server.
    fn sqlstate(&self) -> Option<&str>;
}

/// A query parameter. Adapters accept whatever their concrete driver wants;
/// this crate only ever passes strings and nulls across the trait boundary
/// (slot names, the `add-tables` filter, and `NULL` for unbounded LSNs).
#[derive(Debug, Clone)]
pub enum Param {
    Text(String),
    Null,
}

/// A single exclusive database session: the Slot Manager's connection for
/// the stream's lifetime, and the connection handlers may use for queries
/// scoped outside the general pool.
#[async_trait]
pub trait DbSession: Send + Sync {
    async fn query(
        &self,
        sql: &str,
        params: &[Param],
    ) -> Result<Vec<Row>, Box<dyn DbError>>;

    /// Return this session to the pool. Idempotent.
    async fn release(self: Box<Self>);
}

/// The general connection pool: used for user queries, handler queries, and
/// slot inspection, but never for the Slot Manager's own session.
#[async_trait]
pub trait DbPool: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn DbSession>, Box<dyn DbError>>;

    async fn query(
        &self,
        sql: &str,
        params: &[Param],
    ) -> Result<Vec<Row>, Box<dyn DbError>>;
}

/// Convert a generic driver error into this crate's error type. Callers
/// that care about slot-recovery semantics should inspect `sqlstate()`
/// directly before falling back to this.
pub fn database_error(err: &dyn DbError) -> crate::errors::ReplicationError {
    match err.sqlstate() {
        Some(code) => crate::errors::ReplicationError::database_with_code(err.to_string(), code),
        None => crate::errors::ReplicationError::database(err.to_string()),
    }
}

#[cfg(feature = "tokio-postgres-adapter")]
pub mod tokio_postgres_adapter {
    //! Reference [`DbPool`]/[`DbSession`] built on `tokio_postgres`.
    //!
    //! Grounded in the connection-setup style used across the retrieval
    //! pack's CDC connectors: a single live connection driven by a spawned
    //! background task, with `Client` handed out to callers.

    use super::*;
    use std::fmt;
    use tokio_postgres::types::Type;
    use tokio_postgres::{Client, NoTls};

    #[derive(Debug)]
    pub struct PgDbError(tokio_postgres::Error);

    impl fmt::Display for PgDbError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl std::error::Error for PgDbError {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    impl DbError for PgDbError {
        fn sqlstate(&self) -> Option<&str> {
            self.0.code().map(|c| c.code())
        }
    }

    fn row_to_map(row: &tokio_postgres::Row) -> Row {
        let mut out = Row::new();
        for (idx, column) in row.columns().iter().enumerate() {
            let value = match column.type_() {
                &Type::TEXT | &Type::VARCHAR => row
                    .try_get::<_, Option<String>>(idx)
                    .ok()
                    .flatten()
                    .map(Value::String)
                    .unwrap_or(Value::Null),
                _ => row
                    .try_get::<_, Option<String>>(idx)
                    .ok()
                    .flatten()
                    .map(Value::String)
                    .unwrap_or(Value::Null),
            };
            out.insert(column.name().to_string(), value);
        }
        out
    }

    fn bind<'a>(params: &'a [Param]) -> Vec<Option<&'a str>> {
        params
            .iter()
            .map(|p| match p {
                Param::Text(s) => Some(s.as_str()),
                Param::Null => None,
            })
            .collect()
    }

    pub struct PgSession {
        client: Client,
    }

    #[async_trait]
    impl DbSession for PgSession {
        async fn query(
            &self,
            sql: &str,
            params: &[Param],
        ) -> Result<Vec<Row>, Box<dyn DbError>> {
            let bound = bind(params);
            let refs: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = bound
                .iter()
                .map(|p| p as &(dyn tokio_postgres::types::ToSql + Sync))
                .collect();
            let rows = self
                .client
                .query(sql, &refs)
                .await
                .map_err(|e| Box::new(PgDbError(e)) as Box<dyn DbError>)?;
            Ok(rows.iter().map(row_to_map).collect())
        }

        async fn release(self: Box<Self>) {}
    }

    pub struct PgPool {
        connection_string: String,
    }

    impl PgPool {
        pub fn new(connection_string: impl Into<String>) -> Self {
            Self { connection_string: connection_string.into() }
        }

        async fn connect(&self) -> Result<Client, Box<dyn DbError>> {
            let (client, connection) = tokio_postgres::connect(&self.connection_string, NoTls)
                .await
                .map_err(|e| Box::new(PgDbError(e)) as Box<dyn DbError>)?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!(error = %e, "postgres connection task ended");
                }
            });
            Ok(client)
        }
    }

    #[async_trait]
    impl DbPool for PgPool {
        async fn acquire(&self) -> Result<Box<dyn DbSession>, Box<dyn DbError>> {
            let client = self.connect().await?;
            Ok(Box::new(PgSession { client }))
        }

        async fn query(
            &self,
            sql: &str,
            params: &[Param],
        ) -> Result<Vec<Row>, Box<dyn DbError>> {
            let client = self.connect().await?;
            let bound = bind(params);
            let refs: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = bound
                .iter()
                .map(|p| p as &(dyn tokio_postgres::types::ToSql + Sync))
                .collect();
            let rows = client
                .query(sql, &refs)
                .await
                .map_err(|e| Box::new(PgDbError(e)) as Box<dyn DbError>)?;
            Ok(rows.iter().map(row_to_map).collect())
        }
    }
}
