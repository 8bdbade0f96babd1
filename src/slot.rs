//! Slot Manager (C1): lifecycle of a temporary logical replication slot.

use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::db::{DbError, DbSession, Param, SQLSTATE_DECODER_MISSING};
use crate::errors::{ReplicationError, ReplicationResult};

/// Minimum number of random decimal digits for a generated slot id (§9:
/// "≥ 12 decimal digits is sufficient").
const RANDOM_SLOT_ID_DIGITS: usize = 15;

/// Generate a random decimal slot id with at least [`RANDOM_SLOT_ID_DIGITS`]
/// digits, derived from a v4 UUID rather than pulling in a dedicated RNG
/// crate (uuid is already on the dependency tree).
pub fn random_slot_id() -> String {
    let mut out = Uuid::new_v4().as_u128().to_string();
    while out.len() < RANDOM_SLOT_ID_DIGITS {
        out.push_str(&Uuid::new_v4().as_u128().to_string());
    }
    out.truncate(RANDOM_SLOT_ID_DIGITS.max(1));
    if out.starts_with('0') {
        out.replace_range(0..1, "1");
    }
    out
}

/// Owns the held database session and the name of the slot created on it.
pub struct SlotManager {
    session: Box<dyn DbSession>,
    slot_name: String,
}

impl SlotManager {
    /// Create a temporary logical replication slot on a freshly acquired
    /// session, using the wal2json decoder plugin.
    #[instrument(skip(session), fields(slot_name))]
    pub async fn create(session: Box<dyn DbSession>, slot_id: &str) -> ReplicationResult<Self> {
        let slot_name = format!("app_slot_{slot_id}");
        tracing::Span::current().record("slot_name", &slot_name.as_str());

        if let Err(e) = Self::create_slot(session.as_ref(), &slot_name).await {
            // Slot creation failed: the acquired session would otherwise be
            // leaked from the pool's perspective (Drop on a trait object
            // can't await a release call), so release it explicitly before
            // propagating.
            session.release().await;
            return Err(e);
        }
        info!(slot_name = %slot_name, "created logical replication slot");

        Ok(Self { session, slot_name })
    }

    async fn create_slot(session: &dyn DbSession, slot_name: &str) -> ReplicationResult<()> {
        let result = session
            .query(
                "select pg_catalog.pg_create_logical_replication_slot($1, $2, $3)",
                &[
                    Param::Text(slot_name.to_string()),
                    Param::Text("wal2json".to_string()),
                    Param::Text("true".to_string()),
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => Err(Self::classify_create_error(e.as_ref())),
        }
    }

    fn classify_create_error(err: &dyn DbError) -> ReplicationError {
        match err.sqlstate() {
            Some(SQLSTATE_DECODER_MISSING) => ReplicationError::decoder_missing(format!(
                "wal2json decoder plugin is not installed on the server: {err}"
            )),
            Some(code) => ReplicationError::database_with_code(err.to_string(), code),
            None => ReplicationError::database(err.to_string()),
        }
    }

    pub fn slot_name(&self) -> &str {
        &self.slot_name
    }

    pub fn session(&self) -> &dyn DbSession {
        self.session.as_ref()
    }

    /// Recreate the slot on the same session after it was found missing
    /// (§4.1 recovery path). Consumed by the poller's one-shot retry.
    #[instrument(skip(self), fields(slot_name = %self.slot_name))]
    pub async fn recreate(&self) -> ReplicationResult<()> {
        warn!(slot_name = %self.slot_name, "replication slot missing, recreating");
        Self::create_slot(self.session.as_ref(), &self.slot_name).await
    }

    /// Best-effort drop; errors are swallowed so teardown always completes.
    #[instrument(skip(self), fields(slot_name = %self.slot_name))]
    pub async fn drop_slot(&self) {
        let result = self
            .session
            .query(
                "select pg_catalog.pg_drop_replication_slot($1)",
                &[Param::Text(self.slot_name.clone())],
            )
            .await;

        if let Err(e) = result {
            warn!(slot_name = %self.slot_name, error = %e, "failed to drop replication slot, ignoring");
        }
    }

    /// Consume self and return the held session to the pool.
    pub async fn release(self) {
        self.session.release().await;
    }
}

/// List currently-registered replication slots (used by property tests and
/// diagnostics; §6 inspection statement).
pub async fn list_slots(
    pool: &dyn crate::db::DbPool,
) -> ReplicationResult<Vec<crate::db::Row>> {
    pool.query(
        "select slot_name, plugin, slot_type, database, temporary, active from pg_replication_slots",
        &[],
    )
    .await
    .map_err(|e| crate::db::database_error(e.as_ref()))
}
