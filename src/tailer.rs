//! Change Tailer: wires the Slot Manager (C1), Change Poller (C2), and
//! Change Stream (C4) into one owning handle, and implements the Teardown
//! Coordinator (C6)'s ordered, idempotent shutdown.
//!
//! This is the crate's main entry point: callers go through
//! [`ChangeTailer::start`] rather than constructing the components
//! individually.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{instrument, warn};

use crate::config::StreamConfig;
use crate::db::{DbPool, database_error};
use crate::errors::ReplicationResult;
use crate::poller::ChangePoller;
use crate::slot::{SlotManager, random_slot_id};
use crate::stream::ChangeStream;

/// Owning handle for one stream's slot, session, and poll loop (I1: "A
/// Change Stream owns exactly one slot and exactly one held database
/// session for its entire lifetime").
pub struct ChangeTailer {
    stream: Arc<ChangeStream>,
    poller: AsyncMutex<Option<ChangePoller>>,
    slot: AsyncMutex<Option<Arc<SlotManager>>>,
    torn_down: AtomicBool,
}

impl ChangeTailer {
    /// Create the slot, acquire its dedicated session, and start polling.
    /// Fails fast (before any polling starts) if the decoder plugin is
    /// missing or the session can't be acquired.
    #[instrument(skip(pool, config), fields(slot_id))]
    pub async fn start(pool: &dyn DbPool, config: StreamConfig) -> ReplicationResult<Arc<Self>> {
        let slot_id = config.slot_id.clone().unwrap_or_else(random_slot_id);
        tracing::Span::current().record("slot_id", &slot_id.as_str());

        let session = pool.acquire().await.map_err(|e| database_error(e.as_ref()))?;
        let slot = Arc::new(SlotManager::create(session, &slot_id).await?);

        let stream = ChangeStream::new();
        let config = Arc::new(config);
        let poller = ChangePoller::spawn(config, slot.clone(), stream.clone());

        Ok(Arc::new(Self {
            stream,
            poller: AsyncMutex::new(Some(poller)),
            slot: AsyncMutex::new(Some(slot)),
            torn_down: AtomicBool::new(false),
        }))
    }

    /// The change stream subscribers attach to. Stable for the tailer's
    /// whole lifetime, including after teardown (§4.6: post-teardown
    /// subscriptions get an immediate complete with no events, handled by
    /// [`ChangeStream`] itself).
    pub fn stream(&self) -> Arc<ChangeStream> {
        self.stream.clone()
    }

    /// Ordered, idempotent shutdown (§4.6):
    /// 1. stop the poller (awaiting any in-flight poll),
    /// 2. best-effort drop the slot,
    /// 3. release the held session,
    /// 4. complete the change stream.
    #[instrument(skip(self))]
    pub async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(mut poller) = self.poller.lock().await.take() {
            poller.stop().await;
        }

        if let Some(slot) = self.slot.lock().await.take() {
            slot.drop_slot().await;
            match Arc::try_unwrap(slot) {
                Ok(slot) => slot.release().await,
                Err(_) => {
                    warn!(
                        "slot manager still referenced after poller stopped, session left unreleased"
                    );
                }
            }
        }

        self.stream.complete();
    }
}
