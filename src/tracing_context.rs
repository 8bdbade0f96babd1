//! Correlation ID used to tie every log line a single stream's slot
//! manager, poller, and decoder emit back to one stream instance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

static CORRELATION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Identifies one [`crate::stream::ChangeStream`]'s lifetime across log
/// lines, minted once at stream creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a correlation id from the current timestamp plus a
    /// monotonic counter, so two ids minted in the same millisecond within
    /// one process still sort and grep apart.
    pub fn new() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let counter = CORRELATION_COUNTER.fetch_add(1, Ordering::SeqCst);
        CorrelationId(format!("{timestamp}-{counter}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
