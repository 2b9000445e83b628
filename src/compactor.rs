use std::time::Duration;

use tracing::{info, warn};

use crate::store::MemoryStore;

/// Periodically rewrites the WAL once more than `threshold` events have been
/// appended since the last rewrite.
pub async fn run_compactor(store: MemoryStore, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        compact_if_needed(&store, threshold).await;
    }
}

/// One compactor pass. Returns true if the log was rewritten.
pub async fn compact_if_needed(store: &MemoryStore, threshold: u64) -> bool {
    let appends = match store.wal_appends_since_compact().await {
        Ok(n) => n,
        Err(e) => {
            warn!("cannot read WAL append count: {e}");
            return false;
        }
    };
    if appends < threshold {
        return false;
    }
    match store.compact().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}
