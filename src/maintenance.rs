// 🧽 Store Maintenance - Give back the space the passes freed
//
// Reclaim runs on its own temporary connection (see `Store::reclaim`), so
// readers on other connections keep going. Store types without a reclaim
// operation are skipped, not failed.

use serde::Serialize;
use std::time::Instant;
use tracing::{info, warn};

use crate::db::Store;
use crate::error::{CleansingError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReclaimOutcome {
    Reclaimed { bytes_before: i64, bytes_after: i64 },
    Unsupported { store: &'static str },
}

impl ReclaimOutcome {
    pub fn bytes_reclaimed(&self) -> i64 {
        match self {
            ReclaimOutcome::Reclaimed { bytes_before, bytes_after } => (bytes_before - bytes_after).max(0),
            ReclaimOutcome::Unsupported { .. } => 0,
        }
    }
}

/// Vacuum and re-analyze the store, if its type supports it
pub async fn reclaim_store(store: &Store) -> Result<ReclaimOutcome> {
    let started = Instant::now();
    let target = store.clone();

    match tokio::task::spawn_blocking(move || target.reclaim()).await? {
        Ok(stats) => {
            info!(
                bytes_before = stats.bytes_before,
                bytes_after = stats.bytes_after,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "store reclaimed"
            );
            Ok(ReclaimOutcome::Reclaimed {
                bytes_before: stats.bytes_before,
                bytes_after: stats.bytes_after,
            })
        }
        Err(CleansingError::MaintenanceUnsupported(kind)) => {
            info!(store = kind, "store type has no reclaim, skipping");
            Ok(ReclaimOutcome::Unsupported { store: kind })
        }
        Err(err) => {
            warn!(error = %err, "store reclaim failed");
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_is_skipped() {
        let store = Store::open_in_memory().unwrap();
        let outcome = reclaim_store(&store).await.unwrap();

        assert_eq!(outcome, ReclaimOutcome::Unsupported { store: "in-memory" });
        assert_eq!(outcome.bytes_reclaimed(), 0);
    }

    #[tokio::test]
    async fn test_file_store_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("maintenance.sqlite")).unwrap();

        let outcome = reclaim_store(&store).await.unwrap();
        assert!(matches!(outcome, ReclaimOutcome::Reclaimed { .. }));
    }
}
