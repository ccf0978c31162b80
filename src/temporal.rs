// ⏰ Temporal Model - Bounds and history that merges must respect
//
// Two rules live here:
// 1. Temporal bounds: a merge keeps the EARLIEST creation evidence and the
//    LATEST update evidence. An unknown update date never beats a known one.
// 2. Adjacent history compaction: a run of consecutive equivalent snapshots
//    collapses to its first element. A value that changed and later reverted
//    keeps every endpoint.

use chrono::{DateTime, Utc};

use crate::entities::UserDetail;

// ============================================================================
// TEMPORAL BOUNDS
// ============================================================================

/// Latest known date; None only when both are unknown
pub fn latest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

// ============================================================================
// ADJACENT HISTORY COMPACTION
// ============================================================================

/// Result of planning a compaction over one User's history
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryCompaction {
    /// Snapshots kept, in chronological order
    pub retained: Vec<String>,

    /// Snapshots to detach and delete
    pub removed: Vec<String>,
}

impl HistoryCompaction {
    pub fn is_noop(&self) -> bool {
        self.removed.is_empty()
    }
}

/// Plan the compaction of a chronologically ordered history.
///
/// Each snapshot is compared against the last *retained* one, so a run of
/// N equivalent neighbours collapses to its first element. The first
/// snapshot is always retained. Input must already be sorted by
/// creation date (ties in fetch order).
pub fn compact_adjacent(history: &[UserDetail]) -> HistoryCompaction {
    let mut plan = HistoryCompaction::default();
    let mut predecessor: Option<&UserDetail> = None;

    for detail in history {
        match predecessor {
            Some(previous) if previous.is_equivalent(detail) => {
                plan.removed.push(detail.object_id.clone());
            }
            _ => {
                plan.retained.push(detail.object_id.clone());
                predecessor = Some(detail);
            }
        }
    }

    plan
}

/// Stable chronological sort used before compaction
pub fn sort_history(history: &mut [UserDetail]) {
    history.sort_by(|a, b| a.creation_date.cmp(&b.creation_date));
}

// ============================================================================
// TESTS
// ============================================================================
