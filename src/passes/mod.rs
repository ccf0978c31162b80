// 🧹 Reconciliation Passes - One sweep per entity kind
//
// Every pass has the same shape:
//   1. snapshot candidate ids (oldest first)
//   2. for each candidate: check cancellation, then merge its group inside
//      one IMMEDIATE transaction (read, plan and apply see the same state)
//   3. a group that keeps conflicting after the configured retries, or that
//      fails on its own data, is skipped and logged; the pass moves on and
//      the next run picks the group up again
//
// Only fatal errors (see `CleansingError::is_fatal`) end a pass early.
//
// Passes never hold a transaction across an await point and never share a
// connection: every group is its own `Store::perform` context.

pub mod account;
pub mod data_asset;
pub mod user;

use serde::Serialize;
use std::future::Future;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::CleansingConfig;
use crate::db::Store;
use crate::error::{CleansingError, Result};

pub use account::{cleanse_accounts, reconcile_account};
pub use data_asset::{cleanse_data_assets, reconcile_data_asset};
pub use user::{cleanse_users, compact_user_history, reconcile_account_user, reconcile_user};

// ============================================================================
// PASS IDENTITY + REPORTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassKind {
    Account,
    User,
    DataAsset,
}

impl PassKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassKind::Account => "account",
            PassKind::User => "user",
            PassKind::DataAsset => "data_asset",
        }
    }
}

impl std::fmt::Display for PassKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to one candidate's group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GroupOutcome {
    /// Candidate was deleted (or never existed) before it was reached
    Missing,

    /// Candidate has no identity key, or no duplicates
    Unique,

    /// Duplicates were folded into the survivor
    Merged { removed: usize, moved_children: usize },
}

/// What one history compaction did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompactionOutcome {
    pub retained: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PassReport {
    pub pass: PassKind,
    pub candidates: usize,
    pub groups_merged: usize,
    pub entities_removed: usize,
    pub children_moved: usize,
    pub histories_compacted: usize,
    pub details_removed: usize,
    pub conflicts_skipped: usize,
    pub groups_failed: usize,
    pub elapsed_ms: u64,
}

impl PassReport {
    pub fn new(pass: PassKind) -> Self {
        PassReport {
            pass,
            candidates: 0,
            groups_merged: 0,
            entities_removed: 0,
            children_moved: 0,
            histories_compacted: 0,
            details_removed: 0,
            conflicts_skipped: 0,
            groups_failed: 0,
            elapsed_ms: 0,
        }
    }

    pub fn record_group(&mut self, outcome: GroupOutcome) {
        if let GroupOutcome::Merged { removed, moved_children } = outcome {
            self.groups_merged += 1;
            self.entities_removed += removed;
            self.children_moved += moved_children;
        }
    }

    pub fn record_compaction(&mut self, outcome: CompactionOutcome) {
        if outcome.removed > 0 {
            self.histories_compacted += 1;
            self.details_removed += outcome.removed;
        }
    }

    pub(crate) fn finish(mut self, started: Instant) -> Self {
        self.elapsed_ms = started.elapsed().as_millis() as u64;
        self
    }
}

// ============================================================================
// PASS CONTEXT
// ============================================================================

/// Everything a pass needs, cheap to clone into spawned units
#[derive(Debug, Clone)]
pub struct PassContext {
    pub store: Store,
    pub config: CleansingConfig,
    pub cancel: CancellationToken,
}

impl PassContext {
    pub fn new(store: Store, config: CleansingConfig) -> Self {
        PassContext {
            store,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Cooperative cancellation point, taken between groups
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(CleansingError::Cancelled);
        }
        Ok(())
    }
}

/// Run one transactional unit, retrying it on write conflicts.
///
/// Returns `Ok(None)` when the unit still conflicts after
/// `conflict_retries` extra attempts. Every other error propagates.
pub(crate) async fn with_conflict_retry<T, F, Fut>(
    ctx: &PassContext,
    pass: PassKind,
    object_id: &str,
    mut unit: F,
) -> Result<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        match unit().await {
            Ok(value) => return Ok(Some(value)),
            Err(err) if err.is_conflict() && attempt < ctx.config.conflict_retries => {
                attempt += 1;
                debug!(pass = %pass, object_id, attempt, error = %err, "retrying conflicting group");
                ctx.check_cancelled()?;
            }
            Err(err) if err.is_conflict() => {
                warn!(pass = %pass, object_id, error = %err, "skipping group after repeated conflicts");
                return Ok(None);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Fold one unit's result into the pass report.
///
/// Successes pass through. Conflicts and non-fatal failures are counted and
/// become `Ok(None)` so the pass continues with the next group. Fatal errors
/// propagate.
pub(crate) fn settle_group<T>(
    report: &mut PassReport,
    object_id: &str,
    result: Result<Option<T>>,
) -> Result<Option<T>> {
    match result {
        Ok(Some(value)) => Ok(Some(value)),
        Ok(None) => {
            report.conflicts_skipped += 1;
            Ok(None)
        }
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            warn!(pass = %report.pass, object_id, error = %err, "skipping failed group");
            report.groups_failed += 1;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn ctx(retries: u32) -> PassContext {
        PassContext::new(
            Store::open_in_memory().unwrap(),
            CleansingConfig::new().with_conflict_retries(retries),
        )
    }

    #[test]
    fn test_report_counts_only_merges() {
        let mut report = PassReport::new(PassKind::User);
        report.record_group(GroupOutcome::Missing);
        report.record_group(GroupOutcome::Unique);
        report.record_group(GroupOutcome::Merged { removed: 2, moved_children: 5 });
        report.record_compaction(CompactionOutcome { retained: 3, removed: 0 });
        report.record_compaction(CompactionOutcome { retained: 1, removed: 4 });

        assert_eq!(report.groups_merged, 1);
        assert_eq!(report.entities_removed, 2);
        assert_eq!(report.children_moved, 5);
        assert_eq!(report.histories_compacted, 1);
        assert_eq!(report.details_removed, 4);
    }

    #[tokio::test]
    async fn test_conflict_is_retried_then_succeeds() {
        let ctx = ctx(1);
        let calls = Arc::new(AtomicU32::new(0));

        let result = with_conflict_retry(&ctx, PassKind::Account, "a", || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(CleansingError::TransactionConflict("busy".to_string()))
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_persistent_conflict_is_skipped() {
        let ctx = ctx(2);
        let calls = Arc::new(AtomicU32::new(0));

        let result: Option<()> = with_conflict_retry(&ctx, PassKind::DataAsset, "a", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CleansingError::TransactionConflict("locked".to_string()))
            }
        })
        .await
        .unwrap();

        assert_eq!(result, None);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_other_errors_propagate() {
        let ctx = ctx(5);

        let err = with_conflict_retry(&ctx, PassKind::User, "a", || async {
            Err::<(), _>(CleansingError::StoreUnavailable("gone".to_string()))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, CleansingError::StoreUnavailable(_)));
    }

    #[test]
    fn test_group_failures_are_counted_not_raised() {
        let mut report = PassReport::new(PassKind::Account);

        assert_eq!(settle_group(&mut report, "a", Ok(Some(1))).unwrap(), Some(1));
        assert_eq!(settle_group::<i32>(&mut report, "b", Ok(None)).unwrap(), None);

        let corrupt = Err(CleansingError::Sqlite(rusqlite::Error::InvalidQuery));
        assert_eq!(settle_group::<i32>(&mut report, "c", corrupt).unwrap(), None);

        assert_eq!(report.conflicts_skipped, 1);
        assert_eq!(report.groups_failed, 1);
    }

    #[test]
    fn test_fatal_errors_end_the_pass() {
        let mut report = PassReport::new(PassKind::User);

        let err = settle_group::<()>(&mut report, "a", Err(CleansingError::Cancelled)).unwrap_err();
        assert!(err.is_cancelled());

        let err = settle_group::<()>(&mut report, "b", Err(CleansingError::Worker("lost".to_string()))).unwrap_err();
        assert!(matches!(err, CleansingError::Worker(_)));
        assert_eq!(report.groups_failed, 0);
    }

    #[test]
    fn test_cancellation_point() {
        let ctx = ctx(0);
        assert!(ctx.check_cancelled().is_ok());

        ctx.cancel.cancel();
        assert!(ctx.check_cancelled().unwrap_err().is_cancelled());
    }
}
