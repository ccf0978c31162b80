// User pass: fold users sharing a remote id, then compact each survivor's
// history.
//
// Merges run one group at a time in candidate order. Each survivor's
// compaction is spawned right after its merge commits, bounded by a
// semaphore of `max_concurrency` permits. The pass drains every spawned
// compaction before it returns, including on cancellation or error.

use rusqlite::TransactionBehavior;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::{
    settle_group, with_conflict_retry, CompactionOutcome, GroupOutcome, PassContext, PassKind, PassReport,
};
use crate::db::{self, Store};
use crate::deduplication::plan_user_merge;
use crate::error::{CleansingError, Result};
use crate::temporal::{compact_adjacent, sort_history};

/// Result of reconciling one user: its group merge and its survivor's compaction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserReconciliation {
    pub survivor: Option<String>,
    pub merge: GroupOutcome,
    pub compaction: Option<CompactionOutcome>,
}

// ============================================================================
// FULL PASS
// ============================================================================

pub async fn cleanse_users(ctx: &PassContext) -> Result<PassReport> {
    let started = Instant::now();
    let mut report = PassReport::new(PassKind::User);

    let semaphore = Arc::new(Semaphore::new(ctx.config.max_concurrency.max(1)));
    let mut compactions: JoinSet<CompactionUnit> = JoinSet::new();

    let merged = merge_and_schedule(ctx, &semaphore, &mut compactions, &mut report).await;

    // Never return while a compaction is still writing
    let mut first_error = merged.err();
    while let Some(joined) = compactions.join_next().await {
        let settled = match joined {
            Ok((user_object_id, result)) => settle_group(&mut report, &user_object_id, result),
            Err(err) => Err(CleansingError::from(err)),
        };

        match settled {
            Ok(Some(outcome)) => report.record_compaction(outcome),
            Ok(None) => {}
            Err(err) if first_error.is_none() => first_error = Some(err),
            Err(err) => warn!(error = %err, "additional history compaction failure"),
        }
    }

    if let Some(err) = first_error {
        return Err(err);
    }

    let report = report.finish(started);
    info!(
        merged = report.groups_merged,
        removed = report.entities_removed,
        moved = report.children_moved,
        compacted = report.histories_compacted,
        details_removed = report.details_removed,
        skipped = report.conflicts_skipped,
        failed = report.groups_failed,
        "user pass finished"
    );
    Ok(report)
}

/// A finished compaction task: the user it compacted and how it went
type CompactionUnit = (String, Result<Option<CompactionOutcome>>);

async fn merge_and_schedule(
    ctx: &PassContext,
    semaphore: &Arc<Semaphore>,
    compactions: &mut JoinSet<CompactionUnit>,
    report: &mut PassReport,
) -> Result<()> {
    let candidates = ctx.store.perform(|conn| db::get_user_ids(conn)).await?;
    report.candidates = candidates.len();

    let mut scheduled = HashSet::new();

    for object_id in candidates {
        ctx.check_cancelled()?;

        let store = ctx.store.clone();
        let result = with_conflict_retry(ctx, PassKind::User, &object_id, || {
            merge_user_group(store.clone(), object_id.clone())
        })
        .await;

        let Some((outcome, survivor)) = settle_group(report, &object_id, result)? else {
            continue;
        };
        report.record_group(outcome);

        let Some(survivor) = survivor else { continue };
        if !scheduled.insert(survivor.clone()) {
            continue;
        }

        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CleansingError::Worker("compaction semaphore closed".to_string()))?;

        let unit_ctx = ctx.clone();
        compactions.spawn(async move {
            let _permit = permit;
            if let Err(err) = unit_ctx.check_cancelled() {
                return (survivor, Err(err));
            }

            let store = unit_ctx.store.clone();
            let result = with_conflict_retry(&unit_ctx, PassKind::User, &survivor, || {
                compact_history_unit(store.clone(), survivor.clone())
            })
            .await;
            (survivor, result)
        });
    }

    Ok(())
}

// ============================================================================
// SINGLE-ENTITY OPERATIONS
// ============================================================================

/// Merge one user's remote-id group, then compact the survivor's history
pub async fn reconcile_user(ctx: &PassContext, object_id: &str) -> Result<UserReconciliation> {
    ctx.check_cancelled()?;

    let store = ctx.store.clone();
    let merged = with_conflict_retry(ctx, PassKind::User, object_id, || {
        merge_user_group(store.clone(), object_id.to_string())
    })
    .await?;

    let Some((merge, survivor)) = merged else {
        return Ok(UserReconciliation { survivor: None, merge: GroupOutcome::Unique, compaction: None });
    };

    let compaction = match &survivor {
        Some(survivor) => Some(compact_user_history(ctx, survivor).await?),
        None => None,
    };

    Ok(UserReconciliation { survivor, merge, compaction })
}

/// Reconcile the user an account is signed in as.
///
/// Returns None when the account is gone or not yet bound to a user.
pub async fn reconcile_account_user(
    ctx: &PassContext,
    account_object_id: &str,
) -> Result<Option<UserReconciliation>> {
    let account_id = account_object_id.to_string();
    let candidate = ctx
        .store
        .perform(move |conn| {
            let Some(account) = db::get_account(conn, &account_id)? else {
                return Ok(None);
            };
            let Some(remote_id) = account.user_id else {
                return Ok(None);
            };
            Ok(db::get_users_by_remote_id(conn, &remote_id)?
                .into_iter()
                .next()
                .map(|user| user.object_id))
        })
        .await?;

    match candidate {
        Some(user_object_id) => Ok(Some(reconcile_user(ctx, &user_object_id).await?)),
        None => {
            debug!(account = account_object_id, "account has no user to reconcile");
            Ok(None)
        }
    }
}

/// Collapse adjacent equivalent snapshots in one user's history
pub async fn compact_user_history(ctx: &PassContext, user_object_id: &str) -> Result<CompactionOutcome> {
    ctx.check_cancelled()?;

    let store = ctx.store.clone();
    let outcome = with_conflict_retry(ctx, PassKind::User, user_object_id, || {
        compact_history_unit(store.clone(), user_object_id.to_string())
    })
    .await?;

    Ok(outcome.unwrap_or_default())
}

// ============================================================================
// TRANSACTIONAL UNITS
// ============================================================================

/// Returns the outcome plus the id of the user left holding the history
async fn merge_user_group(store: Store, candidate_id: String) -> Result<(GroupOutcome, Option<String>)> {
    store
        .perform(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let Some(candidate) = db::get_user(&tx, &candidate_id)? else {
                return Ok((GroupOutcome::Missing, None));
            };
            let Some(remote_id) = candidate.id.clone() else {
                return Ok((GroupOutcome::Unique, Some(candidate.object_id)));
            };

            let group = db::get_users_by_remote_id(&tx, &remote_id)?;
            let member_ids: Vec<String> = group.iter().map(|u| u.object_id.clone()).collect();
            let children = db::get_user_details_for_users(&tx, &member_ids)?;

            let Some(merge) = plan_user_merge(&candidate, &group, &children) else {
                return Ok((GroupOutcome::Unique, Some(candidate.object_id)));
            };

            let removed = db::apply_user_merge(&tx, &merge)?;
            tx.commit()?;

            debug!(
                survivor = %merge.survivor.object_id,
                removed,
                moved = merge.moved_details.len(),
                "merged user group"
            );
            Ok((
                GroupOutcome::Merged { removed, moved_children: merge.moved_details.len() },
                Some(merge.survivor.object_id),
            ))
        })
        .await
}

async fn compact_history_unit(store: Store, user_object_id: String) -> Result<CompactionOutcome> {
    store
        .perform(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if db::get_user(&tx, &user_object_id)?.is_none() {
                return Ok(CompactionOutcome::default());
            }

            let mut history = db::get_user_details(&tx, &user_object_id)?;
            sort_history(&mut history);

            let plan = compact_adjacent(&history);
            if plan.is_noop() {
                return Ok(CompactionOutcome { retained: plan.retained.len(), removed: 0 });
            }

            let removed = db::remove_user_details(&tx, &user_object_id, &plan.removed)?;
            tx.commit()?;

            debug!(user = %user_object_id, removed, "compacted user history");
            Ok(CompactionOutcome { retained: plan.retained.len(), removed })
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CleansingConfig;
    use crate::entities::{Account, ProfileSnapshot, User, UserDetail};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 9, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn snapshot(name: &str) -> ProfileSnapshot {
        ProfileSnapshot {
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    fn context() -> PassContext {
        PassContext::new(Store::open_in_memory().unwrap(), CleansingConfig::default().with_max_concurrency(2))
    }

    fn seed_user(ctx: &PassContext, user: &User, history: &[(i64, &str)]) {
        let user = user.clone();
        let details: Vec<UserDetail> = history
            .iter()
            .map(|(minutes, name)| UserDetail::new(&user.object_id, t(*minutes), snapshot(name)))
            .collect();

        ctx.store
            .with_connection(move |conn| {
                db::insert_user(conn, &user)?;
                for detail in &details {
                    db::insert_user_detail(conn, detail)?;
                }
                Ok(())
            })
            .unwrap();
    }

    fn history_names(ctx: &PassContext, user_object_id: &str) -> Vec<String> {
        let id = user_object_id.to_string();
        ctx.store
            .with_connection(move |conn| db::get_user_details(conn, &id))
            .unwrap()
            .into_iter()
            .map(|d| d.snapshot.name.unwrap())
            .collect()
    }

    fn user_ids(ctx: &PassContext) -> Vec<String> {
        ctx.store.with_connection(|conn| db::get_user_ids(conn)).unwrap()
    }

    #[tokio::test]
    async fn test_three_users_with_same_remote_id() {
        let ctx = context();
        let a = User::new("42", t(0)).with_last_update(t(1), t(2));
        let b = User::new("42", t(10)).with_modification_date(t(30));
        let c = User::new("42", t(20)).with_last_update(t(21), t(22));
        seed_user(&ctx, &a, &[(0, "a0"), (12, "a1")]);
        seed_user(&ctx, &b, &[(5, "b0")]);
        seed_user(&ctx, &c, &[(20, "c0"), (25, "c1")]);

        let report = cleanse_users(&ctx).await.unwrap();

        assert_eq!(report.groups_merged, 1);
        assert_eq!(report.entities_removed, 2);
        assert_eq!(report.children_moved, 3);
        assert_eq!(user_ids(&ctx), vec![a.object_id.clone()]);

        // Merged history interleaves by creation date
        assert_eq!(history_names(&ctx, &a.object_id), vec!["a0", "b0", "a1", "c0", "c1"]);

        let survivor = ctx
            .store
            .with_connection(move |conn| db::get_user(conn, &a.object_id))
            .unwrap()
            .unwrap();
        assert_eq!(survivor.creation_date, t(0));
        assert_eq!(survivor.last_update_start_date, Some(t(21)));
        assert_eq!(survivor.last_update_end_date, Some(t(22)));
        assert_eq!(survivor.modification_date, Some(t(30)));
    }

    #[tokio::test]
    async fn test_merge_then_compact_survivor_history() {
        let ctx = context();
        let a = User::new("7", t(0));
        let b = User::new("7", t(1));
        seed_user(&ctx, &a, &[(0, "x"), (2, "y")]);
        seed_user(&ctx, &b, &[(1, "x"), (3, "y"), (4, "x")]);

        let report = cleanse_users(&ctx).await.unwrap();

        // x x y y x → x y x
        assert_eq!(history_names(&ctx, &a.object_id), vec!["x", "y", "x"]);
        assert_eq!(report.histories_compacted, 1);
        assert_eq!(report.details_removed, 2);
    }

    #[tokio::test]
    async fn test_compaction_runs_for_unique_users() {
        let ctx = context();
        let lonely = User::new("1", t(0));
        let anonymous = User {
            id: None,
            ..User::new("", t(1))
        };
        seed_user(&ctx, &lonely, &[(0, "a"), (1, "a"), (2, "b")]);
        seed_user(&ctx, &anonymous, &[(0, "z"), (1, "z")]);

        let report = cleanse_users(&ctx).await.unwrap();

        assert_eq!(report.groups_merged, 0);
        assert_eq!(history_names(&ctx, &lonely.object_id), vec!["a", "b"]);
        assert_eq!(history_names(&ctx, &anonymous.object_id), vec!["z"]);
    }

    #[tokio::test]
    async fn test_user_pass_is_idempotent() {
        let ctx = context();
        seed_user(&ctx, &User::new("5", t(0)), &[(0, "a"), (1, "a")]);
        seed_user(&ctx, &User::new("5", t(1)), &[(2, "a"), (3, "b")]);

        cleanse_users(&ctx).await.unwrap();
        let report = cleanse_users(&ctx).await.unwrap();

        assert_eq!(report.groups_merged, 0);
        assert_eq!(report.details_removed, 0);
    }

    #[tokio::test]
    async fn test_reconcile_account_user() {
        let ctx = context();
        let account = Account::new("tok", "sec", t(0)).with_user_id("77");
        let unbound = Account::new("tok2", "sec", t(0));
        let a = User::new("77", t(0));
        let b = User::new("77", t(1));
        seed_user(&ctx, &a, &[(0, "n"), (1, "n")]);
        seed_user(&ctx, &b, &[(2, "m")]);

        let (bound_id, unbound_id) = (account.object_id.clone(), unbound.object_id.clone());
        ctx.store
            .with_connection(move |conn| {
                db::insert_account(conn, &account)?;
                db::insert_account(conn, &unbound)
            })
            .unwrap();

        let result = reconcile_account_user(&ctx, &bound_id).await.unwrap().unwrap();
        assert_eq!(result.survivor.as_deref(), Some(a.object_id.as_str()));
        assert_eq!(result.merge, GroupOutcome::Merged { removed: 1, moved_children: 1 });
        assert_eq!(result.compaction, Some(CompactionOutcome { retained: 2, removed: 1 }));
        assert_eq!(history_names(&ctx, &a.object_id), vec!["n", "m"]);

        assert!(reconcile_account_user(&ctx, &unbound_id).await.unwrap().is_none());
        assert!(reconcile_account_user(&ctx, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_compact_missing_user_is_noop() {
        let ctx = context();
        let outcome = compact_user_history(&ctx, "nobody").await.unwrap();
        assert_eq!(outcome, CompactionOutcome::default());
    }

    #[tokio::test]
    async fn test_unreadable_history_only_skips_its_group() {
        let ctx = context();
        let broken_a = User::new("3", t(0));
        let broken_b = User::new("3", t(1));
        let healthy_a = User::new("4", t(2));
        let healthy_b = User::new("4", t(3));
        seed_user(&ctx, &broken_a, &[(0, "r")]);
        seed_user(&ctx, &broken_b, &[(1, "s")]);
        seed_user(&ctx, &healthy_a, &[(2, "h")]);
        seed_user(&ctx, &healthy_b, &[(3, "h")]);

        let owner = broken_b.object_id.clone();
        ctx.store
            .with_connection(move |conn| {
                conn.execute(
                    "UPDATE user_details SET following_user_ids = 'not json' WHERE user_object_id = ?1",
                    [&owner],
                )?;
                Ok(())
            })
            .unwrap();

        let report = cleanse_users(&ctx).await.unwrap();

        assert_eq!(report.groups_failed, 2);
        assert_eq!(report.groups_merged, 1);
        assert_eq!(report.details_removed, 1);
        assert_eq!(history_names(&ctx, &healthy_a.object_id), vec!["h"]);
        assert_eq!(user_ids(&ctx), vec![broken_a.object_id, broken_b.object_id, healthy_a.object_id.clone()]);
    }

    #[tokio::test]
    async fn test_cancelled_user_pass_leaves_store_consistent() {
        let ctx = context();
        let a = User::new("9", t(0));
        let b = User::new("9", t(1));
        seed_user(&ctx, &a, &[(0, "p")]);
        seed_user(&ctx, &b, &[(1, "q")]);
        ctx.cancel.cancel();

        let err = cleanse_users(&ctx).await.unwrap_err();
        assert!(err.is_cancelled());

        // Nothing ran, so nothing was half-merged
        assert_eq!(user_ids(&ctx).len(), 2);
        assert_eq!(history_names(&ctx, &b.object_id), vec!["q"]);
    }
}
