// Account pass: fold accounts that share a credential pair

use rusqlite::TransactionBehavior;
use std::time::Instant;
use tracing::{debug, info};

use super::{settle_group, with_conflict_retry, GroupOutcome, PassContext, PassKind, PassReport};
use crate::db::{self, Store};
use crate::deduplication::plan_account_merge;
use crate::error::Result;

/// Merge every credential group in the store
pub async fn cleanse_accounts(ctx: &PassContext) -> Result<PassReport> {
    let started = Instant::now();
    let mut report = PassReport::new(PassKind::Account);

    let candidates = ctx.store.perform(|conn| db::get_account_ids(conn)).await?;
    report.candidates = candidates.len();

    for object_id in candidates {
        ctx.check_cancelled()?;

        let store = ctx.store.clone();
        let result = with_conflict_retry(ctx, PassKind::Account, &object_id, || {
            merge_account_group(store.clone(), object_id.clone())
        })
        .await;

        if let Some(outcome) = settle_group(&mut report, &object_id, result)? {
            report.record_group(outcome);
        }
    }

    let report = report.finish(started);
    info!(
        merged = report.groups_merged,
        removed = report.entities_removed,
        skipped = report.conflicts_skipped,
        failed = report.groups_failed,
        "account pass finished"
    );
    Ok(report)
}

/// Merge the credential group of a single account
pub async fn reconcile_account(ctx: &PassContext, object_id: &str) -> Result<GroupOutcome> {
    ctx.check_cancelled()?;

    let store = ctx.store.clone();
    let outcome = with_conflict_retry(ctx, PassKind::Account, object_id, || {
        merge_account_group(store.clone(), object_id.to_string())
    })
    .await?;

    // A skipped group leaves the store as it was
    Ok(outcome.unwrap_or(GroupOutcome::Unique))
}

async fn merge_account_group(store: Store, candidate_id: String) -> Result<GroupOutcome> {
    store
        .perform(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let Some(candidate) = db::get_account(&tx, &candidate_id)? else {
                return Ok(GroupOutcome::Missing);
            };
            let Some(key) = candidate.credential_key() else {
                return Ok(GroupOutcome::Unique);
            };

            let group = db::get_accounts_by_credentials(&tx, &key)?;
            let Some(merge) = plan_account_merge(&candidate, &group) else {
                return Ok(GroupOutcome::Unique);
            };

            let removed = db::apply_account_merge(&tx, &merge)?;
            tx.commit()?;

            debug!(survivor = %merge.survivor.object_id, removed, "merged account group");
            Ok(GroupOutcome::Merged { removed, moved_children: 0 })
        })
        .await
}
