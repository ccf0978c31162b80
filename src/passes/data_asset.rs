// DataAsset pass: keep one row per (url, content hash)
//
// Assets carry no children and nothing points at them by object id
// (consumers resolve by url + hash), so the losers of a group go in one
// batch delete.

use rusqlite::TransactionBehavior;
use std::time::Instant;
use tracing::{debug, info};

use super::{settle_group, with_conflict_retry, GroupOutcome, PassContext, PassKind, PassReport};
use crate::db::{self, Store};
use crate::deduplication::plan_data_asset_prune;
use crate::error::Result;

pub async fn cleanse_data_assets(ctx: &PassContext) -> Result<PassReport> {
    let started = Instant::now();
    let mut report = PassReport::new(PassKind::DataAsset);

    let candidates = ctx.store.perform(|conn| db::get_data_asset_ids(conn)).await?;
    report.candidates = candidates.len();

    for object_id in candidates {
        ctx.check_cancelled()?;

        let store = ctx.store.clone();
        let result = with_conflict_retry(ctx, PassKind::DataAsset, &object_id, || {
            prune_data_asset_group(store.clone(), object_id.clone())
        })
        .await;

        if let Some(outcome) = settle_group(&mut report, &object_id, result)? {
            report.record_group(outcome);
        }
    }

    let report = report.finish(started);
    info!(
        pruned = report.groups_merged,
        removed = report.entities_removed,
        skipped = report.conflicts_skipped,
        failed = report.groups_failed,
        "data asset pass finished"
    );
    Ok(report)
}

pub async fn reconcile_data_asset(ctx: &PassContext, object_id: &str) -> Result<GroupOutcome> {
    ctx.check_cancelled()?;

    let store = ctx.store.clone();
    let outcome = with_conflict_retry(ctx, PassKind::DataAsset, object_id, || {
        prune_data_asset_group(store.clone(), object_id.to_string())
    })
    .await?;

    Ok(outcome.unwrap_or(GroupOutcome::Unique))
}

async fn prune_data_asset_group(store: Store, candidate_id: String) -> Result<GroupOutcome> {
    store
        .perform(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let Some(candidate) = db::get_data_asset(&tx, &candidate_id)? else {
                return Ok(GroupOutcome::Missing);
            };
            let Some(key) = candidate.asset_key() else {
                return Ok(GroupOutcome::Unique);
            };

            let group = db::get_data_asset_ids_by_key(&tx, &key)?;
            let Some(prune) = plan_data_asset_prune(&candidate, &group) else {
                return Ok(GroupOutcome::Unique);
            };

            let removed = db::apply_data_asset_prune(&tx, &prune)?;
            tx.commit()?;

            debug!(survivor = %prune.survivor, removed, "pruned data asset group");
            Ok(GroupOutcome::Merged { removed, moved_children: 0 })
        })
        .await
}
