// 🔍 Deduplication Engine - Plan merges of duplicate entities
//
// Pure functions over value snapshots. The store fetches a duplicate group,
// hands it here, and applies the returned plan inside one transaction.
//
// Precedence rules:
//   Account   → survivor = earliest created; sort order from the earliest,
//               user binding from the latest, preference flags OR-ed
//   User      → survivor = earliest created; creation = min, update and
//               modification dates = max; loser history moves to survivor
//   DataAsset → survivor = earliest created; losers dropped

use serde::Serialize;

use crate::entities::{Account, DataAsset, User, UserDetail};
use crate::temporal::latest;

// ============================================================================
// ACCOUNT MERGE
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct AccountMerge {
    /// Survivor with merged attributes applied
    pub survivor: Account,

    /// Object ids of the accounts to delete
    pub losers: Vec<String>,
}

/// Plan the merge of one credential group.
///
/// `group` is every Account sharing the candidate's credentials, ordered by
/// creation date ascending. Returns None when there is nothing to merge.
/// If the group is somehow empty (stale fetch) the candidate survives.
pub fn plan_account_merge(candidate: &Account, group: &[Account]) -> Option<AccountMerge> {
    if group.len() <= 1 {
        return None;
    }

    let first = group.first().unwrap_or(candidate);
    let last = group.last().unwrap_or(candidate);

    let mut survivor = first.clone();
    survivor.creation_date = group
        .iter()
        .map(|a| a.creation_date)
        .min()
        .unwrap_or(first.creation_date);
    survivor.sort_order = first.sort_order;
    // Latest identity binding wins, else the candidate's own
    survivor.user_id = last.user_id.clone().or_else(|| candidate.user_id.clone());

    let mut losers = Vec::with_capacity(group.len() - 1);
    for account in group {
        if account.object_id == survivor.object_id {
            continue;
        }
        survivor.preferences = survivor.preferences.merged_with(account.preferences);
        losers.push(account.object_id.clone());
    }

    Some(AccountMerge { survivor, losers })
}

// ============================================================================
// USER MERGE + RE-PARENTING
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct UserMerge {
    /// Survivor with merged temporal bounds applied
    pub survivor: User,

    /// Object ids of the users to delete
    pub losers: Vec<String>,

    /// Snapshots moving from a loser to the survivor
    pub moved_details: Vec<String>,
}

/// Plan the merge of one remote-id group.
///
/// `group` is every User sharing the candidate's remote id, ordered by
/// creation date ascending (ties in fetch order). `children` is the history
/// currently held by any member of the group.
pub fn plan_user_merge(candidate: &User, group: &[User], children: &[UserDetail]) -> Option<UserMerge> {
    if group.len() <= 1 {
        return None;
    }

    let mut survivor = group.first().unwrap_or(candidate).clone();
    let mut losers = Vec::with_capacity(group.len() - 1);

    for user in group {
        survivor.creation_date = survivor.creation_date.min(user.creation_date);
        survivor.last_update_start_date = latest(survivor.last_update_start_date, user.last_update_start_date);
        survivor.last_update_end_date = latest(survivor.last_update_end_date, user.last_update_end_date);
        survivor.modification_date = latest(survivor.modification_date, user.modification_date);

        if user.object_id != survivor.object_id {
            losers.push(user.object_id.clone());
        }
    }

    let moved_details = reparent_children(children, &losers, &survivor.object_id)
        .into_iter()
        .map(|d| d.object_id)
        .collect();

    Some(UserMerge { survivor, losers, moved_details })
}

/// Move every child of a loser onto the survivor.
///
/// Only the owner edge changes; creation dates (and so history order) are
/// untouched. Returns the moved children with their new owner.
pub fn reparent_children(children: &[UserDetail], losers: &[String], survivor: &str) -> Vec<UserDetail> {
    children
        .iter()
        .filter(|child| {
            child
                .user_object_id
                .as_ref()
                .map_or(false, |owner| losers.contains(owner))
        })
        .map(|child| {
            let mut moved = child.clone();
            moved.user_object_id = Some(survivor.to_string());
            moved
        })
        .collect()
}

// ============================================================================
// DATA ASSET PRUNE
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct DataAssetPrune {
    pub survivor: String,
    pub losers: Vec<String>,
}

/// Plan the pruning of one (url, hash) group.
///
/// `group_ids` are the object ids of every asset with the candidate's key,
/// ordered by creation date ascending.
pub fn plan_data_asset_prune(candidate: &DataAsset, group_ids: &[String]) -> Option<DataAssetPrune> {
    if group_ids.len() <= 1 {
        return None;
    }

    let survivor = group_ids
        .first()
        .cloned()
        .unwrap_or_else(|| candidate.object_id.clone());
    let losers = group_ids
        .iter()
        .filter(|id| **id != survivor)
        .cloned()
        .collect();

    Some(DataAssetPrune { survivor, losers })
}

// ============================================================================
// MERGE SUMMARY (audit trail payload)
// ============================================================================

/// What an applied merge did, recorded in the events table
#[derive(Debug, Clone, Serialize)]
pub struct MergeSummary {
    pub survivor: String,
    pub losers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moved_children: Option<usize>,
}

impl From<&AccountMerge> for MergeSummary {
    fn from(merge: &AccountMerge) -> Self {
        MergeSummary {
            survivor: merge.survivor.object_id.clone(),
            losers: merge.losers.clone(),
            moved_children: None,
        }
    }
}

impl From<&UserMerge> for MergeSummary {
    fn from(merge: &UserMerge) -> Self {
        MergeSummary {
            survivor: merge.survivor.object_id.clone(),
            losers: merge.losers.clone(),
            moved_children: Some(merge.moved_details.len()),
        }
    }
}

impl From<&DataAssetPrune> for MergeSummary {
    fn from(prune: &DataAssetPrune) -> Self {
        MergeSummary {
            survivor: prune.survivor.clone(),
            losers: prune.losers.clone(),
            moved_children: None,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{AccountPreferences, ProfileSnapshot};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t(hours: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap() + Duration::hours(hours)
    }

    fn account(hours: i64, sort_order: i64, user_id: Option<&str>, blocking: bool) -> Account {
        let mut account = Account::new("token", "secret", t(hours))
            .with_sort_order(sort_order)
            .with_preferences(AccountPreferences {
                fetch_blocking_users: blocking,
                fetch_muting_users: false,
            });
        account.user_id = user_id.map(str::to_string);
        account
    }

    #[test]
    fn test_single_account_is_not_merged() {
        let a = account(0, 0, Some("1"), false);
        assert!(plan_account_merge(&a, &[a.clone()]).is_none());
    }

    #[test]
    fn test_account_merge_precedence() {
        let a = account(0, 3, Some("old"), false);
        let b = account(1, 7, None, true);
        let c = account(2, 9, Some("new"), false);
        let group = vec![a.clone(), b.clone(), c.clone()];

        let merge = plan_account_merge(&c, &group).unwrap();

        assert_eq!(merge.survivor.object_id, a.object_id, "earliest created survives");
        assert_eq!(merge.survivor.creation_date, t(0));
        assert_eq!(merge.survivor.sort_order, 3, "sort order from earliest");
        assert_eq!(merge.survivor.user_id.as_deref(), Some("new"), "user binding from latest");
        assert!(merge.survivor.preferences.fetch_blocking_users, "flags OR-ed");
        assert_eq!(merge.losers, vec![b.object_id, c.object_id]);
    }

    #[test]
    fn test_account_merge_keeps_known_user_binding() {
        let a = account(0, 0, Some("bound"), false);
        let b = account(1, 0, None, false);

        let merge = plan_account_merge(&a, &[a.clone(), b]).unwrap();
        assert_eq!(merge.survivor.user_id.as_deref(), Some("bound"));
    }

    #[test]
    fn test_unbound_latest_falls_back_to_candidate_binding() {
        let a = account(0, 0, Some("first"), false);
        let b = account(1, 0, Some("middle"), false);
        let c = account(2, 0, None, false);

        let merge = plan_account_merge(&b, &[a.clone(), b.clone(), c]).unwrap();
        assert_eq!(merge.survivor.object_id, a.object_id);
        assert_eq!(merge.survivor.user_id.as_deref(), Some("middle"));
    }

    #[test]
    fn test_user_merge_bounds_and_reparenting() {
        let a = User::new("42", t(0)).with_last_update(t(1), t(2));
        let b = User::new("42", t(5)).with_modification_date(t(8));
        let c = User::new("42", t(9)).with_last_update(t(10), t(11));

        let children = vec![
            UserDetail::new(&a.object_id, t(0), ProfileSnapshot::default()),
            UserDetail::new(&b.object_id, t(5), ProfileSnapshot::default()),
            UserDetail::new(&c.object_id, t(9), ProfileSnapshot::default()),
            UserDetail::new(&c.object_id, t(10), ProfileSnapshot::default()),
        ];

        let merge = plan_user_merge(&b, &[a.clone(), b.clone(), c.clone()], &children).unwrap();

        assert_eq!(merge.survivor.object_id, a.object_id);
        assert_eq!(merge.survivor.creation_date, t(0));
        assert_eq!(merge.survivor.last_update_start_date, Some(t(10)));
        assert_eq!(merge.survivor.last_update_end_date, Some(t(11)));
        assert_eq!(merge.survivor.modification_date, Some(t(8)));
        assert_eq!(merge.losers, vec![b.object_id.clone(), c.object_id.clone()]);
        assert_eq!(
            merge.moved_details,
            vec![
                children[1].object_id.clone(),
                children[2].object_id.clone(),
                children[3].object_id.clone(),
            ]
        );
    }

    #[test]
    fn test_user_merge_temporal_bounds_hold_for_every_member() {
        let group = vec![
            User::new("7", t(3)).with_modification_date(t(4)),
            User::new("7", t(1)).with_modification_date(t(20)),
            User::new("7", t(6)),
        ];

        let merge = plan_user_merge(&group[0], &group, &[]).unwrap();

        for user in &group {
            assert!(merge.survivor.creation_date <= user.creation_date);
            if let Some(modified) = user.modification_date {
                assert!(merge.survivor.modification_date.unwrap() >= modified);
            }
        }
    }

    #[test]
    fn test_reparent_preserves_creation_dates() {
        let survivor = User::new("1", t(0));
        let loser = User::new("1", t(1));
        let children = vec![UserDetail::new(&loser.object_id, t(7), ProfileSnapshot::default())];

        let moved = reparent_children(&children, &[loser.object_id.clone()], &survivor.object_id);

        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].user_object_id.as_deref(), Some(survivor.object_id.as_str()));
        assert_eq!(moved[0].creation_date, t(7));
    }

    #[test]
    fn test_data_asset_prune_keeps_earliest() {
        let a = DataAsset::new("u", b"h".to_vec(), t(1));
        let b = DataAsset::new("u", b"h".to_vec(), t(2));
        let ids = vec![a.object_id.clone(), b.object_id.clone()];

        let prune = plan_data_asset_prune(&b, &ids).unwrap();
        assert_eq!(prune.survivor, a.object_id);
        assert_eq!(prune.losers, vec![b.object_id]);

        assert!(plan_data_asset_prune(&a, &ids[..1]).is_none());
    }
}
