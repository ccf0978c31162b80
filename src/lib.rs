// Nest Reconcile - Core Library
// Deduplicates and reconciles a multi-device synced entity store.
// Exposes all modules for use in the CLI, the API server, and tests.

pub mod config;
pub mod db;
pub mod deduplication;  // Merge planning (Account / User / DataAsset)
pub mod entities;       // Value snapshots of the synced entity kinds
pub mod error;
pub mod maintenance;    // Online reclaim of the backing store
pub mod passes;         // Per-kind deduplication passes
pub mod reconciliation; // Orchestrator: gate + fan-out + maintenance
pub mod temporal;       // Temporal bounds + adjacent history compaction

// Re-export commonly used types
pub use config::CleansingConfig;
pub use db::{
    Store, StoreKind, Event, EntityCounts, ReclaimStats,
    setup_database, insert_account, insert_user, insert_user_detail, insert_data_asset,
    entity_counts, insert_event, get_events_for_entity,
};
pub use deduplication::{
    AccountMerge, UserMerge, DataAssetPrune, MergeSummary,
    plan_account_merge, plan_user_merge, plan_data_asset_prune, reparent_children,
};
pub use entities::{
    Account, AccountPreferences, CredentialKey,
    User, UserDetail, ProfileSnapshot,
    DataAsset, AssetKey,
};
pub use error::{CleansingError, PassFailure, Result};
pub use maintenance::{reclaim_store, ReclaimOutcome};
pub use passes::{
    CompactionOutcome, GroupOutcome, PassContext, PassKind, PassReport,
    user::UserReconciliation,
};
pub use reconciliation::{
    Reconciler, ReconcilerState, ReconcileOutcome, ReconciliationReport,
    LastRunStore, InMemoryLastRun, gate_open,
};
pub use temporal::{compact_adjacent, HistoryCompaction};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
