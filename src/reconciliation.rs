// ⚖️ Reconciliation Orchestrator - Gate, fan out, maintain
//
// State machine (published on a watch channel):
//
//   Idle ──trigger──▶ Gated ──gate open──▶ Running ──ok──▶ Idle
//                       │                     │
//                       └──gate closed──▶ Idle└──error──▶ Failed
//
// Failed is held until the next trigger, which moves it to Gated again.
// A cancelled run returns to Idle; cancellation is not a failure.
//
// The run start is recorded BEFORE any work, so a crash mid-run waits out
// the interval instead of re-running immediately.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CleansingConfig;
use crate::db::{self, EntityCounts, Store};
use crate::error::{CleansingError, PassFailure, Result};
use crate::maintenance::{self, ReclaimOutcome};
use crate::passes::{self, CompactionOutcome, GroupOutcome, PassContext, PassKind, PassReport};
use crate::passes::user::UserReconciliation;

// ============================================================================
// STATE + OUTCOMES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilerState {
    Idle,
    Gated,
    Running,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// The interval has not elapsed and the run was not forced
    Gated { last_run: Option<DateTime<Utc>> },

    /// Another run holds the orchestrator
    AlreadyRunning,

    Completed(ReconciliationReport),
}

impl ReconcileOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, ReconcileOutcome::Completed(_))
    }

    pub fn report(&self) -> Option<&ReconciliationReport> {
        match self {
            ReconcileOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationReport {
    pub started_at: DateTime<Utc>,
    pub accounts: PassReport,
    pub users: PassReport,
    pub data_assets: PassReport,
    pub maintenance: ReclaimOutcome,
    pub elapsed_ms: u64,
}

impl ReconciliationReport {
    pub fn total_removed(&self) -> usize {
        [&self.accounts, &self.users, &self.data_assets]
            .iter()
            .map(|r| r.entities_removed + r.details_removed)
            .sum()
    }

    pub fn summary(&self) -> String {
        format!(
            "accounts merged: {}, users merged: {} ({} snapshots moved), histories compacted: {} ({} snapshots removed), data asset groups pruned: {}, bytes reclaimed: {}",
            self.accounts.groups_merged,
            self.users.groups_merged,
            self.users.children_moved,
            self.users.histories_compacted,
            self.users.details_removed,
            self.data_assets.groups_merged,
            self.maintenance.bytes_reclaimed(),
        )
    }
}

/// Gate check: forced, never run, or the interval has fully elapsed.
/// A last-run date in the future (clock moved back) keeps the gate closed.
pub fn gate_open(last_run: Option<DateTime<Utc>>, now: DateTime<Utc>, min_interval: Duration, force: bool) -> bool {
    if force {
        return true;
    }

    match last_run {
        None => true,
        Some(last) => now
            .signed_duration_since(last)
            .to_std()
            .map(|elapsed| elapsed >= min_interval)
            .unwrap_or(false),
    }
}

// ============================================================================
// LAST RUN PERSISTENCE
// ============================================================================

/// Where the "last reconciliation started at" timestamp lives
pub trait LastRunStore: Send + Sync {
    fn last_run(&self) -> Result<Option<DateTime<Utc>>>;
    fn record_run(&self, started_at: DateTime<Utc>) -> Result<()>;
}

/// Persist the timestamp next to the entities it describes
impl LastRunStore for Store {
    fn last_run(&self) -> Result<Option<DateTime<Utc>>> {
        self.with_connection(|conn| db::get_last_cleansed_date(conn))
    }

    fn record_run(&self, started_at: DateTime<Utc>) -> Result<()> {
        self.with_connection(|conn| db::set_last_cleansed_date(conn, &started_at))
    }
}

/// Process-local timestamp, for hosts that persist it elsewhere
#[derive(Debug, Default)]
pub struct InMemoryLastRun {
    value: Mutex<Option<DateTime<Utc>>>,
}

impl InMemoryLastRun {
    pub fn new(last_run: Option<DateTime<Utc>>) -> Self {
        InMemoryLastRun { value: Mutex::new(last_run) }
    }
}

impl LastRunStore for InMemoryLastRun {
    fn last_run(&self) -> Result<Option<DateTime<Utc>>> {
        self.value
            .lock()
            .map(|value| *value)
            .map_err(|_| CleansingError::StoreUnavailable("last run lock poisoned".to_string()))
    }

    fn record_run(&self, started_at: DateTime<Utc>) -> Result<()> {
        let mut value = self
            .value
            .lock()
            .map_err(|_| CleansingError::StoreUnavailable("last run lock poisoned".to_string()))?;
        *value = Some(started_at);
        Ok(())
    }
}

// ============================================================================
// RECONCILER
// ============================================================================

/// Clears the running flag however the run ends
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Publishes the token of the run in flight and withdraws it when the run
/// ends, however it ends
struct ActiveRun<'a>(&'a Mutex<Option<CancellationToken>>);

impl<'a> ActiveRun<'a> {
    fn begin(slot: &'a Mutex<Option<CancellationToken>>, token: CancellationToken) -> Self {
        if let Ok(mut current) = slot.lock() {
            *current = Some(token);
        }
        ActiveRun(slot)
    }
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        if let Ok(mut current) = self.0.lock() {
            *current = None;
        }
    }
}

pub struct Reconciler {
    store: Store,
    config: CleansingConfig,
    last_run: Arc<dyn LastRunStore>,
    shutdown: CancellationToken,
    current: Mutex<Option<CancellationToken>>,
    running: AtomicBool,
    state: watch::Sender<ReconcilerState>,
}

impl Reconciler {
    pub fn new(store: Store, config: CleansingConfig) -> Self {
        let store = store.with_busy_timeout(config.busy_timeout);
        let shutdown = CancellationToken::new();
        let (state, _) = watch::channel(ReconcilerState::Idle);

        Reconciler {
            last_run: Arc::new(store.clone()),
            current: Mutex::new(None),
            store,
            config,
            shutdown,
            running: AtomicBool::new(false),
            state,
        }
    }

    pub fn with_last_run_store(mut self, last_run: Arc<dyn LastRunStore>) -> Self {
        self.last_run = last_run;
        self
    }

    /// Tie every run to an external cancellation signal (host shutdown,
    /// background-time budget expiring, ...)
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &CleansingConfig {
        &self.config
    }

    pub fn state(&self) -> ReconcilerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ReconcilerState> {
        self.state.subscribe()
    }

    /// Cancel the run in progress, along with any single-entity operation
    /// started during it. Does nothing while idle.
    pub fn cancel(&self) {
        let current = self.current.lock().ok().and_then(|current| current.clone());
        match current {
            Some(token) => token.cancel(),
            None => debug!("no reconciliation in flight, nothing to cancel"),
        }
    }

    fn context(&self, cancel: CancellationToken) -> PassContext {
        PassContext::new(self.store.clone(), self.config.clone()).with_cancel(cancel)
    }

    /// Context for single-entity operations. Shares the token of the run in
    /// flight; otherwise only host shutdown can cancel it.
    fn scoped_context(&self) -> PassContext {
        let token = self
            .current
            .lock()
            .ok()
            .and_then(|current| current.clone())
            .unwrap_or_else(|| self.shutdown.child_token());
        self.context(token)
    }

    async fn load_last_run(&self) -> Result<Option<DateTime<Utc>>> {
        let last_run = self.last_run.clone();
        tokio::task::spawn_blocking(move || last_run.last_run()).await?
    }

    async fn save_last_run(&self, started_at: DateTime<Utc>) -> Result<()> {
        let last_run = self.last_run.clone();
        tokio::task::spawn_blocking(move || last_run.record_run(started_at)).await?
    }

    fn fail(&self, err: CleansingError) -> CleansingError {
        if err.is_cancelled() {
            info!("reconciliation cancelled");
            self.state.send_replace(ReconcilerState::Idle);
        } else {
            error!(error = %err, "reconciliation failed");
            self.state.send_replace(ReconcilerState::Failed);
        }
        err
    }

    // ------------------------------------------------------------------------
    // Full run
    // ------------------------------------------------------------------------

    /// Run every pass and store maintenance, unless gated.
    ///
    /// Returns `Gated` or `AlreadyRunning` without touching the store.
    /// Any pass failure makes the whole run fail, after the other passes and
    /// maintenance have had their chance.
    pub async fn reconcile_all(&self, force: bool) -> Result<ReconcileOutcome> {
        let Some(_guard) = RunGuard::acquire(&self.running) else {
            info!("reconciliation already running, ignoring trigger");
            return Ok(ReconcileOutcome::AlreadyRunning);
        };

        self.state.send_replace(ReconcilerState::Gated);

        let now = Utc::now();
        let last_run = self.load_last_run().await.map_err(|e| self.fail(e))?;

        if !gate_open(last_run, now, self.config.min_interval, force) {
            info!(last_run = ?last_run, "reconciliation gated, interval not elapsed");
            self.state.send_replace(ReconcilerState::Idle);
            return Ok(ReconcileOutcome::Gated { last_run });
        }

        self.save_last_run(now).await.map_err(|e| self.fail(e))?;
        self.state.send_replace(ReconcilerState::Running);
        info!(force, "reconciliation started");

        let report = self.run(now).await.map_err(|e| self.fail(e))?;

        info!(elapsed_ms = report.elapsed_ms, "{}", report.summary());
        self.state.send_replace(ReconcilerState::Idle);
        Ok(ReconcileOutcome::Completed(report))
    }

    async fn run(&self, started_at: DateTime<Utc>) -> Result<ReconciliationReport> {
        let started = Instant::now();
        let token = self.shutdown.child_token();
        let _active = ActiveRun::begin(&self.current, token.clone());
        let ctx = self.context(token);

        let (accounts, users, data_assets) = tokio::join!(
            passes::cleanse_accounts(&ctx),
            passes::cleanse_users(&ctx),
            passes::cleanse_data_assets(&ctx),
        );

        let mut cancelled = false;
        let mut unavailable = None;
        let mut failures = Vec::new();

        let mut settle = |pass: PassKind, result: Result<PassReport>| -> Option<PassReport> {
            match result {
                Ok(report) => Some(report),
                Err(CleansingError::Cancelled) => {
                    cancelled = true;
                    None
                }
                Err(CleansingError::StoreUnavailable(reason)) => {
                    warn!(pass = %pass, reason = %reason, "store unavailable");
                    unavailable.get_or_insert(reason);
                    None
                }
                Err(err) => {
                    warn!(pass = %pass, error = %err, "reconciliation pass failed");
                    failures.push(PassFailure { pass, message: err.to_string() });
                    None
                }
            }
        };

        let accounts = settle(PassKind::Account, accounts);
        let users = settle(PassKind::User, users);
        let data_assets = settle(PassKind::DataAsset, data_assets);

        if cancelled {
            return Err(CleansingError::Cancelled);
        }
        if let Some(reason) = unavailable {
            return Err(CleansingError::StoreUnavailable(reason));
        }

        // Completed merges stand even if another pass failed: still reclaim
        let maintenance = maintenance::reclaim_store(&self.store).await;

        match (accounts, users, data_assets) {
            (Some(accounts), Some(users), Some(data_assets)) if failures.is_empty() => Ok(ReconciliationReport {
                started_at,
                accounts,
                users,
                data_assets,
                maintenance: maintenance?,
                elapsed_ms: started.elapsed().as_millis() as u64,
            }),
            _ => Err(CleansingError::PassesFailed {
                failures,
                maintenance: maintenance.err().map(|err| err.to_string()),
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Scoped operations (no gate)
    // ------------------------------------------------------------------------

    pub async fn reconcile_account(&self, object_id: &str) -> Result<GroupOutcome> {
        passes::reconcile_account(&self.scoped_context(), object_id).await
    }

    pub async fn reconcile_account_user(&self, account_object_id: &str) -> Result<Option<UserReconciliation>> {
        passes::reconcile_account_user(&self.scoped_context(), account_object_id).await
    }

    pub async fn reconcile_user(&self, object_id: &str) -> Result<UserReconciliation> {
        passes::reconcile_user(&self.scoped_context(), object_id).await
    }

    pub async fn compact_user_history(&self, user_object_id: &str) -> Result<CompactionOutcome> {
        passes::compact_user_history(&self.scoped_context(), user_object_id).await
    }

    pub async fn reconcile_data_asset(&self, object_id: &str) -> Result<GroupOutcome> {
        passes::reconcile_data_asset(&self.scoped_context(), object_id).await
    }

    pub async fn reclaim_store(&self) -> Result<ReclaimOutcome> {
        maintenance::reclaim_store(&self.store).await
    }

    pub async fn entity_counts(&self) -> Result<EntityCounts> {
        self.store.perform(|conn| db::entity_counts(conn)).await
    }
}

// ============================================================================
// TESTS
// ============================================================================
