// Nest Reconcile - Command line front end
//
// Every subcommand opens the store, builds a Reconciler from the config and
// runs exactly one operation. Logs go to stderr (RUST_LOG, default info),
// results to stdout.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use nest_reconcile::{CleansingConfig, GroupOutcome, ReconcileOutcome, Reconciler, ReclaimOutcome, Store};

#[derive(Parser, Debug)]
#[command(name = "nest-reconcile", version, about = "Deduplicate and reconcile a synced entity store")]
struct Cli {
    /// Path to the SQLite store
    #[arg(long, default_value = "nest.sqlite")]
    db: PathBuf,

    /// JSON configuration file (min_interval_secs, max_concurrency, ...)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the schema if it does not exist
    Setup,

    /// Run every pass plus store maintenance (gated by min interval)
    All {
        /// Ignore the minimum interval
        #[arg(long)]
        force: bool,
    },

    /// Merge the credential group of one account
    Account { object_id: String },

    /// Merge and compact the user an account is signed in as
    AccountUser { object_id: String },

    /// Merge the remote-id group of one user, then compact its history
    User { object_id: String },

    /// Compact one user's history
    History { user_object_id: String },

    /// Prune the (url, hash) group of one data asset
    Asset { object_id: String },

    /// Vacuum and re-analyze the store
    Reclaim,

    /// Show entity counts and pending duplicate groups
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => CleansingConfig::from_file(path)?,
        None => CleansingConfig::default(),
    };

    let store = Store::open(&cli.db)
        .with_context(|| format!("Failed to open store: {:?}", cli.db))?;
    let reconciler = Reconciler::new(store, config);

    match cli.command {
        Command::Setup => {
            println!("✓ Store ready at {:?}", cli.db);
        }
        Command::All { force } => {
            match reconciler.reconcile_all(force).await? {
                ReconcileOutcome::Completed(report) => {
                    println!("✅ Reconciliation complete in {} ms", report.elapsed_ms);
                    println!("   {}", report.summary());
                }
                ReconcileOutcome::Gated { last_run } => {
                    let last = last_run.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".to_string());
                    println!("⏸️  Skipped: last run {} is within the minimum interval (use --force)", last);
                }
                ReconcileOutcome::AlreadyRunning => {
                    println!("⏸️  Skipped: a reconciliation is already running");
                }
            }
        }
        Command::Account { object_id } => {
            let outcome = reconciler.reconcile_account(&object_id).await?;
            print_group("account", &object_id, outcome);
        }
        Command::AccountUser { object_id } => {
            match reconciler.reconcile_account_user(&object_id).await? {
                Some(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                None => println!("⚠️  Account {} is missing or not bound to a user", object_id),
            }
        }
        Command::User { object_id } => {
            let result = reconciler.reconcile_user(&object_id).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::History { user_object_id } => {
            let outcome = reconciler.compact_user_history(&user_object_id).await?;
            println!(
                "✓ History of {}: {} kept, {} removed",
                user_object_id, outcome.retained, outcome.removed
            );
        }
        Command::Asset { object_id } => {
            let outcome = reconciler.reconcile_data_asset(&object_id).await?;
            print_group("data asset", &object_id, outcome);
        }
        Command::Reclaim => match reconciler.reclaim_store().await? {
            ReclaimOutcome::Reclaimed { bytes_before, bytes_after } => {
                println!("✓ Store reclaimed: {} → {} bytes", bytes_before, bytes_after);
            }
            ReclaimOutcome::Unsupported { store } => {
                println!("⚠️  {} stores cannot be reclaimed", store);
            }
        },
        Command::Stats => {
            let counts = reconciler.entity_counts().await?;
            println!("📊 Store statistics");
            println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
            println!("   Accounts:      {}", counts.accounts);
            println!("   Users:         {} ({} orphaned)", counts.users, counts.orphan_users);
            println!("   User details:  {}", counts.user_details);
            println!("   Data assets:   {}", counts.data_assets);
            println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
            if counts.has_duplicates() {
                println!(
                    "⚠️  Duplicate groups: {} account, {} user, {} data asset",
                    counts.duplicate_account_groups,
                    counts.duplicate_user_groups,
                    counts.duplicate_data_asset_groups
                );
            } else {
                println!("✅ No duplicate groups");
            }
        }
    }

    Ok(())
}

fn print_group(kind: &str, object_id: &str, outcome: GroupOutcome) {
    match outcome {
        GroupOutcome::Missing => println!("⚠️  No {} with id {}", kind, object_id),
        GroupOutcome::Unique => println!("✓ {} {} has no duplicates", kind, object_id),
        GroupOutcome::Merged { removed, moved_children } => println!(
            "✓ Merged {} group of {}: {} removed, {} children moved",
            kind, object_id, removed, moved_children
        ),
    }
}
