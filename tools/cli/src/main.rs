//! FieldSync CLI - Command line interface for sync state inspection.
//!
//! This tool reads and edits the persisted sync strategy, reports metrics
//! and unresolved conflicts, and manages the staged upload queue of a
//! device state directory.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use fieldsync_storage::FileStore;
use fieldsync_sync::{
    ConflictLog, ConflictPriority, StagedUploadQueue, StateStore, SyncMetrics, SyncStrategy,
};

#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(about = "FieldSync - Offline-first sync state management")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Directory holding persisted sync state.
    #[arg(short, long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show or change the sync strategy.
    Strategy {
        #[command(subcommand)]
        action: StrategyAction,
    },

    /// Show cumulative sync metrics.
    Metrics,

    /// Inspect conflicts awaiting manual resolution.
    Conflicts {
        #[command(subcommand)]
        action: ConflictsAction,
    },

    /// Manage the staged upload queue.
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
}

#[derive(Subcommand)]
enum StrategyAction {
    /// Print the current strategy.
    Show,

    /// Update strategy fields. Omitted fields keep their value.
    Set {
        /// Conflict priority: "local", "remote", "merge", or "manual".
        #[arg(short, long, value_parser = ConflictPriority::from_str)]
        priority: Option<ConflictPriority>,

        /// Maximum items per phase per run.
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Attempts per upload before it is marked failed.
        #[arg(short, long)]
        retry_attempts: Option<u32>,

        /// Background timer period in milliseconds.
        #[arg(short, long)]
        interval_ms: Option<u64>,

        /// Enable or disable background sync.
        #[arg(long, value_name = "BOOL")]
        background: Option<bool>,
    },
}

#[derive(Subcommand)]
enum ConflictsAction {
    /// List unresolved conflicts.
    List,

    /// Print one conflict as JSON.
    Show {
        /// Conflict (record) id.
        id: String,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// List queued uploads.
    List,

    /// Stage a file for upload.
    Enqueue {
        /// Reference the backend will store the file under.
        reference: String,

        /// File to stage.
        file: PathBuf,
    },

    /// Drop a queued upload and its staged data.
    Remove {
        /// Queue item id.
        id: String,
    },

    /// Delete staged files no queue item refers to.
    Cleanup,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let state_dir = match cli.state_dir {
        Some(dir) => dir,
        None => default_state_dir(),
    };

    match cli.command {
        Commands::Strategy { action } => match action {
            StrategyAction::Show => cmd_strategy_show(&state_dir).await,
            StrategyAction::Set {
                priority,
                batch_size,
                retry_attempts,
                interval_ms,
                background,
            } => {
                let update = StrategyUpdate {
                    priority,
                    batch_size,
                    retry_attempts,
                    interval_ms,
                    background,
                };
                cmd_strategy_set(&state_dir, update).await
            }
        },

        Commands::Metrics => cmd_metrics(&state_dir).await,

        Commands::Conflicts { action } => match action {
            ConflictsAction::List => cmd_conflicts_list(&state_dir).await,
            ConflictsAction::Show { id } => cmd_conflicts_show(&state_dir, &id).await,
        },

        Commands::Queue { action } => match action {
            QueueAction::List => cmd_queue_list(&state_dir).await,
            QueueAction::Enqueue { reference, file } => {
                cmd_queue_enqueue(&state_dir, &reference, &file).await
            }
            QueueAction::Remove { id } => cmd_queue_remove(&state_dir, &id).await,
            QueueAction::Cleanup => cmd_queue_cleanup(&state_dir).await,
        },
    }
}

fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fieldsync")
}

/// Open the persisted state in `state_dir`.
fn open_state(state_dir: &Path) -> Result<StateStore> {
    let store = FileStore::new(state_dir.join("state"))
        .with_context(|| format!("Failed to open state directory {}", state_dir.display()))?;
    Ok(StateStore::new(Arc::new(store)))
}

async fn open_queue(state_dir: &Path) -> Result<StagedUploadQueue> {
    StagedUploadQueue::new(state_dir.join("uploads"))
        .await
        .context("Failed to open upload queue")
}

fn print_strategy(strategy: &SyncStrategy) {
    println!("  Priority:        {}", strategy.priority);
    println!("  Batch size:      {}", strategy.batch_size);
    println!("  Retry attempts:  {}", strategy.retry_attempts);
    println!("  Interval:        {} ms", strategy.sync_interval_ms);
    println!("  Background sync: {}", strategy.background_sync_enabled);
}

/// Show the current strategy.
async fn cmd_strategy_show(state_dir: &Path) -> Result<()> {
    let state = open_state(state_dir)?;
    let strategy: SyncStrategy = state.load().await;

    println!("Sync strategy:");
    print_strategy(&strategy);

    Ok(())
}

/// Strategy fields given on the command line.
struct StrategyUpdate {
    priority: Option<ConflictPriority>,
    batch_size: Option<usize>,
    retry_attempts: Option<u32>,
    interval_ms: Option<u64>,
    background: Option<bool>,
}

impl StrategyUpdate {
    fn apply(self, mut strategy: SyncStrategy) -> SyncStrategy {
        if let Some(priority) = self.priority {
            strategy.priority = priority;
        }
        if let Some(batch_size) = self.batch_size {
            strategy.batch_size = batch_size;
        }
        if let Some(retry_attempts) = self.retry_attempts {
            strategy.retry_attempts = retry_attempts;
        }
        if let Some(interval_ms) = self.interval_ms {
            strategy.sync_interval_ms = interval_ms;
        }
        if let Some(background) = self.background {
            strategy.background_sync_enabled = background;
        }
        strategy
    }
}

/// Update the persisted strategy.
async fn cmd_strategy_set(state_dir: &Path, update: StrategyUpdate) -> Result<()> {
    let state = open_state(state_dir)?;
    let strategy = update.apply(state.load().await);

    strategy.validate().context("Invalid strategy")?;
    state
        .save(&strategy)
        .await
        .context("Failed to save strategy")?;
    info!("Strategy saved to {}", state_dir.display());

    println!("Sync strategy updated:");
    print_strategy(&strategy);

    Ok(())
}

/// Show sync metrics.
async fn cmd_metrics(state_dir: &Path) -> Result<()> {
    let state = open_state(state_dir)?;
    let metrics: SyncMetrics = state.load().await;

    println!("Sync metrics:");
    println!("  Runs:               {}", metrics.total_runs);
    println!("  Records synced:     {}", metrics.total_synced);
    println!("  Records failed:     {}", metrics.total_failed);
    println!("  Conflicts resolved: {}", metrics.conflicts_resolved);
    println!("  Bytes transferred:  {}", metrics.bytes_transferred);
    println!("  Average duration:   {:.1} ms", metrics.average_duration_ms);
    match metrics.last_sync_at {
        Some(at) => println!("  Last sync:          {}", at.to_rfc3339()),
        None => println!("  Last sync:          never"),
    }
    if let Some(success) = metrics.last_run_success {
        println!(
            "  Last result:        {}",
            if success { "success" } else { "failed" }
        );
    }

    Ok(())
}

/// List unresolved conflicts.
async fn cmd_conflicts_list(state_dir: &Path) -> Result<()> {
    let state = open_state(state_dir)?;
    let log: ConflictLog = state.load().await;

    if log.is_empty() {
        println!("No unresolved conflicts.");
    } else {
        println!("{} unresolved conflict(s):", log.len());
        for conflict in log.iter() {
            println!(
                "  {} [{}] fields: {} (detected {})",
                conflict.id,
                conflict.record_type,
                conflict.fields.join(", "),
                conflict.detected_at.to_rfc3339()
            );
        }
    }

    Ok(())
}

/// Print one conflict with both versions.
async fn cmd_conflicts_show(state_dir: &Path, id: &str) -> Result<()> {
    let state = open_state(state_dir)?;
    let log: ConflictLog = state.load().await;

    let conflict = log
        .get(id)
        .with_context(|| format!("No unresolved conflict with id {}", id))?;
    println!("{}", serde_json::to_string_pretty(conflict)?);

    Ok(())
}

/// List queued uploads.
async fn cmd_queue_list(state_dir: &Path) -> Result<()> {
    let queue = open_queue(state_dir).await?;
    let items = queue.items().await;

    if items.is_empty() {
        println!("Upload queue is empty.");
    } else {
        println!("{} queued upload(s):", items.len());
        for item in items {
            let status = if !item.pending {
                "done"
            } else if item.try_count > 0 {
                "retrying"
            } else {
                "pending"
            };
            println!(
                "  {} {} ({} bytes, {} failed attempt(s), {})",
                item.id, item.reference, item.size, item.try_count, status
            );
            if let Some(error) = item.last_error {
                println!("      last error: {}", error);
            }
        }
    }

    Ok(())
}

/// Stage a file for upload.
async fn cmd_queue_enqueue(state_dir: &Path, reference: &str, file: &Path) -> Result<()> {
    info!("Staging {} as {}", file.display(), reference);

    let data = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let size = data.len();

    let queue = open_queue(state_dir).await?;
    let id = queue
        .enqueue(reference, data)
        .await
        .context("Failed to enqueue upload")?;

    println!("Upload queued: {} ({} bytes)", id, size);

    Ok(())
}

/// Remove a queued upload.
async fn cmd_queue_remove(state_dir: &Path, id: &str) -> Result<()> {
    let queue = open_queue(state_dir).await?;
    queue
        .remove(id)
        .await
        .with_context(|| format!("Failed to remove upload {}", id))?;

    println!("Upload removed: {}", id);

    Ok(())
}

/// Delete orphaned staged files.
async fn cmd_queue_cleanup(state_dir: &Path) -> Result<()> {
    let queue = open_queue(state_dir).await?;
    let removed = queue
        .cleanup_orphaned()
        .await
        .context("Failed to clean up staging directory")?;

    println!("Removed {} orphaned file(s).", removed);

    Ok(())
}
