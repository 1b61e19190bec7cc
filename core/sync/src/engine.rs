//! Core sync engine that orchestrates all sync operations.

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use fieldsync_common::{Error, RecordType, Result, SyncableRecord};
use fieldsync_storage::KeyValueStore;

use crate::conflict::{
    ConflictDetector, ConflictPriority, ConflictResolver, MergePolicy, Resolution, SyncConflict,
    DEFAULT_CONFLICT_WINDOW,
};
use crate::connectivity::ConnectivityMonitor;
use crate::retry::{RetryConfig, RetryExecutor};
use crate::scheduler::{ScheduleSettings, SyncReport, SyncScheduler};
use crate::source::{LocalDataSource, RemoteDataSource, UploadQueue, UploadQueueItem};
use crate::state::{
    ConflictLog, PendingPull, RunStats, StateStore, SyncCursor, SyncMetrics, SyncStrategy,
};

/// Process-level tuning for the sync engine.
///
/// Unlike [`SyncStrategy`], this is not persisted; the host decides it at
/// construction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Clock-skew tolerance for conflict detection.
    pub conflict_window: Duration,
    /// Fields a merge may take from local.
    pub merge: MergePolicy,
    /// Upload backoff.
    pub retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            conflict_window: DEFAULT_CONFLICT_WINDOW,
            merge: MergePolicy::default(),
            retry: RetryConfig::default(),
        }
    }
}

/// Per-item result inside a phase.
#[derive(Debug)]
enum ItemOutcome {
    Synced { bytes: u64 },
    Resolved { bytes: u64 },
    Deferred(SyncConflict),
    Unchanged,
    Failed,
    Aborted(Error),
}

/// Counters and conflicts collected during one run.
#[derive(Debug, Default)]
struct RunState {
    stats: RunStats,
    conflicts: Vec<SyncConflict>,
}

impl RunState {
    /// Fold a phase's outcomes in order. Returns the first connectivity
    /// error, if any item hit one.
    fn absorb(&mut self, outcomes: Vec<ItemOutcome>) -> Result<()> {
        let mut abort = None;

        for outcome in outcomes {
            match outcome {
                ItemOutcome::Synced { bytes } => {
                    self.stats.synced += 1;
                    self.stats.bytes_transferred += bytes;
                }
                ItemOutcome::Resolved { bytes } => {
                    self.stats.synced += 1;
                    self.stats.conflicts_resolved += 1;
                    self.stats.bytes_transferred += bytes;
                }
                ItemOutcome::Deferred(conflict) => {
                    // Push and pull can both defer the same record
                    match self.conflicts.iter_mut().find(|c| c.id == conflict.id) {
                        Some(existing) => *existing = conflict,
                        None => self.conflicts.push(conflict),
                    }
                }
                ItemOutcome::Unchanged => {}
                ItemOutcome::Failed => self.stats.failed += 1,
                ItemOutcome::Aborted(err) => {
                    abort.get_or_insert(err);
                }
            }
        }

        abort.map_or(Ok(()), Err)
    }
}

/// Clears the in-progress flag when a run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Scheduler control plus the task running its loop.
struct RunningScheduler {
    scheduler: SyncScheduler,
    task: JoinHandle<()>,
}

/// Main sync engine for reconciling offline edits with the backend.
///
/// Construct once, share behind an `Arc`. At most one run executes at a
/// time, whichever of the timer, connectivity listener or a direct caller
/// starts it.
pub struct SyncEngine {
    /// On-device record store.
    local: Arc<dyn LocalDataSource>,
    /// Authoritative backend.
    remote: Arc<dyn RemoteDataSource>,
    /// Binary transfer queue.
    uploads: Arc<dyn UploadQueue>,
    /// Persisted strategy, metrics, conflicts and cursor.
    state: StateStore,
    detector: ConflictDetector,
    resolver: ConflictResolver,
    retry_executor: RetryExecutor,
    connectivity: ConnectivityMonitor,
    /// Set for the duration of a run.
    running: AtomicBool,
    /// Serializes read-modify-write of the conflict log.
    conflict_lock: Mutex<()>,
    /// Background scheduler, when started.
    scheduler: Mutex<Option<RunningScheduler>>,
}

impl SyncEngine {
    /// Create a new sync engine.
    pub fn new(
        local: Arc<dyn LocalDataSource>,
        remote: Arc<dyn RemoteDataSource>,
        uploads: Arc<dyn UploadQueue>,
        store: Arc<dyn KeyValueStore>,
        config: SyncConfig,
    ) -> Self {
        Self {
            local,
            remote,
            uploads,
            state: StateStore::new(store),
            detector: ConflictDetector::new(config.conflict_window),
            resolver: ConflictResolver::new(config.merge),
            retry_executor: RetryExecutor::new(config.retry),
            connectivity: ConnectivityMonitor::default(),
            running: AtomicBool::new(false),
            conflict_lock: Mutex::new(()),
            scheduler: Mutex::new(None),
        }
    }

    /// Use a shared connectivity monitor instead of an always-online one.
    pub fn with_connectivity(mut self, connectivity: ConnectivityMonitor) -> Self {
        self.connectivity = connectivity;
        self
    }

    /// Get the connectivity monitor.
    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    /// Whether a run is currently executing.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Current persisted strategy (defaults if none).
    pub async fn strategy(&self) -> SyncStrategy {
        self.state.load().await
    }

    /// Current persisted metrics (defaults if none).
    pub async fn metrics(&self) -> SyncMetrics {
        self.state.load().await
    }

    /// Conflicts awaiting manual resolution.
    pub async fn pending_conflicts(&self) -> Vec<SyncConflict> {
        self.state.load::<ConflictLog>().await.into_vec()
    }

    /// Run one full sync: push local changes, pull remote changes, drain the
    /// upload queue.
    ///
    /// Returns immediately with `success = false` and the stored metrics if
    /// another run is in progress.
    pub async fn sync(&self) -> SyncReport {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Sync already in progress, skipping");
            return SyncReport::skipped(self.state.load().await);
        }
        let _guard = RunGuard(&self.running);

        let start = Instant::now();
        let strategy: SyncStrategy = self.state.load().await;
        let mut run = RunState::default();

        info!(
            "Starting sync (priority {}, batch size {})",
            strategy.priority, strategy.batch_size
        );

        let aborted = match self.run_phases(&strategy, &mut run).await {
            Ok(()) => false,
            Err(e) => {
                warn!("Sync aborted: {}", e);
                true
            }
        };

        let success = !aborted && run.stats.failed == 0;
        let duration = start.elapsed();

        let previous: SyncMetrics = self.state.load().await;
        let metrics = previous.after_run(run.stats, duration, Utc::now(), success);
        if let Err(e) = self.state.save(&metrics).await {
            error!("Failed to persist sync metrics: {}", e);
        }

        if !run.conflicts.is_empty() {
            let _lock = self.conflict_lock.lock().await;
            let mut log: ConflictLog = self.state.load().await;
            for conflict in &run.conflicts {
                log.upsert(conflict.clone());
            }
            if let Err(e) = self.state.save(&log).await {
                error!("Failed to persist conflict log: {}", e);
            }
        }

        info!(
            "Sync finished in {:?}: {} synced, {} failed, {} resolved, {} deferred",
            duration,
            run.stats.synced,
            run.stats.failed,
            run.stats.conflicts_resolved,
            run.conflicts.len()
        );

        SyncReport {
            success,
            conflicts: run.conflicts,
            metrics,
            stats: run.stats,
            duration,
        }
    }

    /// Run a sync through the background scheduler if it is started, so it
    /// queues behind timer runs instead of being skipped; otherwise run
    /// directly.
    pub async fn trigger_sync(&self) -> SyncReport {
        let scheduler = self
            .scheduler
            .lock()
            .await
            .as_ref()
            .map(|running| running.scheduler.clone());

        if let Some(scheduler) = scheduler {
            match scheduler.request_sync().await {
                Ok(report) => return report,
                Err(e) => warn!("Scheduler unavailable ({}), syncing directly", e),
            }
        }
        self.sync().await
    }

    async fn run_phases(&self, strategy: &SyncStrategy, run: &mut RunState) -> Result<()> {
        if !self.connectivity.is_online() {
            return Err(Error::Connectivity("device is offline".to_string()));
        }

        self.push_local_changes(strategy, run).await?;
        self.pull_remote_changes(strategy, run).await?;
        self.drain_upload_queue(strategy, run).await
    }

    /// Phase 1: push pending local records.
    async fn push_local_changes(&self, strategy: &SyncStrategy, run: &mut RunState) -> Result<()> {
        let mut pending = Vec::new();
        for record_type in RecordType::ALL {
            if pending.len() >= strategy.batch_size {
                break;
            }
            match self.local.get_pending(record_type).await {
                Ok(records) => pending.extend(records),
                Err(e) => {
                    error!("Failed to read pending {} records: {}", record_type, e);
                    run.stats.failed += 1;
                }
            }
        }
        pending.truncate(strategy.batch_size);

        if pending.is_empty() {
            return Ok(());
        }
        debug!("Pushing {} local changes", pending.len());

        let tasks: Vec<_> = pending
            .into_iter()
            .map(|record| self.push_one(record, strategy.priority))
            .collect();
        let outcomes = join_all(tasks).await;

        run.absorb(outcomes)
    }

    async fn push_one(&self, record: SyncableRecord, priority: ConflictPriority) -> ItemOutcome {
        let remote = match self.remote.fetch(record.record_type, &record.id).await {
            Ok(remote) => remote,
            Err(e) => return Self::item_failure(&record.id, e),
        };

        if let Some(conflict) = remote
            .as_ref()
            .and_then(|remote| self.detector.detect(&record, remote))
        {
            return self.apply_resolution(conflict, priority).await;
        }

        if let Err(e) = self.remote.push(&record).await {
            return Self::item_failure(&record.id, e);
        }
        if let Err(e) = self.local.save(&record).await {
            return Self::item_failure(&record.id, e);
        }

        ItemOutcome::Synced {
            bytes: record.approximate_size(),
        }
    }

    /// Phase 2: retry earlier pull failures, then pull one page of remote
    /// changes.
    ///
    /// The cursor always moves past the page; records that failed are
    /// re-fetched by key on later runs so one bad record cannot stall the
    /// feed.
    async fn pull_remote_changes(&self, strategy: &SyncStrategy, run: &mut RunState) -> Result<()> {
        let cursor: SyncCursor = self.state.load().await;
        let mut next = cursor.clone();

        let retry_count = cursor.retry.len().min(strategy.batch_size);
        let (retrying, waiting) = cursor.retry.split_at(retry_count);
        next.retry = waiting.to_vec();

        if !retrying.is_empty() {
            debug!("Retrying {} previously failed pulls", retrying.len());
            let tasks: Vec<_> = retrying
                .iter()
                .map(|key| self.retry_pull(key, strategy.priority))
                .collect();
            let outcomes = join_all(tasks).await;
            Self::track_pull_failures(retrying.iter().cloned(), &outcomes, &mut next.retry);
            run.absorb(outcomes)?;
        }

        let delta = match self
            .remote
            .fetch_delta(cursor.cursor.as_deref(), strategy.batch_size)
            .await
        {
            Ok(delta) => delta,
            Err(e) if e.is_connectivity() => return Err(e),
            Err(e) => {
                error!("Failed to fetch remote changes: {}", e);
                run.stats.failed += 1;
                self.save_cursor(&cursor, &next).await;
                return Ok(());
            }
        };

        let mut records = delta.records;
        if records.len() > strategy.batch_size {
            warn!(
                "Remote returned {} changes for a batch of {}; deferring the rest",
                records.len(),
                strategy.batch_size
            );
            for record in records.drain(strategy.batch_size..) {
                let key = PendingPull::of(&record);
                if !next.retry.contains(&key) {
                    next.retry.push(key);
                }
            }
        }
        debug!("Pulling {} remote changes", records.len());

        let keys: Vec<PendingPull> = records.iter().map(PendingPull::of).collect();
        let tasks: Vec<_> = records
            .into_iter()
            .map(|record| self.pull_one(record, strategy.priority))
            .collect();
        let outcomes = join_all(tasks).await;
        Self::track_pull_failures(keys, &outcomes, &mut next.retry);
        run.absorb(outcomes)?;

        next.cursor = delta.next_cursor;
        self.save_cursor(&cursor, &next).await;

        Ok(())
    }

    async fn retry_pull(&self, key: &PendingPull, priority: ConflictPriority) -> ItemOutcome {
        match self.remote.fetch(key.record_type, &key.id).await {
            Ok(Some(remote)) => self.pull_one(remote, priority).await,
            Ok(None) => {
                debug!("{} {} no longer exists remotely", key.record_type, key.id);
                ItemOutcome::Unchanged
            }
            Err(e) => Self::item_failure(&key.id, e),
        }
    }

    /// Keep failed keys in the retry set and drop the ones that went through.
    fn track_pull_failures(
        keys: impl IntoIterator<Item = PendingPull>,
        outcomes: &[ItemOutcome],
        retry: &mut Vec<PendingPull>,
    ) {
        for (key, outcome) in keys.into_iter().zip(outcomes) {
            if matches!(outcome, ItemOutcome::Failed) {
                if !retry.contains(&key) {
                    retry.push(key);
                }
            } else {
                retry.retain(|k| *k != key);
            }
        }
    }

    async fn save_cursor(&self, previous: &SyncCursor, next: &SyncCursor) {
        if previous == next {
            return;
        }
        if let Err(e) = self.state.save(next).await {
            error!("Failed to persist delta cursor: {}", e);
        }
    }

    async fn pull_one(&self, remote: SyncableRecord, priority: ConflictPriority) -> ItemOutcome {
        let local = match self.local.get(remote.record_type, &remote.id).await {
            Ok(local) => local,
            Err(e) => return Self::item_failure(&remote.id, e),
        };

        if let Some(local) = &local {
            if let Some(conflict) = self.detector.detect(local, &remote) {
                return self.apply_resolution(conflict, priority).await;
            }
            if *local == remote || local.updated_at > remote.updated_at {
                return ItemOutcome::Unchanged;
            }
        }

        if let Err(e) = self.local.save(&remote).await {
            return Self::item_failure(&remote.id, e);
        }
        ItemOutcome::Synced {
            bytes: remote.approximate_size(),
        }
    }

    /// Write the resolved value to whichever side does not hold it yet.
    async fn apply_resolution(
        &self,
        conflict: SyncConflict,
        priority: ConflictPriority,
    ) -> ItemOutcome {
        debug!(
            "Conflict on {} {} in fields {:?}",
            conflict.record_type, conflict.id, conflict.fields
        );

        let resolved = match self.resolver.resolve(&conflict, priority) {
            Resolution::Resolved(resolved) => resolved,
            Resolution::Deferred => {
                info!(
                    "Conflict on {} {} deferred for manual resolution",
                    conflict.record_type, conflict.id
                );
                return ItemOutcome::Deferred(conflict);
            }
        };

        let mut bytes = 0;
        if resolved != conflict.remote {
            if let Err(e) = self.remote.push(&resolved).await {
                return Self::item_failure(&resolved.id, e);
            }
            bytes += resolved.approximate_size();
        }
        // Also clears the pending marker when local already held this value
        if let Err(e) = self.local.save(&resolved).await {
            return Self::item_failure(&resolved.id, e);
        }

        ItemOutcome::Resolved { bytes }
    }

    /// Phase 3: drain pending binary transfers.
    async fn drain_upload_queue(&self, strategy: &SyncStrategy, run: &mut RunState) -> Result<()> {
        let items = match self.uploads.list_pending(strategy.retry_attempts).await {
            Ok(items) => items,
            Err(e) => {
                error!("Failed to list upload queue: {}", e);
                run.stats.failed += 1;
                return Ok(());
            }
        };

        if items.is_empty() {
            return Ok(());
        }
        let batch: Vec<UploadQueueItem> = items.into_iter().take(strategy.batch_size).collect();
        debug!("Draining {} queued uploads", batch.len());

        let tasks: Vec<_> = batch
            .into_iter()
            .map(|item| self.upload_one(item, strategy.retry_attempts))
            .collect();
        let outcomes = join_all(tasks).await;

        run.absorb(outcomes)
    }

    async fn upload_one(&self, mut item: UploadQueueItem, max_attempts: u32) -> ItemOutcome {
        let remaining = max_attempts.saturating_sub(item.try_count);
        let uploads = &self.uploads;
        let item_ref = &item;
        let outcome = self
            .retry_executor
            .execute(remaining, move |_| uploads.attempt(item_ref))
            .await;

        let result = match outcome.result {
            Ok(()) => {
                item.try_count += outcome.attempts.saturating_sub(1);
                item.pending = false;
                item.last_error = None;
                Ok(item.size)
            }
            Err(e) if e.is_connectivity() => {
                // Only earlier transfer failures count against the item
                item.try_count += outcome.attempts.saturating_sub(1);
                warn!("Upload {} interrupted by connectivity loss: {}", item.id, e);
                Err(e)
            }
            Err(e) => {
                item.try_count += outcome.attempts;
                item.last_error = Some(e.to_string());
                error!(
                    "Upload {} ({}) failed after {} attempts: {}",
                    item.id, item.reference, item.try_count, e
                );
                Err(e)
            }
        };

        if let Err(e) = self.uploads.update(&item).await {
            warn!("Failed to record upload state for {}: {}", item.id, e);
        }

        match result {
            Ok(bytes) => ItemOutcome::Synced { bytes },
            Err(e) if e.is_connectivity() => ItemOutcome::Aborted(e),
            Err(_) => ItemOutcome::Failed,
        }
    }

    fn item_failure(id: &str, err: Error) -> ItemOutcome {
        if err.is_connectivity() {
            ItemOutcome::Aborted(err)
        } else {
            warn!("Failed to sync {}: {}", id, err);
            ItemOutcome::Failed
        }
    }

    /// Apply a human decision for a deferred conflict.
    ///
    /// Writes `resolution` to both stores, then removes the conflict from
    /// the log. If either write fails the conflict stays logged.
    ///
    /// # Errors
    /// - `Error::NotFound` if no conflict is logged for `conflict_id`
    /// - `Error::InvalidInput` if `resolution` is a different record
    /// - Any error from the data sources or the state store
    pub async fn resolve_manually(&self, conflict_id: &str, resolution: SyncableRecord) -> Result<()> {
        let _lock = self.conflict_lock.lock().await;
        let mut log: ConflictLog = self.state.load().await;

        let conflict = log
            .get(conflict_id)
            .ok_or_else(|| Error::NotFound(format!("No pending conflict for {}", conflict_id)))?;
        if resolution.id != conflict.id || resolution.record_type != conflict.record_type {
            return Err(Error::InvalidInput(format!(
                "Resolution for {} {} does not match conflict {} {}",
                resolution.record_type, resolution.id, conflict.record_type, conflict.id
            )));
        }

        self.remote.push(&resolution).await?;
        self.local.save(&resolution).await?;

        log.remove(conflict_id);
        self.state.save(&log).await?;

        info!("Conflict on {} resolved manually", conflict_id);
        Ok(())
    }

    /// Persist a new strategy and re-arm or stop the background scheduler
    /// to match it.
    pub async fn set_strategy(self: &Arc<Self>, strategy: SyncStrategy) -> Result<()> {
        strategy.validate()?;
        self.state.save(&strategy).await?;
        info!(
            "Sync strategy updated: priority {}, batch {}, retries {}, interval {}ms, background {}",
            strategy.priority,
            strategy.batch_size,
            strategy.retry_attempts,
            strategy.sync_interval_ms,
            strategy.background_sync_enabled
        );

        if strategy.background_sync_enabled {
            self.start_scheduler(ScheduleSettings::from(&strategy)).await;
        } else {
            self.stop().await;
        }
        Ok(())
    }

    /// Start background sync according to the persisted strategy.
    pub async fn start(self: &Arc<Self>) {
        let strategy: SyncStrategy = self.state.load().await;
        if strategy.background_sync_enabled {
            self.start_scheduler(ScheduleSettings::from(&strategy)).await;
        } else {
            debug!("Background sync disabled, scheduler not started");
        }
    }

    /// Whether the background scheduler is running.
    pub async fn is_scheduled(&self) -> bool {
        self.scheduler.lock().await.is_some()
    }

    async fn start_scheduler(self: &Arc<Self>, settings: ScheduleSettings) {
        let mut slot = self.scheduler.lock().await;

        if let Some(running) = slot.as_ref() {
            if running.scheduler.reconfigure(settings).await.is_ok() {
                return;
            }
            warn!("Scheduler loop exited unexpectedly, restarting");
        }

        let (scheduler, handle) =
            SyncScheduler::new(settings, Some(self.connectivity.subscribe()));
        let engine = Arc::downgrade(self);
        let task = tokio::spawn(handle.run(move |trigger| {
            let engine = engine.clone();
            async move {
                match engine.upgrade() {
                    Some(engine) => {
                        debug!("Sync triggered by {:?}", trigger);
                        engine.sync().await
                    }
                    None => SyncReport::skipped(SyncMetrics::default()),
                }
            }
        }));

        *slot = Some(RunningScheduler { scheduler, task });
    }

    /// Stop background sync: cancel the timer and the connectivity listener.
    ///
    /// Waits for a scheduler-driven run in progress to finish. Safe to call
    /// repeatedly.
    pub async fn stop(&self) {
        let running = self.scheduler.lock().await.take();
        if let Some(running) = running {
            running.scheduler.shutdown().await;
            if let Err(e) = running.task.await {
                warn!("Scheduler task ended abnormally: {}", e);
            }
            info!("Background sync stopped");
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Some(running) = self.scheduler.get_mut().take() {
            running.task.abort();
        }
    }
}
