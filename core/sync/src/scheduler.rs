//! Sync scheduling - periodic timer and connectivity-driven runs.
//!
//! A single background loop consumes three producers: the periodic ticker,
//! connectivity transitions, and control commands. Runs execute inline in
//! that loop, so the scheduler never starts a run while its previous one is
//! still going.

use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use fieldsync_common::{Error, Result};

use crate::conflict::SyncConflict;
use crate::state::{RunStats, SyncMetrics, SyncStrategy};

/// What caused a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Periodic timer fired.
    Timer,
    /// Connectivity came back after being lost.
    ConnectivityRestored,
    /// Explicit request through the scheduler.
    Manual,
}

/// Sync result from the engine.
#[derive(Debug, Clone)]
pub struct SyncReport {
    /// True only if the run completed with no failed items.
    pub success: bool,
    /// Conflicts deferred for manual resolution during this run.
    pub conflicts: Vec<SyncConflict>,
    /// Metrics after the run (or the last known ones if the run was skipped).
    pub metrics: SyncMetrics,
    /// Counters of this run alone.
    pub stats: RunStats,
    pub duration: Duration,
}

impl SyncReport {
    /// Report for a run that never started.
    pub fn skipped(metrics: SyncMetrics) -> Self {
        Self {
            success: false,
            conflicts: Vec::new(),
            metrics,
            stats: RunStats::default(),
            duration: Duration::ZERO,
        }
    }
}

/// Timer settings derived from the strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleSettings {
    pub interval: Duration,
    pub enabled: bool,
}

impl From<&SyncStrategy> for ScheduleSettings {
    fn from(strategy: &SyncStrategy) -> Self {
        Self {
            interval: strategy.sync_interval(),
            enabled: strategy.background_sync_enabled,
        }
    }
}

enum SchedulerCommand {
    Reconfigure(ScheduleSettings),
    SyncNow(oneshot::Sender<SyncReport>),
    Shutdown,
}

/// Control side of the scheduler.
#[derive(Clone)]
pub struct SyncScheduler {
    control_tx: mpsc::Sender<SchedulerCommand>,
}

impl SyncScheduler {
    /// Create a scheduler. `connectivity` is optional; without it only the
    /// timer and explicit requests trigger runs.
    pub fn new(
        settings: ScheduleSettings,
        mut connectivity: Option<watch::Receiver<bool>>,
    ) -> (Self, SyncSchedulerHandle) {
        let (control_tx, control_rx) = mpsc::channel(16);
        // Snapshot now so transitions made before the loop starts still count
        let online = connectivity
            .as_mut()
            .map(|rx| *rx.borrow_and_update())
            .unwrap_or(true);

        let scheduler = Self { control_tx };
        let handle = SyncSchedulerHandle {
            settings,
            control_rx,
            connectivity,
            online,
        };

        (scheduler, handle)
    }

    /// Run a sync through the scheduler loop and wait for its report.
    pub async fn request_sync(&self) -> Result<SyncReport> {
        let (response_tx, response_rx) = oneshot::channel();

        self.control_tx
            .send(SchedulerCommand::SyncNow(response_tx))
            .await
            .map_err(|_| Error::InvalidInput("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::InvalidInput("Failed to receive sync report".to_string()))
    }

    /// Re-arm the timer with new settings.
    pub async fn reconfigure(&self, settings: ScheduleSettings) -> Result<()> {
        self.control_tx
            .send(SchedulerCommand::Reconfigure(settings))
            .await
            .map_err(|_| Error::InvalidInput("Scheduler not running".to_string()))
    }

    /// Ask the loop to exit. Safe to call repeatedly or after exit.
    pub async fn shutdown(&self) {
        let _ = self.control_tx.send(SchedulerCommand::Shutdown).await;
    }
}

/// Handle for the scheduler background task.
pub struct SyncSchedulerHandle {
    settings: ScheduleSettings,
    control_rx: mpsc::Receiver<SchedulerCommand>,
    connectivity: Option<watch::Receiver<bool>>,
    online: bool,
}

impl SyncSchedulerHandle {
    /// Run the scheduler loop until shutdown.
    ///
    /// This should be spawned in a tokio task. `sync_fn` is awaited inline
    /// for every trigger.
    pub async fn run<F, Fut>(mut self, sync_fn: F)
    where
        F: Fn(SyncTrigger) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SyncReport> + Send,
    {
        let mut settings = self.settings;
        let mut ticker = Self::create_ticker(&settings);
        let mut connectivity = self.connectivity.take();
        let mut online = self.online;

        info!(
            "Sync scheduler started (interval {:?}, background {})",
            settings.interval, settings.enabled
        );

        loop {
            tokio::select! {
                command = self.control_rx.recv() => {
                    match command {
                        Some(SchedulerCommand::Reconfigure(new_settings)) => {
                            if new_settings != settings {
                                debug!("Re-arming sync timer: {:?}", new_settings);
                                ticker = Self::create_ticker(&new_settings);
                                settings = new_settings;
                            }
                        }
                        Some(SchedulerCommand::SyncNow(response_tx)) => {
                            let report = sync_fn(SyncTrigger::Manual).await;
                            let _ = response_tx.send(report);
                        }
                        Some(SchedulerCommand::Shutdown) | None => {
                            info!("Sync scheduler shutting down");
                            break;
                        }
                    }
                }

                _ = Self::wait_for_tick(&mut ticker) => {
                    debug!("Triggering periodic sync");
                    let report = sync_fn(SyncTrigger::Timer).await;
                    Self::log_report(SyncTrigger::Timer, &report);
                }

                change = Self::wait_for_connectivity(&mut connectivity) => {
                    match change {
                        Some(now_online) => {
                            let restored = !online && now_online;
                            online = now_online;
                            if restored {
                                debug!("Connectivity restored, triggering sync");
                                let report = sync_fn(SyncTrigger::ConnectivityRestored).await;
                                Self::log_report(SyncTrigger::ConnectivityRestored, &report);
                            }
                        }
                        None => {
                            debug!("Connectivity source closed");
                            connectivity = None;
                        }
                    }
                }
            }
        }
    }

    fn create_ticker(settings: &ScheduleSettings) -> Option<Interval> {
        if !settings.enabled || settings.interval.is_zero() {
            return None;
        }
        let mut ticker = interval_at(Instant::now() + settings.interval, settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(ticker)
    }

    async fn wait_for_tick(ticker: &mut Option<Interval>) {
        match ticker {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => std::future::pending().await,
        }
    }

    /// Next reachability value, or `None` once the sender is gone.
    async fn wait_for_connectivity(rx: &mut Option<watch::Receiver<bool>>) -> Option<bool> {
        match rx {
            Some(rx) => match rx.changed().await {
                Ok(()) => Some(*rx.borrow_and_update()),
                Err(_) => None,
            },
            None => std::future::pending().await,
        }
    }

    fn log_report(trigger: SyncTrigger, report: &SyncReport) {
        if report.success {
            info!(
                "{:?} sync completed: {} synced, {} conflicts deferred",
                trigger,
                report.stats.synced,
                report.conflicts.len()
            );
        } else {
            error!(
                "{:?} sync did not succeed: {} failed, {} conflicts deferred",
                trigger,
                report.stats.failed,
                report.conflicts.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    fn ok_report() -> SyncReport {
        SyncReport {
            success: true,
            ..SyncReport::skipped(SyncMetrics::default())
        }
    }

    fn spawn_counting(
        handle: SyncSchedulerHandle,
    ) -> (Arc<Mutex<Vec<SyncTrigger>>>, tokio::task::JoinHandle<()>) {
        let triggers = Arc::new(Mutex::new(Vec::new()));
        let triggers_clone = triggers.clone();
        let task = tokio::spawn(handle.run(move |trigger| {
            let triggers = triggers_clone.clone();
            async move {
                triggers.lock().unwrap().push(trigger);
                ok_report()
            }
        }));
        (triggers, task)
    }

    fn settings(ms: u64, enabled: bool) -> ScheduleSettings {
        ScheduleSettings {
            interval: Duration::from_millis(ms),
            enabled,
        }
    }

    #[tokio::test]
    async fn test_sync_request() {
        let (scheduler, handle) = SyncScheduler::new(settings(60_000, true), None);
        let (triggers, task) = spawn_counting(handle);

        let report = scheduler.request_sync().await.unwrap();
        assert!(report.success);
        assert_eq!(*triggers.lock().unwrap(), vec![SyncTrigger::Manual]);

        scheduler.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_timer_fires_when_enabled() {
        let (scheduler, handle) = SyncScheduler::new(settings(20, true), None);
        let (triggers, task) = spawn_counting(handle);

        tokio::time::sleep(Duration::from_millis(110)).await;
        scheduler.shutdown().await;
        task.await.unwrap();

        let triggers = triggers.lock().unwrap();
        assert!(triggers.len() >= 2);
        assert!(triggers.iter().all(|t| *t == SyncTrigger::Timer));
    }

    #[tokio::test]
    async fn test_timer_silent_when_disabled() {
        let (scheduler, handle) = SyncScheduler::new(settings(10, false), None);
        let (triggers, task) = spawn_counting(handle);

        tokio::time::sleep(Duration::from_millis(60)).await;
        scheduler.shutdown().await;
        task.await.unwrap();

        assert!(triggers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconfigure_stops_timer() {
        let (scheduler, handle) = SyncScheduler::new(settings(15, true), None);
        let (triggers, task) = spawn_counting(handle);

        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.reconfigure(settings(15, false)).await.unwrap();
        // Let the loop process the command
        scheduler.request_sync().await.unwrap();
        let count_after_disable = triggers.lock().unwrap().len();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(triggers.lock().unwrap().len(), count_after_disable);

        scheduler.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_connectivity_restored_triggers_once() {
        let (tx, rx) = watch::channel(false);
        let (scheduler, handle) = SyncScheduler::new(settings(60_000, true), Some(rx));
        let (triggers, task) = spawn_counting(handle);

        tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Going offline is not a trigger
        tx.send(false).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        scheduler.shutdown().await;
        task.await.unwrap();

        assert_eq!(
            *triggers.lock().unwrap(),
            vec![SyncTrigger::ConnectivityRestored]
        );
    }

    #[tokio::test]
    async fn test_runs_never_overlap() {
        let (tx, rx) = watch::channel(false);
        let (scheduler, handle) = SyncScheduler::new(settings(5, true), Some(rx));

        let active = Arc::new(AtomicU32::new(0));
        let max_active = Arc::new(AtomicU32::new(0));
        let (active_c, max_c) = (active.clone(), max_active.clone());
        let task = tokio::spawn(handle.run(move |_| {
            let active = active_c.clone();
            let max_active = max_c.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(15)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                ok_report()
            }
        }));

        for online in [true, false, true, false, true] {
            tx.send(online).unwrap();
            tokio::time::sleep(Duration::from_millis(7)).await;
        }

        scheduler.shutdown().await;
        task.await.unwrap();
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (scheduler, handle) = SyncScheduler::new(settings(60_000, true), None);
        let (_triggers, task) = spawn_counting(handle);

        scheduler.shutdown().await;
        scheduler.shutdown().await;
        task.await.unwrap();
        scheduler.shutdown().await;

        assert!(scheduler.request_sync().await.is_err());
    }
}
