//! FieldSync Sync Engine
//!
//! Offline-first reconciliation between an on-device record store and a
//! remote backend:
//! - Push of pending local edits, then pull of remote changes
//! - Conflict detection within a clock-skew window, resolved by priority
//! - Upload queue drained with exponential backoff
//! - Background runs on a timer and on connectivity restoration
//! - Strategy, metrics and unresolved conflicts persisted across restarts

pub mod conflict;
pub mod connectivity;
pub mod engine;
pub mod memory;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod source;
pub mod state;

// Re-export main types
pub use conflict::{
    ConflictDetector, ConflictPriority, ConflictResolver, MergePolicy, Resolution, SyncConflict,
};
pub use connectivity::ConnectivityMonitor;
pub use engine::{SyncConfig, SyncEngine};
pub use queue::StagedUploadQueue;
pub use retry::{RetryConfig, RetryExecutor, RetryOutcome};
pub use scheduler::{ScheduleSettings, SyncReport, SyncScheduler, SyncSchedulerHandle, SyncTrigger};
pub use source::{
    Delta, LocalDataSource, RemoteDataSource, UploadQueue, UploadQueueItem, UploadTransport,
};
pub use state::{
    ConflictLog, PendingPull, RunStats, StateStore, SyncCursor, SyncMetrics, SyncStrategy,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        // Verify all main types are accessible
        let _config = SyncConfig::default();
        let _retry_config = RetryConfig::default();
        let _resolver = ConflictResolver::default();
        let _detector = ConflictDetector::default();
        let _strategy = SyncStrategy::default();
        let _monitor = ConnectivityMonitor::default();
    }
}
