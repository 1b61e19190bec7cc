//! Sync state tracking and persistence.
//!
//! Strategy, metrics, the conflict log and the delta cursor are stored as
//! independently keyed records in a [`KeyValueStore`], each wrapped in a
//! versioned envelope. Anything missing, malformed or written by another
//! schema version loads as the documented default.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use fieldsync_common::{Error, RecordType, Result, SyncableRecord};
use fieldsync_storage::KeyValueStore;

use crate::conflict::{ConflictPriority, SyncConflict};

/// Schema version written into every envelope.
pub const SCHEMA_VERSION: u32 = 1;

/// A typed record with a fixed key in the state store.
pub trait PersistedRecord: Serialize + DeserializeOwned + Default + Send + Sync {
    /// Store key.
    const KEY: &'static str;

    /// Reject a decoded value that breaks the record's invariants.
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    schema_version: u32,
    saved_at: DateTime<Utc>,
    data: T,
}

/// Persisted sync policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStrategy {
    /// How detected conflicts are resolved.
    pub priority: ConflictPriority,
    /// Items processed per phase per run.
    pub batch_size: usize,
    /// Upload attempts before an item is given up on.
    pub retry_attempts: u32,
    /// Background timer period.
    pub sync_interval_ms: u64,
    /// Whether the timer runs at all.
    pub background_sync_enabled: bool,
}

impl SyncStrategy {
    /// Check the invariants the setter enforces.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidInput("batch_size must be at least 1".to_string()));
        }
        if self.sync_interval_ms == 0 {
            return Err(Error::InvalidInput(
                "sync_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Background timer period.
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }
}

impl Default for SyncStrategy {
    fn default() -> Self {
        Self {
            priority: ConflictPriority::Merge,
            batch_size: 10,
            retry_attempts: 3,
            sync_interval_ms: 300_000,
            background_sync_enabled: true,
        }
    }
}

impl PersistedRecord for SyncStrategy {
    const KEY: &'static str = "sync.strategy";

    fn validate(&self) -> Result<()> {
        SyncStrategy::validate(self)
    }
}

/// Counters accumulated by a single run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub synced: u64,
    pub failed: u64,
    pub conflicts_resolved: u64,
    pub bytes_transferred: u64,
}

/// Running totals across all runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncMetrics {
    pub total_synced: u64,
    pub total_failed: u64,
    pub total_runs: u64,
    /// Mean run duration in milliseconds.
    pub average_duration_ms: f64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_run_success: Option<bool>,
    pub conflicts_resolved: u64,
    /// Approximate payload bytes moved in either direction.
    pub bytes_transferred: u64,
}

impl SyncMetrics {
    /// Produce the replacement metrics after a finished run.
    pub fn after_run(
        &self,
        stats: RunStats,
        elapsed: Duration,
        finished_at: DateTime<Utc>,
        success: bool,
    ) -> Self {
        let runs = self.total_runs + 1;
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        let average_duration_ms =
            self.average_duration_ms + (elapsed_ms - self.average_duration_ms) / runs as f64;

        Self {
            total_synced: self.total_synced + stats.synced,
            total_failed: self.total_failed + stats.failed,
            total_runs: runs,
            average_duration_ms,
            last_sync_at: Some(finished_at),
            last_run_success: Some(success),
            conflicts_resolved: self.conflicts_resolved + stats.conflicts_resolved,
            bytes_transferred: self.bytes_transferred + stats.bytes_transferred,
        }
    }
}

impl PersistedRecord for SyncMetrics {
    const KEY: &'static str = "sync.metrics";
}

/// Conflicts awaiting manual resolution, at most one per record id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConflictLog {
    conflicts: Vec<SyncConflict>,
}

impl ConflictLog {
    /// Record a conflict, replacing any earlier entry for the same record.
    pub fn upsert(&mut self, conflict: SyncConflict) {
        match self.conflicts.iter_mut().find(|c| c.id == conflict.id) {
            Some(existing) => *existing = conflict,
            None => self.conflicts.push(conflict),
        }
    }

    /// Remove and return the conflict for `id`.
    pub fn remove(&mut self, id: &str) -> Option<SyncConflict> {
        let pos = self.conflicts.iter().position(|c| c.id == id)?;
        Some(self.conflicts.remove(pos))
    }

    pub fn get(&self, id: &str) -> Option<&SyncConflict> {
        self.conflicts.iter().find(|c| c.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SyncConflict> {
        self.conflicts.iter()
    }

    pub fn len(&self) -> usize {
        self.conflicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }

    pub fn into_vec(self) -> Vec<SyncConflict> {
        self.conflicts
    }
}

impl PersistedRecord for ConflictLog {
    const KEY: &'static str = "sync.conflicts";
}

/// A remote record whose pull failed and is retried by key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPull {
    #[serde(rename = "type")]
    pub record_type: RecordType,
    pub id: String,
}

impl PendingPull {
    pub fn of(record: &SyncableRecord) -> Self {
        Self {
            record_type: record.record_type,
            id: record.id.clone(),
        }
    }
}

/// Position in the remote change feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub cursor: Option<String>,
    /// Records behind the cursor that still need pulling.
    #[serde(default)]
    pub retry: Vec<PendingPull>,
}

impl PersistedRecord for SyncCursor {
    const KEY: &'static str = "sync.cursor";
}

/// Typed access to engine state in a key-value store.
#[derive(Clone)]
pub struct StateStore {
    store: Arc<dyn KeyValueStore>,
}

impl StateStore {
    /// Wrap a key-value store.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Load a record, or `None` if it has never been saved.
    ///
    /// # Errors
    /// - Storage I/O failure
    /// - Malformed content, a foreign schema version or an invalid value
    pub async fn try_load<T: PersistedRecord>(&self) -> Result<Option<T>> {
        let Some(bytes) = self.store.get(T::KEY).await? else {
            return Ok(None);
        };

        let envelope: Envelope<serde_json::Value> = serde_json::from_slice(&bytes)?;
        if envelope.schema_version != SCHEMA_VERSION {
            return Err(Error::Serialization(format!(
                "{} has schema version {}, expected {}",
                T::KEY,
                envelope.schema_version,
                SCHEMA_VERSION
            )));
        }

        let value: T = serde_json::from_value(envelope.data)?;
        value.validate()?;
        Ok(Some(value))
    }

    /// Load a record, falling back to its default on any failure.
    pub async fn load<T: PersistedRecord>(&self) -> T {
        match self.try_load::<T>().await {
            Ok(Some(value)) => value,
            Ok(None) => {
                debug!("{} not found in {} store, using defaults", T::KEY, self.store.name());
                T::default()
            }
            Err(e) => {
                warn!("Failed to load {}: {}. Using defaults", T::KEY, e);
                T::default()
            }
        }
    }

    /// Save a record, replacing the previous value.
    pub async fn save<T: PersistedRecord>(&self, value: &T) -> Result<()> {
        let envelope = Envelope {
            schema_version: SCHEMA_VERSION,
            saved_at: Utc::now(),
            data: value,
        };
        let bytes = serde_json::to_vec_pretty(&envelope)?;
        self.store.put(T::KEY, bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_common::{RecordType, SyncableRecord};
    use fieldsync_storage::MemoryStore;

    fn conflict(id: &str, status: &str) -> SyncConflict {
        let mut local = SyncableRecord::new(id, RecordType::Inspection, Default::default()).unwrap();
        local
            .data
            .insert("status".to_string(), serde_json::json!(status));
        let remote = SyncableRecord::new(id, RecordType::Inspection, Default::default()).unwrap();
        SyncConflict {
            id: id.to_string(),
            record_type: RecordType::Inspection,
            local,
            remote,
            fields: vec!["status".to_string()],
            detected_at: Utc::now(),
        }
    }

    #[test]
    fn test_strategy_defaults() {
        let strategy = SyncStrategy::default();
        assert_eq!(strategy.priority, ConflictPriority::Merge);
        assert_eq!(strategy.batch_size, 10);
        assert_eq!(strategy.retry_attempts, 3);
        assert_eq!(strategy.sync_interval(), Duration::from_secs(300));
        assert!(strategy.background_sync_enabled);
        assert!(strategy.validate().is_ok());
    }

    #[test]
    fn test_strategy_validation() {
        let zero_batch = SyncStrategy {
            batch_size: 0,
            ..Default::default()
        };
        assert!(zero_batch.validate().is_err());

        let zero_interval = SyncStrategy {
            sync_interval_ms: 0,
            ..Default::default()
        };
        assert!(zero_interval.validate().is_err());
    }

    #[test]
    fn test_metrics_running_average() {
        let now = Utc::now();
        let stats = RunStats {
            synced: 3,
            failed: 1,
            conflicts_resolved: 1,
            bytes_transferred: 100,
        };

        let first = SyncMetrics::default().after_run(stats, Duration::from_millis(100), now, false);
        let second = first.after_run(RunStats::default(), Duration::from_millis(300), now, true);

        assert_eq!(second.total_runs, 2);
        assert_eq!(second.total_synced, 3);
        assert_eq!(second.total_failed, 1);
        assert_eq!(second.bytes_transferred, 100);
        assert!((second.average_duration_ms - 200.0).abs() < 1e-6);
        assert_eq!(second.last_run_success, Some(true));
        assert_eq!(second.last_sync_at, Some(now));
    }

    #[test]
    fn test_conflict_log_deduplicates_by_id() {
        let mut log = ConflictLog::default();
        log.upsert(conflict("r1", "a"));
        log.upsert(conflict("r2", "a"));
        log.upsert(conflict("r1", "b"));

        assert_eq!(log.len(), 2);
        assert_eq!(
            log.get("r1").unwrap().local.field("status"),
            Some(&serde_json::json!("b"))
        );

        assert!(log.remove("r1").is_some());
        assert!(log.remove("r1").is_none());
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_keys_load_defaults() {
        let state = StateStore::new(Arc::new(MemoryStore::new()));
        assert_eq!(state.load::<SyncStrategy>().await, SyncStrategy::default());
        assert_eq!(state.load::<SyncMetrics>().await, SyncMetrics::default());
        assert!(state.load::<ConflictLog>().await.is_empty());
        assert!(state.try_load::<SyncCursor>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let state = StateStore::new(Arc::new(MemoryStore::new()));
        let strategy = SyncStrategy {
            priority: ConflictPriority::Manual,
            batch_size: 25,
            ..Default::default()
        };
        state.save(&strategy).await.unwrap();
        assert_eq!(state.load::<SyncStrategy>().await, strategy);
    }

    #[tokio::test]
    async fn test_malformed_state_degrades_to_defaults() {
        let kv = MemoryStore::new();
        kv.put(SyncStrategy::KEY, b"{not json".to_vec()).await.unwrap();
        let state = StateStore::new(Arc::new(kv));

        assert!(state.try_load::<SyncStrategy>().await.is_err());
        assert_eq!(state.load::<SyncStrategy>().await, SyncStrategy::default());
    }

    #[tokio::test]
    async fn test_foreign_schema_version_degrades_to_defaults() {
        let kv = MemoryStore::new();
        let body = serde_json::json!({
            "schema_version": 99,
            "saved_at": Utc::now(),
            "data": {"cursor": "abc"}
        });
        kv.put(SyncCursor::KEY, serde_json::to_vec(&body).unwrap())
            .await
            .unwrap();
        let state = StateStore::new(Arc::new(kv));

        assert_eq!(state.load::<SyncCursor>().await, SyncCursor::default());
    }

    #[tokio::test]
    async fn test_invalid_strategy_in_store_loads_defaults() {
        let kv = MemoryStore::new();
        let body = serde_json::json!({
            "schema_version": SCHEMA_VERSION,
            "saved_at": Utc::now(),
            "data": {
                "priority": "local",
                "batch_size": 0,
                "retry_attempts": 1,
                "sync_interval_ms": 1000,
                "background_sync_enabled": false
            }
        });
        kv.put(SyncStrategy::KEY, serde_json::to_vec(&body).unwrap())
            .await
            .unwrap();
        let state = StateStore::new(Arc::new(kv));

        assert!(matches!(
            state.try_load::<SyncStrategy>().await,
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(state.load::<SyncStrategy>().await, SyncStrategy::default());
    }

    #[tokio::test]
    async fn test_cursor_without_retry_set_loads() {
        let kv = MemoryStore::new();
        let body = serde_json::json!({
            "schema_version": SCHEMA_VERSION,
            "saved_at": Utc::now(),
            "data": {"cursor": "7"}
        });
        kv.put(SyncCursor::KEY, serde_json::to_vec(&body).unwrap())
            .await
            .unwrap();
        let state = StateStore::new(Arc::new(kv));

        let cursor = state.load::<SyncCursor>().await;
        assert_eq!(cursor.cursor.as_deref(), Some("7"));
        assert!(cursor.retry.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_priority_in_store_loads_as_remote() {
        let kv = MemoryStore::new();
        let body = serde_json::json!({
            "schema_version": SCHEMA_VERSION,
            "saved_at": Utc::now(),
            "data": {
                "priority": "whatever",
                "batch_size": 5,
                "retry_attempts": 1,
                "sync_interval_ms": 1000,
                "background_sync_enabled": false
            }
        });
        kv.put(SyncStrategy::KEY, serde_json::to_vec(&body).unwrap())
            .await
            .unwrap();
        let state = StateStore::new(Arc::new(kv));

        let strategy = state.load::<SyncStrategy>().await;
        assert_eq!(strategy.priority, ConflictPriority::Remote);
        assert_eq!(strategy.batch_size, 5);
    }
}
