//! In-memory collaborators for testing.
//!
//! Useful for tests, demos and development. All data is stored in memory
//! and lost on drop. Each type can be told to fail in the ways the real
//! backends fail, so engine behavior under errors can be exercised.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

use fieldsync_common::{Error, RecordType, Result, SyncableRecord};

use crate::source::{Delta, LocalDataSource, RemoteDataSource, UploadQueue, UploadQueueItem};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
struct LocalEntry {
    record: SyncableRecord,
    pending: bool,
}

/// In-memory local store.
#[derive(Default)]
pub struct MemoryLocalSource {
    entries: Mutex<Vec<LocalEntry>>,
    failing_saves: Mutex<HashSet<String>>,
}

impl MemoryLocalSource {
    /// Create a new empty local store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record with its pending marker set, as the app
    /// does after an offline edit.
    pub fn insert_pending(&self, record: SyncableRecord) {
        self.upsert(record, true);
    }

    /// Insert or replace an acknowledged record.
    pub fn insert_synced(&self, record: SyncableRecord) {
        self.upsert(record, false);
    }

    /// Make every `save` of record `id` fail.
    pub fn fail_saves_for(&self, id: impl Into<String>) {
        lock(&self.failing_saves).insert(id.into());
    }

    /// Let saves of record `id` succeed again.
    pub fn allow_saves_for(&self, id: &str) {
        lock(&self.failing_saves).remove(id);
    }

    /// Current copy of a record.
    pub fn record(&self, record_type: RecordType, id: &str) -> Option<SyncableRecord> {
        lock(&self.entries)
            .iter()
            .find(|e| e.record.record_type == record_type && e.record.id == id)
            .map(|e| e.record.clone())
    }

    /// Whether a record still carries its pending marker.
    pub fn is_pending(&self, record_type: RecordType, id: &str) -> bool {
        lock(&self.entries)
            .iter()
            .any(|e| e.record.record_type == record_type && e.record.id == id && e.pending)
    }

    fn upsert(&self, record: SyncableRecord, pending: bool) {
        let mut entries = lock(&self.entries);
        let existing = entries
            .iter_mut()
            .find(|e| e.record.record_type == record.record_type && e.record.id == record.id);
        match existing {
            Some(entry) => {
                entry.record = record;
                entry.pending = pending;
            }
            None => entries.push(LocalEntry { record, pending }),
        }
    }
}

#[async_trait]
impl LocalDataSource for MemoryLocalSource {
    async fn get_pending(&self, record_type: RecordType) -> Result<Vec<SyncableRecord>> {
        Ok(lock(&self.entries)
            .iter()
            .filter(|e| e.pending && e.record.record_type == record_type)
            .map(|e| e.record.clone())
            .collect())
    }

    async fn get(&self, record_type: RecordType, id: &str) -> Result<Option<SyncableRecord>> {
        Ok(self.record(record_type, id))
    }

    async fn save(&self, record: &SyncableRecord) -> Result<()> {
        if lock(&self.failing_saves).contains(&record.id) {
            return Err(Error::Storage(format!("Local save failed for {}", record.id)));
        }
        self.upsert(record.clone(), false);
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct RemoteEntry {
    record: SyncableRecord,
    seq: u64,
}

#[derive(Default)]
struct RemoteState {
    entries: Vec<RemoteEntry>,
    next_seq: u64,
    pushed: Vec<SyncableRecord>,
}

/// In-memory backend with a sequence-numbered change feed.
///
/// Cursors are the decimal sequence number of the last change returned.
pub struct MemoryRemoteSource {
    state: Mutex<RemoteState>,
    online: AtomicBool,
    rejected: Mutex<HashSet<String>>,
}

impl MemoryRemoteSource {
    /// Create a new empty, reachable backend.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RemoteState::default()),
            online: AtomicBool::new(true),
            rejected: Mutex::new(HashSet::new()),
        }
    }

    /// Store a record as if another client had written it.
    pub fn insert(&self, record: SyncableRecord) {
        let mut state = lock(&self.state);
        Self::upsert(&mut state, record);
    }

    /// Make the backend unreachable (or reachable again).
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Reject every push of record `id` with a validation error.
    pub fn reject_pushes_for(&self, id: impl Into<String>) {
        lock(&self.rejected).insert(id.into());
    }

    /// Current copy of a record.
    pub fn record(&self, record_type: RecordType, id: &str) -> Option<SyncableRecord> {
        lock(&self.state)
            .entries
            .iter()
            .find(|e| e.record.record_type == record_type && e.record.id == id)
            .map(|e| e.record.clone())
    }

    /// Every record accepted by `push`, in order.
    pub fn pushed(&self) -> Vec<SyncableRecord> {
        lock(&self.state).pushed.clone()
    }

    fn upsert(state: &mut RemoteState, record: SyncableRecord) {
        state.next_seq += 1;
        let seq = state.next_seq;
        let existing = state
            .entries
            .iter_mut()
            .find(|e| e.record.record_type == record.record_type && e.record.id == record.id);
        match existing {
            Some(entry) => {
                entry.record = record;
                entry.seq = seq;
            }
            None => state.entries.push(RemoteEntry { record, seq }),
        }
    }

    fn ensure_online(&self) -> Result<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Connectivity("backend unreachable".to_string()))
        }
    }
}

impl Default for MemoryRemoteSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteDataSource for MemoryRemoteSource {
    async fn fetch(&self, record_type: RecordType, id: &str) -> Result<Option<SyncableRecord>> {
        self.ensure_online()?;
        Ok(self.record(record_type, id))
    }

    async fn fetch_delta(&self, cursor: Option<&str>, limit: usize) -> Result<Delta> {
        self.ensure_online()?;

        let since = match cursor {
            Some(c) => c
                .parse::<u64>()
                .map_err(|_| Error::InvalidInput(format!("Bad cursor: {}", c)))?,
            None => 0,
        };

        let state = lock(&self.state);
        let mut changed: Vec<&RemoteEntry> =
            state.entries.iter().filter(|e| e.seq > since).collect();
        changed.sort_by_key(|e| e.seq);
        changed.truncate(limit);

        let next_cursor = changed
            .last()
            .map(|e| e.seq.to_string())
            .or_else(|| cursor.map(str::to_string));

        Ok(Delta {
            records: changed.into_iter().map(|e| e.record.clone()).collect(),
            next_cursor,
        })
    }

    async fn push(&self, record: &SyncableRecord) -> Result<()> {
        self.ensure_online()?;
        if lock(&self.rejected).contains(&record.id) {
            return Err(Error::Remote(format!("Validation failed for {}", record.id)));
        }

        let mut state = lock(&self.state);
        state.pushed.push(record.clone());
        Self::upsert(&mut state, record.clone());
        Ok(())
    }
}

/// In-memory upload queue.
#[derive(Default)]
pub struct MemoryUploadQueue {
    items: Mutex<Vec<UploadQueueItem>>,
    failing: Mutex<HashSet<String>>,
    disconnected: Mutex<HashSet<String>>,
    attempts: Mutex<Vec<(String, Instant)>>,
}

impl MemoryUploadQueue {
    /// Create a new empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an item.
    pub fn push(&self, item: UploadQueueItem) {
        lock(&self.items).push(item);
    }

    /// Make every transfer of `reference` fail.
    pub fn fail_transfers_for(&self, reference: impl Into<String>) {
        lock(&self.failing).insert(reference.into());
    }

    /// Make every transfer of `reference` fail as if the link dropped.
    pub fn disconnect_transfers_for(&self, reference: impl Into<String>) {
        lock(&self.disconnected).insert(reference.into());
    }

    /// Current copy of an item.
    pub fn item(&self, id: &str) -> Option<UploadQueueItem> {
        lock(&self.items).iter().find(|i| i.id == id).cloned()
    }

    /// Times at which item `id` was attempted.
    pub fn attempts_for(&self, id: &str) -> Vec<Instant> {
        lock(&self.attempts)
            .iter()
            .filter(|(item_id, _)| item_id == id)
            .map(|(_, at)| *at)
            .collect()
    }
}

#[async_trait]
impl UploadQueue for MemoryUploadQueue {
    async fn list_pending(&self, max_try_count: u32) -> Result<Vec<UploadQueueItem>> {
        Ok(lock(&self.items)
            .iter()
            .filter(|i| i.pending && i.try_count < max_try_count)
            .cloned()
            .collect())
    }

    async fn attempt(&self, item: &UploadQueueItem) -> Result<()> {
        lock(&self.attempts).push((item.id.clone(), Instant::now()));
        if lock(&self.disconnected).contains(&item.reference) {
            return Err(Error::Connectivity(format!(
                "Connection lost uploading {}",
                item.reference
            )));
        }
        if lock(&self.failing).contains(&item.reference) {
            return Err(Error::Transfer(format!("Upload of {} failed", item.reference)));
        }
        Ok(())
    }

    async fn update(&self, item: &UploadQueueItem) -> Result<()> {
        let mut items = lock(&self.items);
        let existing = items
            .iter_mut()
            .find(|i| i.id == item.id)
            .ok_or_else(|| Error::NotFound(format!("Queued upload not found: {}", item.id)))?;
        *existing = item.clone();
        Ok(())
    }
}
