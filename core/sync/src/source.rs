//! Collaborator interfaces the engine drives.
//!
//! The concrete local database, backend API and binary transfer mechanism
//! live outside this crate. The engine only sees these traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fieldsync_common::{RecordType, Result, SyncableRecord};

/// The on-device record store.
#[async_trait]
pub trait LocalDataSource: Send + Sync {
    /// Records of `record_type` with their pending marker set, in store order.
    async fn get_pending(&self, record_type: RecordType) -> Result<Vec<SyncableRecord>>;

    /// The stored copy of a record, pending or not.
    async fn get(&self, record_type: RecordType, id: &str) -> Result<Option<SyncableRecord>>;

    /// Store `record` as acknowledged by the backend, clearing its pending
    /// marker.
    ///
    /// # Postconditions
    /// - Saving an identical payload twice is a no-op
    async fn save(&self, record: &SyncableRecord) -> Result<()>;
}

/// A page of remote changes.
#[derive(Debug, Clone, Default)]
pub struct Delta {
    /// Changed records, oldest change first.
    pub records: Vec<SyncableRecord>,
    /// Cursor to pass to the next fetch.
    pub next_cursor: Option<String>,
}

/// The authoritative backend.
#[async_trait]
pub trait RemoteDataSource: Send + Sync {
    /// The backend copy of a record, if it exists.
    ///
    /// # Errors
    /// - `Error::Connectivity` when the backend is unreachable
    async fn fetch(&self, record_type: RecordType, id: &str) -> Result<Option<SyncableRecord>>;

    /// Up to `limit` records changed since `cursor` (`None` = from the start).
    ///
    /// # Errors
    /// - `Error::Connectivity` when the backend is unreachable
    async fn fetch_delta(&self, cursor: Option<&str>, limit: usize) -> Result<Delta>;

    /// Write a record to the backend.
    ///
    /// # Errors
    /// - `Error::Remote` when the backend rejects the record; never a silent drop
    /// - `Error::Connectivity` when the backend is unreachable
    async fn push(&self, record: &SyncableRecord) -> Result<()>;
}

/// A queued binary transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadQueueItem {
    /// Unique ID for this queue entry.
    pub id: String,
    /// What is being transferred (e.g. photo record id or remote object key).
    pub reference: String,
    /// Still waiting for a successful transfer.
    pub pending: bool,
    /// Failed attempts so far.
    pub try_count: u32,
    /// Payload size in bytes.
    pub size: u64,
    /// When the item was queued.
    pub enqueued_at: DateTime<Utc>,
    /// Last failure message.
    pub last_error: Option<String>,
}

impl UploadQueueItem {
    /// Create a pending item with no attempts.
    pub fn new(id: impl Into<String>, reference: impl Into<String>, size: u64) -> Self {
        Self {
            id: id.into(),
            reference: reference.into(),
            pending: true,
            try_count: 0,
            size,
            enqueued_at: Utc::now(),
            last_error: None,
        }
    }
}

/// Queue of binary transfers. Items are enqueued by whoever originates the
/// file; the engine only drains.
#[async_trait]
pub trait UploadQueue: Send + Sync {
    /// Pending items with `try_count < max_try_count`, in queue order.
    async fn list_pending(&self, max_try_count: u32) -> Result<Vec<UploadQueueItem>>;

    /// Perform one transfer attempt.
    async fn attempt(&self, item: &UploadQueueItem) -> Result<()>;

    /// Write back bookkeeping (`pending`, `try_count`, `last_error`).
    async fn update(&self, item: &UploadQueueItem) -> Result<()>;
}

/// Moves one staged payload to the backend.
#[async_trait]
pub trait UploadTransport: Send + Sync {
    async fn upload(&self, reference: &str, data: Vec<u8>) -> Result<()>;
}
