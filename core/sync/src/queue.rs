//! Directory-backed upload queue.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use fieldsync_common::{Error, Result};

use crate::source::{UploadQueue, UploadQueueItem, UploadTransport};

/// Upload queue that stages payloads on disk.
///
/// Each payload is written to its own file under `staging/`, and the queue
/// bookkeeping lives in a JSON registry next to it. Completed items are
/// dropped from the registry together with their staging file; items that
/// ran out of attempts stay for inspection.
pub struct StagedUploadQueue {
    /// Directory holding the staged payloads.
    staging_dir: PathBuf,
    /// Path to persist the registry.
    registry_path: PathBuf,
    /// Queue entries in enqueue order.
    items: RwLock<Vec<UploadQueueItem>>,
    /// Transfer used by `attempt`.
    transport: Option<Arc<dyn UploadTransport>>,
}

impl StagedUploadQueue {
    /// Open (or create) a queue rooted at `base_dir`.
    pub async fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref();
        let staging_dir = base_dir.join("staging");
        let registry_path = base_dir.join("upload_queue.json");

        fs::create_dir_all(&staging_dir).await?;

        let items = if registry_path.exists() {
            let content = fs::read_to_string(&registry_path).await?;
            serde_json::from_str(&content)?
        } else {
            Vec::new()
        };

        Ok(Self {
            staging_dir,
            registry_path,
            items: RwLock::new(items),
            transport: None,
        })
    }

    /// Set the transport used to perform transfers.
    pub fn with_transport(mut self, transport: Arc<dyn UploadTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Stage a payload for upload and return the new item id.
    pub async fn enqueue(&self, reference: impl Into<String>, data: Vec<u8>) -> Result<String> {
        let item = UploadQueueItem::new(Uuid::new_v4().to_string(), reference, data.len() as u64);
        fs::write(self.staging_file(&item.id), &data).await?;

        let mut items = self.items.write().await;
        items.push(item.clone());
        self.persist_registry(&items).await?;

        debug!("Queued upload {} for {}", item.id, item.reference);
        Ok(item.id)
    }

    /// Snapshot of all queue entries.
    pub async fn items(&self) -> Vec<UploadQueueItem> {
        self.items.read().await.clone()
    }

    /// Get a queue entry by ID.
    pub async fn get(&self, id: &str) -> Option<UploadQueueItem> {
        self.items.read().await.iter().find(|i| i.id == id).cloned()
    }

    /// Drop an entry and its staged payload.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let mut items = self.items.write().await;
        let pos = items
            .iter()
            .position(|i| i.id == id)
            .ok_or_else(|| Error::NotFound(format!("Queued upload not found: {}", id)))?;
        items.remove(pos);
        self.remove_staging_file(id).await?;
        self.persist_registry(&items).await
    }

    /// Get count of queue entries.
    pub async fn count(&self) -> usize {
        self.items.read().await.len()
    }

    /// Read the staged payload of an entry.
    pub async fn staged_data(&self, id: &str) -> Result<Vec<u8>> {
        match fs::read(self.staging_file(id)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("Staged payload missing for {}", id)))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Clean up staging files that no registry entry refers to.
    pub async fn cleanup_orphaned(&self) -> Result<usize> {
        let known: HashSet<PathBuf> = self
            .items
            .read()
            .await
            .iter()
            .map(|i| self.staging_file(&i.id))
            .collect();

        let mut cleaned = 0;
        let mut entries = fs::read_dir(&self.staging_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_file() && !known.contains(&path) {
                fs::remove_file(&path).await?;
                cleaned += 1;
            }
        }

        Ok(cleaned)
    }

    fn staging_file(&self, id: &str) -> PathBuf {
        self.staging_dir.join(id)
    }

    async fn remove_staging_file(&self, id: &str) -> Result<()> {
        match fs::remove_file(self.staging_file(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn persist_registry(&self, items: &[UploadQueueItem]) -> Result<()> {
        let json = serde_json::to_string_pretty(items)?;
        fs::write(&self.registry_path, json).await?;
        Ok(())
    }
}

#[async_trait]
impl UploadQueue for StagedUploadQueue {
    async fn list_pending(&self, max_try_count: u32) -> Result<Vec<UploadQueueItem>> {
        Ok(self
            .items
            .read()
            .await
            .iter()
            .filter(|i| i.pending && i.try_count < max_try_count)
            .cloned()
            .collect())
    }

    async fn attempt(&self, item: &UploadQueueItem) -> Result<()> {
        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| Error::Transfer("No upload transport configured".to_string()))?;
        let data = self.staged_data(&item.id).await?;
        transport.upload(&item.reference, data).await
    }

    async fn update(&self, item: &UploadQueueItem) -> Result<()> {
        let mut items = self.items.write().await;
        let pos = items
            .iter()
            .position(|i| i.id == item.id)
            .ok_or_else(|| Error::NotFound(format!("Queued upload not found: {}", item.id)))?;

        if item.pending {
            items[pos] = item.clone();
        } else {
            items.remove(pos);
            self.remove_staging_file(&item.id).await?;
        }

        self.persist_registry(&items).await
    }
}
