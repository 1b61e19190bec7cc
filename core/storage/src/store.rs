//! Key-value store trait definition.

use async_trait::async_trait;

use fieldsync_common::Result;

/// Durable key-value store for engine state.
///
/// Implementations must make `put` atomic per key: a reader observes either
/// the previous value or the new one, never a partial write.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get the store name (e.g., "memory", "file").
    fn name(&self) -> &str;

    /// Read the value stored under `key`.
    ///
    /// # Returns
    /// `None` when the key has never been written or was deleted.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    /// - Invalid key
    /// - I/O errors
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List all stored keys.
    async fn keys(&self) -> Result<Vec<String>>;
}
