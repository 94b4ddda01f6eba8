//! Partitioned cache storage.
//!
//! A store holds named partitions, each an insertion-ordered list of
//! `CacheEntry` values keyed by `CacheKey`. Two partitions are live for a
//! given version: `static-<version>` (filled once at install time, never
//! pruned) and `dynamic-<version>` (filled by the router, pruned by
//! maintenance).
//!
//! Backends:
//! - `MemoryStorage`: process-local, gone at restart
//! - `DiskStorage`: JSON files under a cache directory

pub mod disk;
pub mod entry;
pub mod memory;
pub mod partition;

use async_trait::async_trait;

pub use disk::DiskStorage;
pub use entry::{CacheEntry, CacheKey};
pub(crate) use entry::EntryList;
pub use memory::MemoryStorage;
pub use partition::{Partition, PartitionRole, VersionTag};

use crate::error::StoreError;

/// Storage backend for cache partitions.
///
/// Every operation is atomic for a single key or partition. Nothing is
/// transactional across partitions.
///
/// Reads against a partition that does not exist behave as if it were
/// empty. `put` creates the partition when needed.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Create the partition if it does not exist yet.
    async fn open(&self, partition: &str) -> Result<(), StoreError>;

    async fn get(&self, partition: &str, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError>;

    /// Store an entry, replacing any entry with the same key.
    /// The stored entry becomes the newest in insertion order.
    async fn put(&self, partition: &str, entry: CacheEntry) -> Result<(), StoreError>;

    async fn delete(&self, partition: &str, key: &CacheKey) -> Result<bool, StoreError>;

    /// Keys in insertion order, oldest first.
    async fn keys(&self, partition: &str) -> Result<Vec<CacheKey>, StoreError>;

    /// Partition names in creation order.
    async fn list_partitions(&self) -> Result<Vec<String>, StoreError>;

    async fn delete_partition(&self, partition: &str) -> Result<bool, StoreError>;

    /// Look the key up in every partition, in creation order, and return the
    /// first hit.
    async fn match_entry(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        for name in self.list_partitions().await? {
            if let Some(entry) = self.get(&name, key).await? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }
}
