use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{CacheEntry, CacheKey, CacheStorage, EntryList};
use crate::error::StoreError;

/// In-process storage. Contents do not survive a restart.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    // Vec rather than a map: creation order is part of the contract
    partitions: RwLock<Vec<(String, EntryList)>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn find<'a>(partitions: &'a [(String, EntryList)], name: &str) -> Option<&'a EntryList> {
    partitions.iter().find(|(n, _)| n == name).map(|(_, list)| list)
}

fn find_or_create<'a>(partitions: &'a mut Vec<(String, EntryList)>, name: &str) -> &'a mut EntryList {
    let index = match partitions.iter().position(|(n, _)| n == name) {
        Some(index) => index,
        None => {
            partitions.push((name.to_string(), EntryList::default()));
            partitions.len() - 1
        }
    };
    &mut partitions[index].1
}

#[async_trait]
impl CacheStorage for MemoryStorage {
    async fn open(&self, partition: &str) -> Result<(), StoreError> {
        let mut partitions = self.partitions.write().await;
        find_or_create(&mut partitions, partition);
        Ok(())
    }

    async fn get(&self, partition: &str, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        let partitions = self.partitions.read().await;
        Ok(find(&partitions, partition).and_then(|list| list.get(key).cloned()))
    }

    async fn put(&self, partition: &str, entry: CacheEntry) -> Result<(), StoreError> {
        let mut partitions = self.partitions.write().await;
        find_or_create(&mut partitions, partition).upsert(entry);
        Ok(())
    }

    async fn delete(&self, partition: &str, key: &CacheKey) -> Result<bool, StoreError> {
        let mut partitions = self.partitions.write().await;
        Ok(partitions
            .iter_mut()
            .find(|(n, _)| n == partition)
            .map(|(_, list)| list.remove(key))
            .unwrap_or(false))
    }

    async fn keys(&self, partition: &str) -> Result<Vec<CacheKey>, StoreError> {
        let partitions = self.partitions.read().await;
        Ok(find(&partitions, partition)
            .map(EntryList::keys)
            .unwrap_or_default())
    }

    async fn list_partitions(&self) -> Result<Vec<String>, StoreError> {
        let partitions = self.partitions.read().await;
        Ok(partitions.iter().map(|(name, _)| name.clone()).collect())
    }

    async fn delete_partition(&self, partition: &str) -> Result<bool, StoreError> {
        let mut partitions = self.partitions.write().await;
        let before = partitions.len();
        partitions.retain(|(name, _)| name != partition);
        Ok(partitions.len() != before)
    }
}
