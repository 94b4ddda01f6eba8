//! File-backed storage.
//!
//! Layout under the cache directory:
//! - `partitions.json`: partition names in creation order
//! - `<partition>.json`: one document per partition holding its entries
//!
//! Writes go to a temporary file first and are renamed into place, so a
//! crash mid-write leaves the previous document intact.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use super::{CacheEntry, CacheKey, CacheStorage, EntryList};
use crate::error::StoreError;

/// Index file name in the cache directory
const INDEX_FILE: &str = "partitions.json";

#[derive(Debug, Serialize, Deserialize)]
struct StoredPartition {
    name: String,
    created_at: DateTime<Utc>,
    entries: EntryList,
}

impl StoredPartition {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            created_at: Utc::now(),
            entries: EntryList::default(),
        }
    }
}

pub struct DiskStorage {
    cache_dir: PathBuf,
    // Serializes read-modify-write cycles on the index and partition files
    lock: Mutex<()>,
}

impl DiskStorage {
    pub fn new(cache_dir: PathBuf) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&cache_dir)?;
        Ok(Self {
            cache_dir,
            lock: Mutex::new(()),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Partition names become file names, so they are restricted to a safe
    /// character set.
    fn partition_path(&self, name: &str) -> Result<PathBuf, StoreError> {
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid || name == "partitions" {
            return Err(StoreError::InvalidPartitionName(name.to_string()));
        }
        Ok(self.cache_dir.join(format!("{}.json", name)))
    }

    fn load<T: DeserializeOwned>(&self, path: &Path, name: &str) -> Result<Option<T>, StoreError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)?;
        let parsed = serde_json::from_str(&contents).map_err(|source| StoreError::Corrupt {
            name: name.to_string(),
            source,
        })?;
        Ok(Some(parsed))
    }

    fn save<T: Serialize>(&self, path: &Path, data: &T) -> Result<(), StoreError> {
        let contents = serde_json::to_string(data)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn load_index(&self) -> Result<Vec<String>, StoreError> {
        let path = self.cache_dir.join(INDEX_FILE);
        Ok(self.load(&path, INDEX_FILE)?.unwrap_or_default())
    }

    fn save_index(&self, index: &[String]) -> Result<(), StoreError> {
        self.save(&self.cache_dir.join(INDEX_FILE), &index)
    }

    fn load_partition(&self, name: &str) -> Result<Option<StoredPartition>, StoreError> {
        let path = self.partition_path(name)?;
        self.load(&path, name)
    }

    fn save_partition(&self, partition: &StoredPartition) -> Result<(), StoreError> {
        let path = self.partition_path(&partition.name)?;
        self.save(&path, partition)
    }

    /// Load the partition, creating both its file and its index slot if
    /// either is missing.
    fn load_or_create(&self, name: &str) -> Result<StoredPartition, StoreError> {
        let mut index = self.load_index()?;
        let partition = match self.load_partition(name)? {
            Some(existing) => existing,
            None => {
                let created = StoredPartition::new(name);
                self.save_partition(&created)?;
                debug!(partition = name, "Created cache partition");
                created
            }
        };
        if !index.iter().any(|n| n == name) {
            index.push(name.to_string());
            self.save_index(&index)?;
        }
        Ok(partition)
    }
}

#[async_trait]
impl CacheStorage for DiskStorage {
    async fn open(&self, partition: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        self.load_or_create(partition)?;
        Ok(())
    }

    async fn get(&self, partition: &str, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self
            .load_partition(partition)?
            .and_then(|stored| stored.entries.get(key).cloned()))
    }

    async fn put(&self, partition: &str, entry: CacheEntry) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut stored = self.load_or_create(partition)?;
        stored.entries.upsert(entry);
        self.save_partition(&stored)
    }

    async fn delete(&self, partition: &str, key: &CacheKey) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().await;
        let Some(mut stored) = self.load_partition(partition)? else {
            return Ok(false);
        };
        let removed = stored.entries.remove(key);
        if removed {
            self.save_partition(&stored)?;
        }
        Ok(removed)
    }

    async fn keys(&self, partition: &str) -> Result<Vec<CacheKey>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self
            .load_partition(partition)?
            .map(|stored| stored.entries.keys())
            .unwrap_or_default())
    }

    async fn list_partitions(&self) -> Result<Vec<String>, StoreError> {
        let _guard = self.lock.lock().await;
        self.load_index()
    }

    async fn delete_partition(&self, partition: &str) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().await;
        let path = self.partition_path(partition)?;
        let mut index = self.load_index()?;
        let listed = index.iter().any(|n| n == partition);
        let exists = path.exists();

        if exists {
            std::fs::remove_file(&path)?;
        }
        if listed {
            index.retain(|n| n != partition);
            self.save_index(&index)?;
        }
        Ok(listed || exists)
    }
}
