use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{CacheEntry, CacheKey, CacheStorage};
use crate::error::StoreError;

/// Identifies one code/cache generation. Part of every partition name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionTag(String);

impl VersionTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionRole {
    /// Manifest-populated at install, never pruned
    Static,
    /// Populated at runtime, pruned by maintenance
    Dynamic,
}

impl PartitionRole {
    pub fn prefix(self) -> &'static str {
        match self {
            PartitionRole::Static => "static",
            PartitionRole::Dynamic => "dynamic",
        }
    }

    pub fn partition_name(self, version: &VersionTag) -> String {
        format!("{}-{}", self.prefix(), version)
    }
}

/// Handle on a single named partition.
/// Clone is cheap - the storage is shared through an `Arc`.
#[derive(Clone)]
pub struct Partition {
    storage: Arc<dyn CacheStorage>,
    name: String,
}

impl Partition {
    /// Open (creating if needed) the named partition.
    pub async fn open(
        storage: Arc<dyn CacheStorage>,
        name: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let name = name.into();
        storage.open(&name).await?;
        Ok(Self { storage, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        self.storage.get(&self.name, key).await
    }

    pub async fn put(&self, entry: CacheEntry) -> Result<(), StoreError> {
        self.storage.put(&self.name, entry).await
    }

    pub async fn delete(&self, key: &CacheKey) -> Result<bool, StoreError> {
        self.storage.delete(&self.name, key).await
    }

    pub async fn keys(&self) -> Result<Vec<CacheKey>, StoreError> {
        self.storage.keys(&self.name).await
    }

    pub async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.keys().await?.len())
    }
}
