//! Install-time population of the static partition.
//!
//! Preloading is all-or-nothing: every manifest path is fetched before
//! anything is written, and a single failure (transport error or
//! non-success status) fails the whole install with nothing stored. A
//! failed write removes the partition again, and a marker entry written
//! after the last resource tells a finished install from an interrupted one.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use reqwest::Url;
use tracing::{debug, info, warn};

use crate::error::{FailedPath, PreloadError, StoreError};
use crate::http::Request;
use crate::origin::Origin;
use crate::store::{CacheEntry, CacheKey, CacheStorage, Partition};

/// Maximum number of manifest fetches in flight at once
const MAX_CONCURRENT_PRELOADS: usize = 6;

/// Written last into the static partition; its presence marks the install
/// as complete
pub const INSTALL_MARKER_PATH: &str = "/__waystation/installed";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreloadReport {
    pub partition: String,
    pub entries: usize,
}

pub struct Preloader {
    storage: Arc<dyn CacheStorage>,
    origin: Arc<dyn Origin>,
    scope: Url,
    partition: String,
}

impl Preloader {
    pub fn new(
        storage: Arc<dyn CacheStorage>,
        origin: Arc<dyn Origin>,
        scope: Url,
        partition: String,
    ) -> Self {
        Self {
            storage,
            origin,
            scope,
            partition,
        }
    }

    /// Resolve manifest paths against the scope, dropping duplicates while
    /// keeping manifest order.
    fn resolve(&self, manifest: &[String]) -> Result<Vec<(String, Url)>, PreloadError> {
        let mut seen = HashSet::new();
        let mut resolved = Vec::with_capacity(manifest.len());
        for path in manifest {
            let url = self.scope.join(path).map_err(|e| PreloadError::InvalidPath {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            if url.origin() != self.scope.origin() {
                return Err(PreloadError::InvalidPath {
                    path: path.clone(),
                    reason: "resolves outside the origin".to_string(),
                });
            }
            if seen.insert(url.clone()) {
                resolved.push((path.clone(), url));
            }
        }
        Ok(resolved)
    }

    pub async fn preload(&self, manifest: &[String]) -> Result<PreloadReport, PreloadError> {
        let resolved = self.resolve(manifest)?;
        let total = resolved.len();
        info!(partition = %self.partition, total, "Preloading static resources");

        let results: Vec<_> = stream::iter(resolved)
            .map(|(path, url)| {
                let origin = Arc::clone(&self.origin);
                async move {
                    let request = Request::get(url);
                    let result = origin.fetch(&request).await;
                    (path, request, result)
                }
            })
            .buffered(MAX_CONCURRENT_PRELOADS)
            .collect()
            .await;

        let mut entries = Vec::with_capacity(total);
        let mut failed = Vec::new();
        for (path, request, result) in results {
            match result {
                Ok(response) if response.is_success() => {
                    entries.push(CacheEntry::from_response(CacheKey::get(&request.url), &response));
                }
                Ok(response) => failed.push(FailedPath {
                    path,
                    reason: format!("Status {}", response.status),
                }),
                Err(e) => failed.push(FailedPath {
                    path,
                    reason: e.to_string(),
                }),
            }
        }

        if !failed.is_empty() {
            warn!(
                partition = %self.partition,
                failed = failed.len(),
                total,
                "Preload failed, static partition left untouched"
            );
            return Err(PreloadError::Fetch { failed, total });
        }

        let existed = self
            .storage
            .list_partitions()
            .await?
            .contains(&self.partition);
        if let Err(e) = self.write(entries).await {
            warn!(partition = %self.partition, error = %e, "Failed to write static partition");
            if !existed {
                self.discard().await;
            }
            return Err(e.into());
        }

        Ok(PreloadReport {
            partition: self.partition.clone(),
            entries: total,
        })
    }

    /// Store every entry, then the install marker.
    async fn write(&self, entries: Vec<CacheEntry>) -> Result<(), StoreError> {
        let partition = Partition::open(Arc::clone(&self.storage), self.partition.clone()).await?;
        for entry in entries {
            debug!(key = %entry.key, "Preloaded");
            partition.put(entry).await?;
        }
        if let Some(key) = install_marker_key(&self.scope) {
            partition
                .put(CacheEntry::new(key, 200, Utc::now().to_rfc3339()))
                .await?;
        }
        Ok(())
    }

    /// Remove a partially written partition so it is never mistaken for an
    /// installed one.
    async fn discard(&self) {
        match self.storage.delete_partition(&self.partition).await {
            Ok(_) => debug!(partition = %self.partition, "Discarded partial static partition"),
            Err(e) => warn!(partition = %self.partition, error = %e, "Failed to discard partial static partition"),
        }
    }
}

/// Cache key of the entry written once a preload has stored everything
pub fn install_marker_key(scope: &Url) -> Option<CacheKey> {
    scope.join(INSTALL_MARKER_PATH).ok().map(|url| CacheKey::get(&url))
}

/// True when `partition` holds a preload that ran to completion.
pub async fn is_installed(
    storage: &dyn CacheStorage,
    scope: &Url,
    partition: &str,
) -> Result<bool, StoreError> {
    match install_marker_key(scope) {
        Some(key) => Ok(storage.get(partition, &key).await?.is_some()),
        None => Ok(false),
    }
}
