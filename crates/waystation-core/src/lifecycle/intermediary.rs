use std::sync::Arc;

use reqwest::header;
use reqwest::Url;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::LifecycleState;
use crate::config::Settings;
use crate::control::cached_data_key;
use crate::error::{PreloadError, StoreError};
use crate::http::{FetchOptions, Request, Response};
use crate::maintenance::{Maintenance, MaintenanceReport};
use crate::origin::{FetchError, Origin};
use crate::preload::{PreloadReport, Preloader};
use crate::router::Router;
use crate::store::{CacheEntry, CacheStorage, PartitionRole, VersionTag};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
    /// Prior-generation partitions removed
    pub deleted: Vec<String>,
    /// Partitions that could not be removed; retried on the next activation
    pub failed: Vec<String>,
}

/// One generation of the intermediary: its version, its two partitions
/// and the components working on them.
pub struct Intermediary {
    generation: u64,
    version: VersionTag,
    scope: Url,
    static_partition: String,
    dynamic_partition: String,
    storage: Arc<dyn CacheStorage>,
    state: watch::Sender<LifecycleState>,
    preloader: Preloader,
    router: Router,
    maintenance: Maintenance,
}

impl Intermediary {
    pub(crate) fn new(
        generation: u64,
        version: VersionTag,
        settings: &Settings,
        storage: Arc<dyn CacheStorage>,
        origin: Arc<dyn Origin>,
    ) -> Self {
        let static_partition = PartitionRole::Static.partition_name(&version);
        let dynamic_partition = PartitionRole::Dynamic.partition_name(&version);
        let (state, _) = watch::channel(LifecycleState::Installing);

        let preloader = Preloader::new(
            Arc::clone(&storage),
            Arc::clone(&origin),
            settings.scope.clone(),
            static_partition.clone(),
        );
        let router = Router::new(
            Arc::clone(&storage),
            origin,
            settings.scope.clone(),
            static_partition.clone(),
            dynamic_partition.clone(),
        )
        .with_offline_fallback(settings.offline_fallback.clone())
        .with_vary_headers(settings.vary_headers.clone());
        let maintenance = Maintenance::new(
            Arc::clone(&storage),
            dynamic_partition.clone(),
            settings.maintenance.clone(),
        );

        Self {
            generation,
            version,
            scope: settings.scope.clone(),
            static_partition,
            dynamic_partition,
            storage,
            state,
            preloader,
            router,
            maintenance,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn version(&self) -> &VersionTag {
        &self.version
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions of this generation
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    pub fn static_partition(&self) -> &str {
        &self.static_partition
    }

    pub fn dynamic_partition(&self) -> &str {
        &self.dynamic_partition
    }

    fn transition(&self, next: LifecycleState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(
                generation = self.generation,
                version = %self.version,
                from = %previous,
                to = %next,
                "Lifecycle transition"
            );
        }
    }

    /// Preload the static partition. On failure this generation is
    /// discarded.
    pub(crate) async fn install(&self, manifest: &[String]) -> Result<PreloadReport, PreloadError> {
        self.transition(LifecycleState::Installing);
        match self.preloader.preload(manifest).await {
            Ok(report) => {
                self.transition(LifecycleState::Installed);
                Ok(report)
            }
            Err(e) => {
                warn!(generation = self.generation, error = %e, "Install failed");
                self.retire();
                Err(e)
            }
        }
    }

    /// Delete every partition that does not belong to this generation, then
    /// become active. Cleanup is best effort.
    pub(crate) async fn activate(&self) -> ActivationReport {
        self.transition(LifecycleState::Activating);
        let mut report = ActivationReport::default();

        match self.storage.list_partitions().await {
            Ok(partitions) => {
                for name in partitions {
                    if name == self.static_partition || name == self.dynamic_partition {
                        continue;
                    }
                    match self.storage.delete_partition(&name).await {
                        Ok(_) => {
                            debug!(partition = %name, "Deleted stale partition");
                            report.deleted.push(name);
                        }
                        Err(e) => {
                            warn!(partition = %name, error = %e, "Failed to delete stale partition");
                            report.failed.push(name);
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to enumerate partitions during activation"),
        }

        self.transition(LifecycleState::Active);
        report
    }

    /// Mark this generation as superseded. Its router stops caching.
    pub(crate) fn retire(&self) {
        self.router.retire();
        self.transition(LifecycleState::Redundant);
    }

    pub async fn intercept(
        &self,
        request: Request,
        options: FetchOptions,
    ) -> Result<Response, FetchError> {
        self.router.intercept(request, options).await
    }

    pub async fn run_maintenance(&self) -> MaintenanceReport {
        self.maintenance.run().await
    }

    /// Store an out-of-band JSON payload in the dynamic partition under the
    /// well-known cached-data key.
    pub(crate) async fn cache_data(&self, payload: &Value) -> Result<(), StoreError> {
        if self.router.is_retired() {
            debug!(generation = self.generation, "Retired generation ignoring cached data");
            return Ok(());
        }
        let Some(key) = cached_data_key(&self.scope) else {
            return Ok(());
        };
        let mut entry = CacheEntry::new(key, 200, serde_json::to_vec(payload)?);
        entry.headers.push((
            header::CONTENT_TYPE.as_str().to_string(),
            "application/json".to_string(),
        ));
        self.storage.put(&self.dynamic_partition, entry).await
    }
}
