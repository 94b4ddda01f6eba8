//! Pruning of the dynamic partition.
//!
//! Two independent passes run on every maintenance cycle:
//! - age: entries whose URL carries a timestamp query parameter older than
//!   the configured maximum age are deleted
//! - count: when more entries remain than the cap, the oldest-inserted ones
//!   are deleted until the cap is met (a FIFO cap; reads never reorder)
//!
//! Both passes are idempotent. The static partition is never touched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::MaintenanceError;
use crate::lifecycle::{Event, Host};
use crate::store::{CacheKey, CacheStorage};

#[derive(Debug, Clone)]
pub struct MaintenancePolicy {
    pub max_entries: usize,
    pub max_age: chrono::Duration,
    /// Query parameter holding the entry's timestamp in epoch milliseconds
    pub timestamp_param: String,
}

impl Default for MaintenancePolicy {
    fn default() -> Self {
        Self {
            max_entries: 100,
            max_age: chrono::Duration::days(30),
            timestamp_param: "timestamp".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired: usize,
    pub trimmed: usize,
    pub failed_deletes: usize,
    /// Another run was already in flight
    pub skipped: bool,
    pub errors: Vec<String>,
}

impl MaintenanceReport {
    pub fn deleted(&self) -> usize {
        self.expired + self.trimmed
    }
}

#[derive(Debug, Default)]
struct PassResult {
    deleted: usize,
    failed: usize,
}

/// Resets the in-flight flag when a run finishes, even if it is cancelled.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Maintenance {
    storage: Arc<dyn CacheStorage>,
    partition: String,
    policy: MaintenancePolicy,
    running: AtomicBool,
}

impl Maintenance {
    pub fn new(storage: Arc<dyn CacheStorage>, partition: String, policy: MaintenancePolicy) -> Self {
        Self {
            storage,
            partition,
            policy,
            running: AtomicBool::new(false),
        }
    }

    pub async fn run(&self) -> MaintenanceReport {
        self.run_at(Utc::now()).await
    }

    /// Run both passes as of `now`. A call made while another run is in
    /// flight returns immediately with `skipped` set.
    pub async fn run_at(&self, now: DateTime<Utc>) -> MaintenanceReport {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(partition = %self.partition, "Maintenance already running, skipping");
            return MaintenanceReport {
                skipped: true,
                ..Default::default()
            };
        }
        let _guard = RunGuard(&self.running);

        let mut report = MaintenanceReport::default();

        match self.expire_aged(now).await {
            Ok(pass) => {
                report.expired = pass.deleted;
                report.failed_deletes += pass.failed;
            }
            Err(e) => {
                warn!(error = %e, "Skipping age-based eviction");
                report.errors.push(e.to_string());
            }
        }

        match self.enforce_cap().await {
            Ok(pass) => {
                report.trimmed = pass.deleted;
                report.failed_deletes += pass.failed;
            }
            Err(e) => {
                warn!(error = %e, "Skipping count-based eviction");
                report.errors.push(e.to_string());
            }
        }

        if report.deleted() > 0 {
            info!(
                partition = %self.partition,
                expired = report.expired,
                trimmed = report.trimmed,
                "Maintenance pruned dynamic cache"
            );
        }
        report
    }

    async fn keys(&self, pass: &'static str) -> Result<Vec<CacheKey>, MaintenanceError> {
        self.storage
            .keys(&self.partition)
            .await
            .map_err(|source| MaintenanceError::Pass {
                pass,
                partition: self.partition.clone(),
                source,
            })
    }

    async fn delete_all<'a>(&self, keys: impl IntoIterator<Item = &'a CacheKey>) -> PassResult {
        let mut result = PassResult::default();
        for key in keys {
            match self.storage.delete(&self.partition, key).await {
                Ok(true) => result.deleted += 1,
                // Deleted concurrently, nothing to do
                Ok(false) => {}
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to delete cache entry");
                    result.failed += 1;
                }
            }
        }
        result
    }

    async fn expire_aged(&self, now: DateTime<Utc>) -> Result<PassResult, MaintenanceError> {
        let keys = self.keys("age").await?;
        let expired: Vec<&CacheKey> = keys
            .iter()
            .filter(|key| {
                key.timestamp_param(&self.policy.timestamp_param)
                    .is_some_and(|stamped| now - stamped > self.policy.max_age)
            })
            .collect();

        debug!(candidates = expired.len(), "Age-based eviction");
        Ok(self.delete_all(expired).await)
    }

    async fn enforce_cap(&self) -> Result<PassResult, MaintenanceError> {
        let keys = self.keys("count").await?;
        if keys.len() <= self.policy.max_entries {
            return Ok(PassResult::default());
        }
        let excess = keys.len() - self.policy.max_entries;

        debug!(total = keys.len(), excess, "Count-based eviction");
        Ok(self.delete_all(&keys[..excess]).await)
    }
}

/// Background task that fires `Event::PeriodicTrigger` at a fixed period.
/// The task stops when the scheduler is dropped.
pub struct MaintenanceScheduler {
    handle: JoinHandle<()>,
}

impl MaintenanceScheduler {
    pub fn spawn(host: Arc<Host>, period: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                debug!("Periodic maintenance trigger");
                host.dispatch(Event::PeriodicTrigger).await;
            }
        });
        Self { handle }
    }

    pub fn stop(self) {
        // Drop aborts the task
    }
}

impl Drop for MaintenanceScheduler {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
