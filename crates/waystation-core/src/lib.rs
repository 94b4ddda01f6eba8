//! Core library for waystation.
//!
//! waystation is an offline-first cache that sits between a client
//! application and its origin server. It serves previously fetched
//! resources, populates a runtime cache as requests flow through, and
//! prunes that cache in the background.
//!
//! - `store`: partitioned cache storage (in-memory and on-disk backends)
//! - `origin`: the network side, including a `reqwest` based client
//! - `preload`: populates the static partition at install time
//! - `router`: per-request interception policy
//! - `lifecycle`: install/activate state machine and the event dispatcher
//! - `maintenance`: age and count based eviction of dynamic entries
//! - `control`: message protocol between clients and the intermediary
//! - `sync`: background sync and notification collaborators

pub mod config;
pub mod control;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod maintenance;
pub mod origin;
pub mod preload;
pub mod router;
pub mod store;
pub mod sync;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{Config, Settings};
pub use control::{ClientId, ControlMessage, ControlReply};
pub use error::{ControlError, MaintenanceError, PreloadError, StoreError};
pub use http::{FetchOptions, Request, Response, ResponseKind};
pub use lifecycle::{Event, EventOutcome, Host, Intermediary, LifecycleState};
pub use maintenance::{Maintenance, MaintenancePolicy, MaintenanceReport, MaintenanceScheduler};
pub use origin::{FetchError, HttpOrigin, Origin};
pub use store::{
    CacheEntry, CacheKey, CacheStorage, DiskStorage, MemoryStorage, Partition, PartitionRole,
    VersionTag,
};
