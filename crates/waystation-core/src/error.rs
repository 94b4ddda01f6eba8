//! Error types for the cache, preload, maintenance and control paths.
//!
//! Network failures live in `origin::FetchError` since they are the only
//! errors that may reach a caller's request.

use thiserror::Error;

use crate::control::ClientId;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse cache file {name}: {source}")]
    Corrupt {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize cache data: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid partition name: {0}")]
    InvalidPartitionName(String),
}

/// A manifest entry that could not be fetched during preload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedPath {
    pub path: String,
    pub reason: String,
}

#[derive(Error, Debug)]
pub enum PreloadError {
    #[error("Preload failed for {} of {} manifest entries: {}", .failed.len(), .total, summarize(.failed))]
    Fetch { failed: Vec<FailedPath>, total: usize },

    #[error("Invalid manifest path {path}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Failed to write static partition: {0}")]
    Store(#[from] StoreError),
}

/// Maximum number of failed paths listed in a preload error message
const MAX_LISTED_FAILURES: usize = 5;

fn summarize(failed: &[FailedPath]) -> String {
    let mut listed: Vec<String> = failed
        .iter()
        .take(MAX_LISTED_FAILURES)
        .map(|f| format!("{} ({})", f.path, f.reason))
        .collect();
    if failed.len() > MAX_LISTED_FAILURES {
        listed.push(format!("and {} more", failed.len() - MAX_LISTED_FAILURES));
    }
    listed.join(", ")
}

#[derive(Error, Debug)]
pub enum MaintenanceError {
    #[error("Maintenance {pass} pass failed on {partition}: {source}")]
    Pass {
        pass: &'static str,
        partition: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Invalid control message: {0}")]
    InvalidMessage(#[from] serde_json::Error),

    #[error("Unknown client: {0}")]
    UnknownClient(ClientId),

    #[error("Reply channel closed for client {0}")]
    MailboxClosed(ClientId),

    #[error("No active intermediary")]
    NotActive,
}
