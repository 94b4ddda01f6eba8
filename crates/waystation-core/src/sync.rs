//! Background sync and notification collaborators.
//!
//! What gets synced and how notifications are rendered is up to the
//! embedding application. The intermediary only decides when a sync runs
//! and retries failed attempts.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

/// Attempts per sync trigger before giving up until the next trigger
const MAX_SYNC_ATTEMPTS: u32 = 3;

/// Initial delay between sync attempts, doubled after each failure
const INITIAL_SYNC_BACKOFF_MS: u64 = 1000;

const DEFAULT_NOTIFICATION_TITLE: &str = "New content available";

#[async_trait]
pub trait SyncSource: Send + Sync {
    async fn sync(&self, tag: &str) -> anyhow::Result<()>;
}

pub trait Notifier: Send + Sync {
    fn show(&self, notification: &Notification);
}

/// Notifier that only logs. Used when the host has no display surface.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn show(&self, notification: &Notification) {
        info!(title = %notification.title, body = %notification.body, "Notification requested");
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Notification {
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub url: Option<String>,
}

fn default_title() -> String {
    DEFAULT_NOTIFICATION_TITLE.to_string()
}

impl Notification {
    /// Build a notification from a push payload: an object with
    /// `title`/`body`/`url`, or a bare string used as the body.
    pub fn from_payload(payload: Option<&Value>) -> Self {
        match payload {
            Some(Value::String(body)) => Self {
                title: default_title(),
                body: body.clone(),
                url: None,
            },
            Some(value @ Value::Object(_)) => {
                serde_json::from_value(value.clone()).unwrap_or_else(|_| Self::fallback())
            }
            _ => Self::fallback(),
        }
    }

    fn fallback() -> Self {
        Self {
            title: default_title(),
            body: String::new(),
            url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncAttempts {
    pub attempts: u32,
    pub succeeded: bool,
    pub last_error: Option<String>,
}

/// Run one sync trigger, retrying failures with exponential backoff.
pub async fn run_with_retry(source: &dyn SyncSource, tag: &str) -> SyncAttempts {
    let mut backoff = Duration::from_millis(INITIAL_SYNC_BACKOFF_MS);
    let mut last_error = None;

    for attempt in 1..=MAX_SYNC_ATTEMPTS {
        match source.sync(tag).await {
            Ok(()) => {
                info!(tag, attempt, "Background sync complete");
                return SyncAttempts {
                    attempts: attempt,
                    succeeded: true,
                    last_error: None,
                };
            }
            Err(e) => {
                warn!(tag, attempt, error = %e, "Background sync failed");
                last_error = Some(e.to_string());
                if attempt < MAX_SYNC_ATTEMPTS {
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }

    SyncAttempts {
        attempts: MAX_SYNC_ATTEMPTS,
        succeeded: false,
        last_error,
    }
}
