//! Message protocol between connected clients and the intermediary.
//!
//! Wire format is a JSON object with a `type` discriminant:
//!
//! ```json
//! {"type": "SKIP_WAITING"}
//! {"type": "GET_VERSION"}
//! {"type": "CACHE_DATA", "payload": {"any": "json"}}
//! ```
//!
//! `GET_VERSION` is answered with `{"version": "<tag>"}` on the sender's
//! reply channel. The intermediary never messages a client unprompted.

use std::fmt;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::{CacheKey, VersionTag};

/// Well-known path under which `CACHE_DATA` payloads are stored
pub const CACHED_DATA_PATH: &str = "/__waystation/cached-data";

/// Capacity of each client's reply channel
pub const REPLY_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// Activate a waiting install now
    SkipWaiting,
    GetVersion,
    /// Seed the dynamic partition with an arbitrary payload
    CacheData {
        #[serde(default)]
        payload: Value,
    },
}

impl ControlMessage {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlReply {
    Version { version: VersionTag },
}

/// Cache key used for `CACHE_DATA` payloads on the given origin
pub fn cached_data_key(scope: &Url) -> Option<CacheKey> {
    scope.join(CACHED_DATA_PATH).ok().map(|url| CacheKey::get(&url))
}
