use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::http::{Request, Response, ResponseKind};

/// Normalized request identity: method, absolute URL (fragment removed) and
/// the values of the configured vary headers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vary: Vec<(String, String)>,
}

impl CacheKey {
    pub fn get(url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: Method::GET.to_string(),
            url: url.to_string(),
            vary: Vec::new(),
        }
    }

    /// Build the key for a request. Only headers named in `vary_headers`
    /// (lower-case) take part in the identity.
    pub fn from_request(request: &Request, vary_headers: &[String]) -> Self {
        let mut url = request.url.clone();
        url.set_fragment(None);

        let vary = vary_headers
            .iter()
            .filter_map(|name| {
                request
                    .headers
                    .get(name.as_str())
                    .and_then(|value| value.to_str().ok())
                    .map(|value| (name.clone(), value.to_string()))
            })
            .collect();

        Self {
            method: request.method.to_string(),
            url: url.to_string(),
            vary,
        }
    }

    /// The same method and URL with no vary values
    pub fn without_vary(&self) -> Self {
        Self {
            method: self.method.clone(),
            url: self.url.clone(),
            vary: Vec::new(),
        }
    }

    pub fn parsed_url(&self) -> Option<Url> {
        Url::parse(&self.url).ok()
    }

    /// Value of the first query parameter called `name`, if any
    pub fn query_param(&self, name: &str) -> Option<String> {
        self.parsed_url()?
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    /// Timestamp encoded in the query parameter `name` as Unix epoch
    /// milliseconds. Unparseable values are treated as absent.
    pub fn timestamp_param(&self, name: &str) -> Option<DateTime<Utc>> {
        let raw = self.query_param(name)?;
        let millis: i64 = raw.trim().parse().ok()?;
        Utc.timestamp_millis_opt(millis).single()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(key: CacheKey, status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            key,
            status,
            headers: Vec::new(),
            body: body.into(),
            stored_at: Utc::now(),
        }
    }

    pub fn from_response(key: CacheKey, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            key,
            status: response.status.as_u16(),
            headers,
            body: response.body.clone(),
            stored_at: Utc::now(),
        }
    }

    /// Rebuild a response from the stored entry. Headers that no longer
    /// parse are dropped.
    pub fn to_response(&self) -> Response {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => debug!(header = %name, key = %self.key, "Dropping unparseable cached header"),
            }
        }

        Response {
            status: StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK),
            headers,
            body: self.body.clone(),
            kind: ResponseKind::Basic,
            from_cache: true,
        }
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.stored_at).num_minutes()
    }

    pub fn age_display(&self) -> String {
        let minutes = self.age_minutes();
        if minutes < 1 {
            // Also covers clock skew
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            let hours = minutes / 60;
            if minutes % 60 >= 30 {
                format!("{}h ago", hours + 1)
            } else {
                format!("{}h ago", hours)
            }
        } else {
            let days = minutes / 1440;
            if (minutes % 1440) / 60 >= 12 {
                format!("{}d ago", days + 1)
            } else {
                format!("{}d ago", days)
            }
        }
    }
}

/// Insertion-ordered entries of one partition, shared by the backends.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub(crate) struct EntryList(Vec<CacheEntry>);

impl EntryList {
    pub fn get(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.0.iter().find(|entry| &entry.key == key)
    }

    /// Replace-or-append: an overwritten entry moves to the end.
    pub fn upsert(&mut self, entry: CacheEntry) {
        self.remove(&entry.key);
        self.0.push(entry);
    }

    pub fn remove(&mut self, key: &CacheKey) -> bool {
        match self.0.iter().position(|entry| &entry.key == key) {
            Some(index) => {
                self.0.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.0.iter().map(|entry| entry.key.clone()).collect()
    }

}
