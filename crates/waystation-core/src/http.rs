//! HTTP-shaped request and response types passed through the intermediary.
//!
//! These are deliberately plain: the router only needs the method, URL and
//! headers of a request and the status, headers and body of a response.

use std::time::Duration;

use futures::future::AbortRegistration;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode, Url};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// True when any `Accept` header asks for an HTML document.
    /// A request without an `Accept` header is not an HTML request.
    pub fn accepts_html(&self) -> bool {
        self.headers
            .get_all(header::ACCEPT)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .any(|value| value.contains("text/html"))
    }

    pub fn is_same_origin(&self, scope: &Url) -> bool {
        self.url.origin() == scope.origin()
    }
}

/// How a response relates to the origin the intermediary serves.
///
/// Only `Basic` (same-origin) responses are ever written to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    Basic,
    Cors,
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub kind: ResponseKind,
    /// Set when the response was served from a cache partition
    pub from_cache: bool,
}

impl Response {
    pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            kind: ResponseKind::Basic,
            from_cache: false,
        }
    }

    pub fn with_kind(mut self, kind: ResponseKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Body decoded as UTF-8, replacing invalid sequences
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Per-request cancellation controls.
///
/// A timeout or an abort is treated exactly like a network failure.
#[derive(Debug, Default)]
pub struct FetchOptions {
    pub timeout: Option<Duration>,
    pub abort: Option<AbortRegistration>,
}

impl FetchOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            abort: None,
        }
    }

    pub fn with_abort(abort: AbortRegistration) -> Self {
        Self {
            timeout: None,
            abort: Some(abort),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_accepts_html_missing_header() {
        let request = Request::get(url("https://app.example/missing.html"));
        assert!(!request.accepts_html());
    }

    #[test]
    fn test_accepts_html_browser_navigation() {
        let request = Request::get(url("https://app.example/page")).with_header(
            header::ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,*/*;q=0.8"),
        );
        assert!(request.accepts_html());
    }

    #[test]
    fn test_accepts_html_json_request() {
        let request = Request::get(url("https://app.example/api/data"))
            .with_header(header::ACCEPT, HeaderValue::from_static("application/json"));
        assert!(!request.accepts_html());
    }

    #[test]
    fn test_same_origin_ignores_path_and_query() {
        let scope = url("https://app.example/");
        assert!(Request::get(url("https://app.example/a/b?c=d")).is_same_origin(&scope));
        assert!(!Request::get(url("https://cdn.example/a")).is_same_origin(&scope));
        assert!(!Request::get(url("http://app.example/a")).is_same_origin(&scope));
        assert!(!Request::get(url("https://app.example:8443/a")).is_same_origin(&scope));
    }
}
