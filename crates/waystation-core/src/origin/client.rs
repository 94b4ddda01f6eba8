//! `reqwest` client for reaching the origin server.
//!
//! Requests are forwarded as-is. Rate-limited (429) responses are retried
//! with exponential backoff; every other status is handed back to the
//! caller, which decides whether it is cacheable.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use super::{FetchError, Origin};
use crate::http::{Request, Response, ResponseKind};

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Client for the origin server.
/// Cloning shares the underlying connection pool.
#[derive(Clone)]
pub struct HttpOrigin {
    client: Client,
    initial_backoff: Duration,
}

impl HttpOrigin {
    pub fn new() -> Result<Self, FetchError> {
        Self::with_timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        })
    }

    /// Override the first rate-limit backoff delay; later retries double it.
    pub fn with_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    /// Add up to 25% random jitter so that clients do not retry in lockstep.
    fn jittered(delay: Duration) -> Duration {
        let max_jitter = (delay.as_millis() / 4) as u64;
        if max_jitter == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter))
    }

    /// Requests reqwest refuses to build (unsupported scheme, bad header)
    /// would fail the same way on every retry, so they are not network
    /// failures.
    fn classify(error: reqwest::Error) -> FetchError {
        if error.is_builder() {
            FetchError::InvalidRequest(error.to_string())
        } else {
            FetchError::Network(error)
        }
    }

    async fn into_response(
        request: &Request,
        response: reqwest::Response,
    ) -> Result<Response, FetchError> {
        // Redirects may land on another origin; only same-origin results are basic
        let kind = if response.url().origin() == request.url.origin() {
            ResponseKind::Basic
        } else {
            ResponseKind::Cors
        };
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        debug!(url = %request.url, status = %status, bytes = body.len(), "Origin responded");
        Ok(Response {
            status,
            headers,
            body,
            kind,
            from_cache: false,
        })
    }
}

#[async_trait]
impl Origin for HttpOrigin {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let response = self
                .client
                .request(request.method.clone(), request.url.clone())
                .headers(request.headers.clone())
                .send()
                .await
                .map_err(Self::classify)?;

            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Self::into_response(request, response).await;
            }

            retries += 1;
            if retries > MAX_RATE_LIMIT_RETRIES {
                return Err(FetchError::RateLimited);
            }
            let delay = Self::jittered(backoff);
            warn!(
                url = %request.url,
                retry = retries,
                backoff_ms = delay.as_millis() as u64,
                "Rate limited, backing off"
            );
            tokio::time::sleep(delay).await;
            backoff *= 2; // Exponential backoff
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{self, HeaderValue};
    use reqwest::{Method, Url};
    use wiremock::matchers::{header as header_matcher, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn origin() -> HttpOrigin {
        HttpOrigin::new().unwrap().with_backoff(Duration::from_millis(1))
    }

    fn request(server: &MockServer, p: &str) -> Request {
        Request::get(Url::parse(&server.uri()).unwrap().join(p).unwrap())
    }

    #[test]
    fn test_jitter_is_bounded() {
        let base = Duration::from_millis(1000);
        for _ in 0..50 {
            let delay = HttpOrigin::jittered(base);
            assert!(delay >= base && delay <= Duration::from_millis(1250));
        }
        assert_eq!(HttpOrigin::jittered(Duration::from_millis(2)), Duration::from_millis(2));
    }

    #[tokio::test]
    async fn test_fetch_success_is_basic() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/index.html"))
            .and(header_matcher("accept", "text/html"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("<h1>home</h1>", "text/html"))
            .mount(&server)
            .await;

        let req = request(&server, "/index.html")
            .with_header(header::ACCEPT, HeaderValue::from_static("text/html"));
        let response = origin().fetch(&req).await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.kind, ResponseKind::Basic);
        assert_eq!(response.text(), "<h1>home</h1>");
        assert_eq!(response.headers.get("content-type").unwrap(), "text/html");
        assert!(!response.from_cache);
    }

    #[tokio::test]
    async fn test_error_status_is_returned_not_raised() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_string("nope"))
            .mount(&server)
            .await;

        let response = origin().fetch(&request(&server, "/missing")).await.unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_forwards_method() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/submit"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let mut req = request(&server, "/api/submit");
        req.method = Method::POST;
        let response = origin().fetch(&req).await.unwrap();
        assert_eq!(response.status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_rate_limit_retries_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/busy"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/busy"))
            .respond_with(ResponseTemplate::new(200).set_body_string("finally"))
            .mount(&server)
            .await;

        let response = origin().fetch(&request(&server, "/busy")).await.unwrap();
        assert_eq!(response.text(), "finally");
    }

    #[tokio::test]
    async fn test_rate_limit_gives_up() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/busy"))
            .respond_with(ResponseTemplate::new(429))
            .expect(u64::from(MAX_RATE_LIMIT_RETRIES) + 1)
            .mount(&server)
            .await;

        let result = origin().fetch(&request(&server, "/busy")).await;
        assert!(matches!(result, Err(FetchError::RateLimited)));
    }

    #[tokio::test]
    async fn test_unsupported_scheme_is_invalid_request() {
        let req = Request::get(Url::parse("ftp://app.example/index.html").unwrap());
        let err = origin().fetch(&req).await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidRequest(_)));
        assert!(!err.is_network_failure());
    }

    #[tokio::test]
    async fn test_unreachable_origin_is_network_error() {
        let req = Request::get(Url::parse("http://127.0.0.1:9/unreachable").unwrap());
        let result = origin().fetch(&req).await;
        assert!(matches!(result, Err(FetchError::Network(_))));
    }
}
