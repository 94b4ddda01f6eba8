//! Network side of the intermediary.
//!
//! The router, preloader and host all reach the origin server through the
//! `Origin` trait. `HttpOrigin` is the `reqwest` implementation used in
//! production; tests substitute in-memory origins.

pub mod client;
pub mod error;

use async_trait::async_trait;
use futures::future::Abortable;

pub use client::HttpOrigin;
pub use error::FetchError;

use crate::http::{FetchOptions, Request, Response};

#[async_trait]
pub trait Origin: Send + Sync {
    /// Perform the real network fetch. Non-success statuses are returned as
    /// responses; only transport failures are errors.
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// Fetch honoring the caller's timeout and abort signal. Both surface as
/// `FetchError`s, indistinguishable from a network failure for the caller's
/// fallback logic.
pub async fn fetch_with_options(
    origin: &dyn Origin,
    request: &Request,
    options: FetchOptions,
) -> Result<Response, FetchError> {
    let timeout = options.timeout;
    let fetch = async move {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, origin.fetch(request)).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout(limit)),
            },
            None => origin.fetch(request).await,
        }
    };

    match options.abort {
        Some(registration) => Abortable::new(fetch, registration)
            .await
            .unwrap_or(Err(FetchError::Aborted)),
        None => fetch.await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_support::FakeOrigin;
    use futures::future::AbortHandle;
    use reqwest::Url;

    fn request() -> Request {
        Request::get(Url::parse("https://app.example/slow").unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_becomes_fetch_error() {
        let origin = FakeOrigin::new().with_delay(Duration::from_secs(10));
        origin.respond("https://app.example/slow", 200, "late");

        let result =
            fetch_with_options(&origin, &request(), FetchOptions::with_timeout(Duration::from_secs(1)))
                .await;
        assert!(matches!(result, Err(FetchError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_becomes_fetch_error() {
        let origin = FakeOrigin::new().with_delay(Duration::from_secs(10));
        origin.respond("https://app.example/slow", 200, "late");

        let (handle, registration) = AbortHandle::new_pair();
        handle.abort();
        let result = fetch_with_options(&origin, &request(), FetchOptions::with_abort(registration)).await;
        assert!(matches!(result, Err(FetchError::Aborted)));
    }

    #[tokio::test]
    async fn test_no_options_passes_through() {
        let origin = FakeOrigin::new();
        origin.respond("https://app.example/slow", 200, "ok");

        let response = fetch_with_options(&origin, &request(), FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(response.text(), "ok");
    }
}
