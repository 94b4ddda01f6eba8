//! Per-request interception policy.
//!
//! Cache-first for same-origin GET requests: a hit is returned without any
//! network traffic, a miss is fetched and, when the response is a
//! successful same-origin one, copied into the dynamic partition. Failed
//! HTML requests fall back to the offline document.
//!
//! Caching is an optimization: store failures are logged and never reach
//! the caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use reqwest::{Method, Url};
use tracing::{debug, warn};

use crate::http::{FetchOptions, Request, Response, ResponseKind};
use crate::origin::{self, FetchError, Origin};
use crate::store::{CacheEntry, CacheKey, CacheStorage};

pub struct Router {
    storage: Arc<dyn CacheStorage>,
    origin: Arc<dyn Origin>,
    scope: Url,
    static_partition: String,
    dynamic_partition: String,
    offline_fallback: String,
    vary_headers: Vec<String>,
    retired: AtomicBool,
}

impl Router {
    pub fn new(
        storage: Arc<dyn CacheStorage>,
        origin: Arc<dyn Origin>,
        scope: Url,
        static_partition: String,
        dynamic_partition: String,
    ) -> Self {
        Self {
            storage,
            origin,
            scope,
            static_partition,
            dynamic_partition,
            offline_fallback: "/index.html".to_string(),
            vary_headers: Vec::new(),
            retired: AtomicBool::new(false),
        }
    }

    pub fn with_offline_fallback(mut self, path: impl Into<String>) -> Self {
        self.offline_fallback = path.into();
        self
    }

    pub fn with_vary_headers(mut self, headers: Vec<String>) -> Self {
        self.vary_headers = headers;
        self
    }

    /// Stop writing to the dynamic partition. Used once a newer generation
    /// has taken over and this generation's partitions are being removed.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub async fn intercept(
        &self,
        request: Request,
        options: FetchOptions,
    ) -> Result<Response, FetchError> {
        if request.method != Method::GET {
            debug!(method = %request.method, url = %request.url, "Passing through non-GET request");
            return origin::fetch_with_options(self.origin.as_ref(), &request, options).await;
        }
        if !request.is_same_origin(&self.scope) {
            debug!(url = %request.url, "Passing through cross-origin request");
            return origin::fetch_with_options(self.origin.as_ref(), &request, options).await;
        }

        let key = CacheKey::from_request(&request, &self.vary_headers);
        if let Some(entry) = self.lookup(&key).await {
            debug!(key = %key, "Cache hit");
            return Ok(entry.to_response());
        }

        debug!(key = %key, "Cache miss, fetching");
        match origin::fetch_with_options(self.origin.as_ref(), &request, options).await {
            Ok(response) => {
                if response.is_success() && response.kind == ResponseKind::Basic {
                    self.store(key, &response).await;
                } else {
                    debug!(
                        url = %request.url,
                        status = %response.status,
                        kind = ?response.kind,
                        "Response not cacheable"
                    );
                }
                Ok(response)
            }
            Err(e) if e.is_network_failure() && request.accepts_html() => {
                match self.offline_document().await {
                    Some(fallback) => {
                        warn!(url = %request.url, error = %e, "Fetch failed, serving offline fallback");
                        Ok(fallback)
                    }
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Static partition first, then dynamic. Preloaded entries carry no
    /// vary values, so the static partition is also searched by the bare
    /// method and URL.
    async fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        if let Some(entry) = self.get(&self.static_partition, key).await {
            return Some(entry);
        }
        if !key.vary.is_empty() {
            if let Some(entry) = self.get(&self.static_partition, &key.without_vary()).await {
                return Some(entry);
            }
        }
        self.get(&self.dynamic_partition, key).await
    }

    async fn get(&self, partition: &str, key: &CacheKey) -> Option<CacheEntry> {
        match self.storage.get(partition, key).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(partition = %partition, error = %e, "Cache lookup failed");
                None
            }
        }
    }

    async fn store(&self, key: CacheKey, response: &Response) {
        if self.is_retired() {
            debug!(key = %key, "Router retired, not caching");
            return;
        }
        let entry = CacheEntry::from_response(key, response);
        if let Err(e) = self.storage.put(&self.dynamic_partition, entry).await {
            warn!(partition = %self.dynamic_partition, error = %e, "Failed to cache response");
        }
    }

    async fn offline_document(&self) -> Option<Response> {
        let url = match self.scope.join(&self.offline_fallback) {
            Ok(url) => url,
            Err(e) => {
                warn!(path = %self.offline_fallback, error = %e, "Invalid offline fallback path");
                return None;
            }
        };
        self.lookup(&CacheKey::get(&url))
            .await
            .map(|entry| entry.to_response())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStorage;
    use crate::test_support::{scope, url, CountingStorage, FailingStorage, FakeOrigin};
    use reqwest::header::{self, HeaderValue};
    use reqwest::StatusCode;

    const STATIC: &str = "static-v1";
    const DYNAMIC: &str = "dynamic-v1";

    fn router(storage: Arc<dyn CacheStorage>, origin: &Arc<FakeOrigin>) -> Router {
        Router::new(
            storage,
            Arc::clone(origin) as Arc<dyn Origin>,
            scope(),
            STATIC.to_string(),
            DYNAMIC.to_string(),
        )
    }

    fn html_request(path: &str) -> Request {
        Request::get(url(path)).with_header(
            header::ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml"),
        )
    }

    async fn seed(storage: &MemoryStorage, partition: &str, path: &str, body: &str) {
        let entry = CacheEntry::new(CacheKey::get(&url(path)), 200, body);
        storage.put(partition, entry).await.unwrap();
    }

    #[tokio::test]
    async fn test_cache_hit_skips_network() {
        let storage = Arc::new(MemoryStorage::new());
        seed(&storage, STATIC, "/index.html", "A").await;
        let origin = Arc::new(FakeOrigin::new());
        origin.respond("https://app.example/index.html", 200, "B");

        let response = router(storage, &origin)
            .intercept(Request::get(url("/index.html")), FetchOptions::default())
            .await
            .unwrap();

        assert_eq!(response.text(), "A");
        assert!(response.from_cache);
        assert_eq!(origin.calls(), 0);
    }

    #[tokio::test]
    async fn test_vary_request_hits_preloaded_shell() {
        let storage = Arc::new(MemoryStorage::new());
        seed(&storage, STATIC, "/index.html", "shell").await;
        let origin = Arc::new(FakeOrigin::new());
        let router = router(Arc::clone(&storage) as Arc<dyn CacheStorage>, &origin)
            .with_vary_headers(vec!["accept-language".to_string()]);

        let request = Request::get(url("/index.html"))
            .with_header(header::ACCEPT_LANGUAGE, HeaderValue::from_static("de"));
        let response = router
            .intercept(request, FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(response.text(), "shell");
        assert_eq!(origin.calls(), 0);
    }

    #[tokio::test]
    async fn test_vary_values_separate_dynamic_entries() {
        let storage = Arc::new(MemoryStorage::new());
        let origin = Arc::new(FakeOrigin::new());
        origin.respond("https://app.example/greeting", 200, "hallo");
        let router = router(Arc::clone(&storage) as Arc<dyn CacheStorage>, &origin)
            .with_vary_headers(vec!["accept-language".to_string()]);
        let request = |lang: &'static str| {
            Request::get(url("/greeting"))
                .with_header(header::ACCEPT_LANGUAGE, HeaderValue::from_static(lang))
        };

        router.intercept(request("de"), FetchOptions::default()).await.unwrap();
        router.intercept(request("de"), FetchOptions::default()).await.unwrap();
        assert_eq!(origin.calls(), 1);

        router.intercept(request("fr"), FetchOptions::default()).await.unwrap();
        assert_eq!(origin.calls(), 2);
        assert_eq!(storage.keys(DYNAMIC).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_static_wins_over_dynamic() {
        let storage = Arc::new(MemoryStorage::new());
        seed(&storage, DYNAMIC, "/app.js", "dynamic").await;
        seed(&storage, STATIC, "/app.js", "static").await;
        let origin = Arc::new(FakeOrigin::new());

        let response = router(storage, &origin)
            .intercept(Request::get(url("/app.js")), FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(response.text(), "static");
    }

    #[tokio::test]
    async fn test_miss_populates_dynamic() {
        let storage = Arc::new(MemoryStorage::new());
        let origin = Arc::new(FakeOrigin::new());
        origin.respond("https://app.example/api/items", 200, "[1,2]");
        let router = router(Arc::clone(&storage) as Arc<dyn CacheStorage>, &origin);

        let first = router
            .intercept(Request::get(url("/api/items")), FetchOptions::default())
            .await
            .unwrap();
        assert!(!first.from_cache);

        let second = router
            .intercept(Request::get(url("/api/items")), FetchOptions::default())
            .await
            .unwrap();
        assert!(second.from_cache);
        assert_eq!(second.text(), "[1,2]");
        assert_eq!(origin.calls(), 1);
        assert_eq!(storage.keys(DYNAMIC).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_non_get_never_touches_store() {
        let storage = CountingStorage::new();
        let origin = Arc::new(FakeOrigin::new());
        origin.respond("https://app.example/index.html", 200, "posted");
        let router = router(Arc::clone(&storage) as Arc<dyn CacheStorage>, &origin);

        for method in [Method::POST, Method::PUT, Method::DELETE, Method::HEAD] {
            let request = Request::new(method, url("/index.html"));
            router.intercept(request, FetchOptions::default()).await.unwrap();
        }

        assert_eq!(storage.calls(), 0);
        assert_eq!(origin.calls(), 4);
    }

    #[tokio::test]
    async fn test_cross_origin_never_cached() {
        let storage = CountingStorage::new();
        let origin = Arc::new(FakeOrigin::new());
        origin.respond("https://cdn.example/lib.js", 200, "lib");
        let router = router(Arc::clone(&storage) as Arc<dyn CacheStorage>, &origin);

        for _ in 0..2 {
            let response = router
                .intercept(Request::get(Url::parse("https://cdn.example/lib.js").unwrap()), FetchOptions::default())
                .await
                .unwrap();
            assert_eq!(response.text(), "lib");
        }
        assert_eq!(storage.calls(), 0);
        assert_eq!(origin.calls(), 2);
    }

    #[tokio::test]
    async fn test_error_status_not_cached() {
        let storage = Arc::new(MemoryStorage::new());
        let origin = Arc::new(FakeOrigin::new());
        origin.respond("https://app.example/broken", 500, "oops");

        let response = router(Arc::clone(&storage) as Arc<dyn CacheStorage>, &origin)
            .intercept(Request::get(url("/broken")), FetchOptions::default())
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(storage.keys(DYNAMIC).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_basic_response_not_cached() {
        let storage = Arc::new(MemoryStorage::new());
        let origin = Arc::new(FakeOrigin::new());
        origin.respond_cross_origin("https://app.example/redirected", "elsewhere");

        let response = router(Arc::clone(&storage) as Arc<dyn CacheStorage>, &origin)
            .intercept(Request::get(url("/redirected")), FetchOptions::default())
            .await
            .unwrap();

        assert_eq!(response.text(), "elsewhere");
        assert!(storage.keys(DYNAMIC).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offline_html_serves_fallback() {
        let storage = Arc::new(MemoryStorage::new());
        seed(&storage, STATIC, "/index.html", "offline shell").await;
        let origin = Arc::new(FakeOrigin::new());
        origin.set_offline(true);

        let response = router(storage, &origin)
            .intercept(html_request("/missing.html"), FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(response.text(), "offline shell");
        assert!(response.from_cache);
    }

    #[tokio::test]
    async fn test_offline_without_accept_propagates() {
        let storage = Arc::new(MemoryStorage::new());
        seed(&storage, STATIC, "/index.html", "offline shell").await;
        let origin = Arc::new(FakeOrigin::new());
        origin.set_offline(true);

        let result = router(storage, &origin)
            .intercept(Request::get(url("/missing.html")), FetchOptions::default())
            .await;
        assert!(matches!(result, Err(FetchError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_offline_html_without_fallback_propagates() {
        let storage = Arc::new(MemoryStorage::new());
        let origin = Arc::new(FakeOrigin::new());
        origin.set_offline(true);

        let result = router(storage, &origin)
            .intercept(html_request("/missing.html"), FetchOptions::default())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_custom_fallback_path() {
        let storage = Arc::new(MemoryStorage::new());
        seed(&storage, STATIC, "/offline.html", "you are offline").await;
        let origin = Arc::new(FakeOrigin::new());
        origin.set_offline(true);

        let response = router(storage, &origin)
            .with_offline_fallback("/offline.html")
            .intercept(html_request("/page"), FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(response.text(), "you are offline");
    }

    #[tokio::test]
    async fn test_store_failures_do_not_fail_requests() {
        let origin = Arc::new(FakeOrigin::new());
        origin.respond("https://app.example/data", 200, "fresh");

        let response = router(Arc::new(FailingStorage), &origin)
            .intercept(Request::get(url("/data")), FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(response.text(), "fresh");
    }

    #[tokio::test]
    async fn test_retired_router_stops_writing() {
        let storage = Arc::new(MemoryStorage::new());
        let origin = Arc::new(FakeOrigin::new());
        origin.respond("https://app.example/data", 200, "fresh");
        let router = router(Arc::clone(&storage) as Arc<dyn CacheStorage>, &origin);
        router.retire();

        router
            .intercept(Request::get(url("/data")), FetchOptions::default())
            .await
            .unwrap();
        assert!(storage.list_partitions().await.unwrap().is_empty());
    }
}
