//! In-memory origin and storage doubles shared by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};

use crate::error::StoreError;
use crate::http::{Request, Response, ResponseKind};
use crate::origin::{FetchError, Origin};
use crate::store::{CacheEntry, CacheKey, CacheStorage, MemoryStorage};

pub const SCOPE: &str = "https://app.example/";

pub fn scope() -> Url {
    Url::parse(SCOPE).unwrap()
}

pub fn url(path: &str) -> Url {
    scope().join(path).unwrap()
}

#[derive(Default)]
pub struct FakeOrigin {
    routes: Mutex<HashMap<String, Response>>,
    calls: AtomicUsize,
    offline: AtomicBool,
    delay: Option<Duration>,
}

impl FakeOrigin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn respond(&self, url: &str, status: u16, body: &str) {
        let response = Response::new(StatusCode::from_u16(status).unwrap(), body);
        self.respond_with(url, response);
    }

    pub fn respond_with(&self, url: &str, response: Response) {
        self.routes.lock().unwrap().insert(url.to_string(), response);
    }

    pub fn respond_cross_origin(&self, url: &str, body: &str) {
        self.respond_with(url, Response::new(StatusCode::OK, body).with_kind(ResponseKind::Cors));
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Origin for FakeOrigin {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(FetchError::Unreachable(request.url.to_string()));
        }
        let route = self.routes.lock().unwrap().get(request.url.as_str()).cloned();
        Ok(route.unwrap_or_else(|| Response::new(StatusCode::NOT_FOUND, "not found")))
    }
}

/// Memory storage that counts every call, for asserting that a code path
/// never touches the store.
#[derive(Default)]
pub struct CountingStorage {
    inner: MemoryStorage,
    calls: AtomicUsize,
}

impl CountingStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CacheStorage for CountingStorage {
    async fn open(&self, partition: &str) -> Result<(), StoreError> {
        self.touch();
        self.inner.open(partition).await
    }

    async fn get(&self, partition: &str, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        self.touch();
        self.inner.get(partition, key).await
    }

    async fn put(&self, partition: &str, entry: CacheEntry) -> Result<(), StoreError> {
        self.touch();
        self.inner.put(partition, entry).await
    }

    async fn delete(&self, partition: &str, key: &CacheKey) -> Result<bool, StoreError> {
        self.touch();
        self.inner.delete(partition, key).await
    }

    async fn keys(&self, partition: &str) -> Result<Vec<CacheKey>, StoreError> {
        self.touch();
        self.inner.keys(partition).await
    }

    async fn list_partitions(&self) -> Result<Vec<String>, StoreError> {
        self.touch();
        self.inner.list_partitions().await
    }

    async fn delete_partition(&self, partition: &str) -> Result<bool, StoreError> {
        self.touch();
        self.inner.delete_partition(partition).await
    }
}

/// Memory storage that accepts a fixed number of writes and fails every
/// write after that, like a store running out of quota.
pub struct QuotaStorage {
    inner: MemoryStorage,
    remaining_puts: AtomicUsize,
}

impl QuotaStorage {
    pub fn new(puts: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStorage::new(),
            remaining_puts: AtomicUsize::new(puts),
        })
    }
}

#[async_trait]
impl CacheStorage for QuotaStorage {
    async fn open(&self, partition: &str) -> Result<(), StoreError> {
        self.inner.open(partition).await
    }

    async fn get(&self, partition: &str, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        self.inner.get(partition, key).await
    }

    async fn put(&self, partition: &str, entry: CacheEntry) -> Result<(), StoreError> {
        self.remaining_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map_err(|_| broken())?;
        self.inner.put(partition, entry).await
    }

    async fn delete(&self, partition: &str, key: &CacheKey) -> Result<bool, StoreError> {
        self.inner.delete(partition, key).await
    }

    async fn keys(&self, partition: &str) -> Result<Vec<CacheKey>, StoreError> {
        self.inner.keys(partition).await
    }

    async fn list_partitions(&self) -> Result<Vec<String>, StoreError> {
        self.inner.list_partitions().await
    }

    async fn delete_partition(&self, partition: &str) -> Result<bool, StoreError> {
        self.inner.delete_partition(partition).await
    }
}

/// Storage whose every operation fails, for exercising error paths.
pub struct FailingStorage;

fn broken() -> StoreError {
    StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, "quota exceeded"))
}

#[async_trait]
impl CacheStorage for FailingStorage {
    async fn open(&self, _partition: &str) -> Result<(), StoreError> {
        Err(broken())
    }

    async fn get(&self, _partition: &str, _key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        Err(broken())
    }

    async fn put(&self, _partition: &str, _entry: CacheEntry) -> Result<(), StoreError> {
        Err(broken())
    }

    async fn delete(&self, _partition: &str, _key: &CacheKey) -> Result<bool, StoreError> {
        Err(broken())
    }

    async fn keys(&self, _partition: &str) -> Result<Vec<CacheKey>, StoreError> {
        Err(broken())
    }

    async fn list_partitions(&self) -> Result<Vec<String>, StoreError> {
        Err(broken())
    }

    async fn delete_partition(&self, _partition: &str) -> Result<bool, StoreError> {
        Err(broken())
    }
}
