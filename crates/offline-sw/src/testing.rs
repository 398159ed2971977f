//! Test doubles: a scripted network, a recording worker scope, and a cache
//! storage that refuses some deletions.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::{HashMap, HashSet};
use http::{HeaderMap, StatusCode};
use offline_net::{Fetcher, NetError, Request, Response};
use url::Url;

use crate::cache::{CacheEntry, CacheError, CacheKey, CacheStorage, MemoryCacheStorage};
use crate::config::{PrecacheManifest, WorkerConfig};
use crate::push::NotificationOptions;
use crate::scope::WorkerScope;
use crate::worker::WorkerContext;
use crate::ServiceWorkerError;

// ==================== Network ====================

/// A fetcher answering from a fixed table of URLs.
///
/// Unknown URLs get a `404`. While offline, or for URLs marked with
/// [`StaticFetcher::fail`], every fetch is rejected.
#[derive(Debug, Default)]
pub struct StaticFetcher {
    assets: Mutex<HashMap<String, (u16, Bytes)>>,
    failing: Mutex<HashSet<String>>,
    offline: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `body` with status 200 at `path` under `origin`.
    pub fn with_asset(self, origin: &str, path: &str, body: impl Into<Bytes>) -> Self {
        let url = join(origin, path);
        self.serve(&url, 200, body);
        self
    }

    /// Serve `body` with `status` at an absolute URL.
    pub fn serve(&self, url: &str, status: u16, body: impl Into<Bytes>) {
        lock(&self.assets).insert(normalize(url), (status, body.into()));
    }

    /// Reject every fetch of an absolute URL.
    pub fn fail(&self, url: &str) {
        lock(&self.failing).insert(normalize(url));
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of fetches attempted so far.
    pub fn total_calls(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Number of fetches of one absolute URL.
    pub fn calls_for(&self, url: &str) -> usize {
        let url = normalize(url);
        lock(&self.calls).iter().filter(|u| **u == url).count()
    }
}

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        let url = normalize(request.url.as_str());
        lock(&self.calls).push(url.clone());

        if self.offline.load(Ordering::SeqCst) || lock(&self.failing).contains(&url) {
            return Err(NetError::RequestFailed(format!("network unreachable: {url}")));
        }

        let (status, body) = lock(&self.assets)
            .get(&url)
            .cloned()
            .unwrap_or((404, Bytes::new()));
        let status = StatusCode::from_u16(status)
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        Ok(Response::new(request.url.clone(), status, HeaderMap::new(), body))
    }
}

fn join(origin: &str, path: &str) -> String {
    Url::parse(origin)
        .and_then(|base| base.join(path))
        .map(String::from)
        .unwrap_or_else(|_| format!("{origin}{path}"))
}

fn normalize(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut url) => {
            url.set_fragment(None);
            url.into()
        }
        Err(_) => url.to_string(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ==================== Scope ====================

/// A worker scope that records every call.
#[derive(Debug, Default)]
pub struct RecordingScope {
    skip_waiting: AtomicUsize,
    claims: AtomicUsize,
    fail_claims: AtomicBool,
    notifications: Mutex<Vec<(String, NotificationOptions)>>,
}

impl RecordingScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip_waiting_calls(&self) -> usize {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    pub fn claims(&self) -> usize {
        self.claims.load(Ordering::SeqCst)
    }

    /// Make subsequent claims fail.
    pub fn fail_claims(&self, fail: bool) {
        self.fail_claims.store(fail, Ordering::SeqCst);
    }

    pub fn notifications(&self) -> Vec<(String, NotificationOptions)> {
        lock(&self.notifications).clone()
    }
}

impl WorkerScope for RecordingScope {
    fn skip_waiting(&self) {
        self.skip_waiting.fetch_add(1, Ordering::SeqCst);
    }

    fn claim_clients(&self) -> Result<(), ServiceWorkerError> {
        if self.fail_claims.load(Ordering::SeqCst) {
            return Err(ServiceWorkerError::StateError("claim rejected".to_string()));
        }
        self.claims.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn show_notification(
        &self,
        title: &str,
        options: NotificationOptions,
    ) -> Result<(), ServiceWorkerError> {
        lock(&self.notifications).push((title.to_string(), options));
        Ok(())
    }
}

// ==================== Storage ====================

/// Memory storage whose `delete` fails for a fixed set of cache names.
#[derive(Debug, Default)]
pub struct FlakyStorage {
    inner: MemoryCacheStorage,
    refuse_delete: HashSet<String>,
}

impl FlakyStorage {
    pub fn new<I, S>(refuse_delete: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inner: MemoryCacheStorage::new(),
            refuse_delete: refuse_delete.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl CacheStorage for FlakyStorage {
    async fn open(&self, name: &str) -> Result<(), CacheError> {
        self.inner.open(name).await
    }

    async fn has(&self, name: &str) -> Result<bool, CacheError> {
        self.inner.has(name).await
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        if self.refuse_delete.contains(name) {
            return Err(CacheError::Storage("delete refused".to_string()));
        }
        self.inner.delete(name).await
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        self.inner.keys().await
    }

    async fn match_entry(
        &self,
        name: &str,
        key: &CacheKey,
    ) -> Result<Option<CacheEntry>, CacheError> {
        self.inner.match_entry(name, key).await
    }

    async fn put(&self, name: &str, key: CacheKey, entry: CacheEntry) -> Result<(), CacheError> {
        self.inner.put(name, key, entry).await
    }

    async fn put_all(
        &self,
        name: &str,
        entries: Vec<(CacheKey, CacheEntry)>,
    ) -> Result<(), CacheError> {
        self.inner.put_all(name, entries).await
    }

    async fn entries(&self, name: &str) -> Result<Vec<CacheKey>, CacheError> {
        self.inner.entries(name).await
    }
}

// ==================== Contexts ====================

/// Worker config `app-v1` / `app-runtime-v1` with the given manifest.
pub fn config(manifest: &[&str]) -> WorkerConfig {
    WorkerConfig::versioned("app", "1", PrecacheManifest::new(manifest.iter().copied()))
}

/// Context over fresh memory storage.
pub fn context(origin: &str, manifest: &[&str], fetcher: Arc<dyn Fetcher>) -> WorkerContext {
    context_with_storage(origin, manifest, fetcher, Arc::new(MemoryCacheStorage::new()))
}

/// Context over the given storage.
pub fn context_with_storage(
    origin: &str,
    manifest: &[&str],
    fetcher: Arc<dyn Fetcher>,
    storage: Arc<dyn CacheStorage>,
) -> WorkerContext {
    let origin = Url::parse(origin).expect("test origin");
    WorkerContext::new(&origin, Arc::new(config(manifest)), storage, fetcher)
        .expect("test context")
}
