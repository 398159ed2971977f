//! Cache generations and the storage they live in.

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use offline_net::{Request, Response, ResponseType};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;
use url::Url;

/// Cache storage errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache not found: {0}")]
    NotFound(String),

    #[error("Unsupported method for cache: {0}")]
    UnsupportedMethod(String),

    #[error("Invalid cache entry: {0}")]
    InvalidEntry(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Check if a network response may be stored.
///
/// Only plain `200` responses whose contents are visible qualify; partial
/// content, opaque, and error responses never do.
pub fn is_cacheable(response: &Response) -> bool {
    response.status == 200
        && response.response_type != ResponseType::Error
        && !response.response_type.is_opaque()
}

// ==================== Keys & Entries ====================

/// Canonical identity of a cached request: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    method: Method,
    url: String,
}

impl CacheKey {
    /// Key for an arbitrary method and URL.
    pub fn new(method: Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method,
            url: url.into(),
        }
    }

    /// Key for a GET of `url`.
    pub fn get(url: &Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Key for an intercepted request.
    pub fn for_request(request: &Request) -> Self {
        Self::new(request.method.clone(), &request.url)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Final response URL, after any redirects.
    pub response_url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response status text.
    pub status_text: String,

    /// Response headers in received order, values as raw bytes.
    pub headers: Vec<(String, Bytes)>,

    /// Response body.
    pub body: Bytes,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response for storage under `key`.
    pub fn from_response(key: &CacheKey, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    Bytes::copy_from_slice(value.as_bytes()),
                )
            })
            .collect();

        Self {
            url: key.url.clone(),
            response_url: response.url.to_string(),
            method: key.method.to_string(),
            status: response.status,
            status_text: response.status_text.clone(),
            headers,
            body: response.body().clone(),
            cached_at: now_millis(),
        }
    }

    /// Rebuild the stored response.
    pub fn to_response(&self) -> Result<Response, CacheError> {
        let url = Url::parse(&self.response_url)
            .map_err(|e| CacheError::InvalidEntry(e.to_string()))?;
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| CacheError::InvalidEntry(e.to_string()))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            match (
                HeaderName::try_from(name.as_str()),
                HeaderValue::from_bytes(value),
            ) {
                (Ok(n), Ok(v)) => {
                    headers.append(n, v);
                }
                _ => {
                    warn!(url = %self.url, header = %name, "Dropping unreadable cached header")
                }
            }
        }

        Ok(Response::new(url, status, headers, self.body.clone())
            .with_status_text(self.status_text.clone()))
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ==================== Cache ====================

/// A cache generation.
#[derive(Debug, Default, Clone)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    /// Cached entries.
    entries: HashMap<CacheKey, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request.
    pub fn match_key(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Add entry, replacing any previous one for the key.
    pub fn put(&mut self, key: CacheKey, entry: CacheEntry) {
        self.entries.insert(key, entry);
    }

    /// Delete entry.
    pub fn delete(&mut self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Get all keys.
    pub fn keys(&self) -> Vec<&CacheKey> {
        self.entries.keys().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== Cache Storage ====================

/// Named cache generations (the `caches` global).
///
/// Each call is atomic on its own; there is no cross-call locking, so
/// concurrent writers to the same key resolve as last-write-wins.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open a cache, creating it if it doesn't exist.
    async fn open(&self, name: &str) -> Result<(), CacheError>;

    /// Check if a cache exists.
    async fn has(&self, name: &str) -> Result<bool, CacheError>;

    /// Delete a cache. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool, CacheError>;

    /// Get all cache names, sorted.
    async fn keys(&self) -> Result<Vec<String>, CacheError>;

    /// Look up a key in one cache. A missing cache is a miss.
    async fn match_entry(&self, name: &str, key: &CacheKey)
        -> Result<Option<CacheEntry>, CacheError>;

    /// Store an entry, opening the cache if needed.
    async fn put(&self, name: &str, key: CacheKey, entry: CacheEntry) -> Result<(), CacheError>;

    /// Store several entries.
    async fn put_all(
        &self,
        name: &str,
        entries: Vec<(CacheKey, CacheEntry)>,
    ) -> Result<(), CacheError> {
        for (key, entry) in entries {
            self.put(name, key, entry).await?;
        }
        Ok(())
    }

    /// Get all keys in a cache.
    async fn entries(&self, name: &str) -> Result<Vec<CacheKey>, CacheError>;
}

fn check_method(key: &CacheKey) -> Result<(), CacheError> {
    if key.method != Method::GET {
        return Err(CacheError::UnsupportedMethod(key.method.to_string()));
    }
    Ok(())
}

/// In-memory cache storage.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    caches: RwLock<HashMap<String, Cache>>,
}

impl MemoryCacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<(), CacheError> {
        self.caches
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name));
        Ok(())
    }

    async fn has(&self, name: &str) -> Result<bool, CacheError> {
        Ok(self.caches.read().await.contains_key(name))
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        Ok(self.caches.write().await.remove(name).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn match_entry(
        &self,
        name: &str,
        key: &CacheKey,
    ) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self
            .caches
            .read()
            .await
            .get(name)
            .and_then(|cache| cache.match_key(key))
            .cloned())
    }

    async fn put(&self, name: &str, key: CacheKey, entry: CacheEntry) -> Result<(), CacheError> {
        check_method(&key)?;
        self.caches
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
            .put(key, entry);
        Ok(())
    }

    async fn put_all(
        &self,
        name: &str,
        entries: Vec<(CacheKey, CacheEntry)>,
    ) -> Result<(), CacheError> {
        // Validate everything first so a rejected entry leaves the cache untouched.
        for (key, _) in &entries {
            check_method(key)?;
        }
        let mut caches = self.caches.write().await;
        let cache = caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name));
        for (key, entry) in entries {
            cache.put(key, entry);
        }
        Ok(())
    }

    async fn entries(&self, name: &str) -> Result<Vec<CacheKey>, CacheError> {
        let caches = self.caches.read().await;
        let cache = caches
            .get(name)
            .ok_or_else(|| CacheError::NotFound(name.to_string()))?;
        Ok(cache.keys().into_iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn response(body: &'static [u8]) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/css"));
        Response::new(
            url("https://app.example/style.css"),
            StatusCode::OK,
            headers,
            Bytes::from_static(body),
        )
    }

    #[test]
    fn test_cache_key_strips_fragment() {
        let a = CacheKey::get(&url("https://app.example/index.html#top"));
        let b = CacheKey::get(&url("https://app.example/index.html"));
        assert_eq!(a, b);
        assert_eq!(a.url(), "https://app.example/index.html");
    }

    #[test]
    fn test_cache_key_includes_method() {
        let u = url("https://app.example/api");
        assert_ne!(CacheKey::get(&u), CacheKey::new(Method::POST, &u));
        assert_eq!(CacheKey::get(&u).to_string(), "GET https://app.example/api");
    }

    #[test]
    fn test_cache_key_keeps_query() {
        let a = CacheKey::get(&url("https://app.example/data?page=1"));
        let b = CacheKey::get(&url("https://app.example/data?page=2"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_entry_roundtrip_preserves_response() {
        let original = response(b"body{color:red}");
        let key = CacheKey::get(&original.url);
        let entry = CacheEntry::from_response(&key, &original);

        assert_eq!(entry.status, 200);
        assert_eq!(entry.method, "GET");

        let restored = entry.to_response().unwrap();
        assert_eq!(restored.status, original.status);
        assert_eq!(restored.status_text, original.status_text);
        assert_eq!(restored.body(), original.body());
        assert_eq!(restored.header("content-type"), Some("text/css"));
    }

    #[test]
    fn test_entry_keeps_non_ascii_header_values() {
        let disposition = "attachment; filename=\"café.pdf\"";
        let mut original = response(b"%PDF");
        original.headers.insert(
            "content-disposition",
            HeaderValue::from_bytes(disposition.as_bytes()).unwrap(),
        );
        let key = CacheKey::get(&original.url);

        let restored = CacheEntry::from_response(&key, &original)
            .to_response()
            .unwrap();

        assert_eq!(restored.headers.len(), 2);
        assert_eq!(
            restored.headers["content-disposition"].as_bytes(),
            disposition.as_bytes()
        );
        assert_eq!(restored.header("content-type"), Some("text/css"));
    }

    #[test]
    fn test_entry_keeps_redirected_response_url() {
        let mut original = response(b"body{}");
        original.url = url("https://app.example/v2/style.css");
        let key = CacheKey::get(&url("https://app.example/style.css"));

        let entry = CacheEntry::from_response(&key, &original);
        assert_eq!(entry.url, "https://app.example/style.css");

        let restored = entry.to_response().unwrap();
        assert_eq!(restored.url.as_str(), "https://app.example/v2/style.css");
    }

    #[test]
    fn test_is_cacheable() {
        assert!(is_cacheable(&response(b"ok")));

        let mut partial = response(b"ok");
        partial.status = 206;
        assert!(!is_cacheable(&partial));

        let mut missing = response(b"");
        missing.status = 404;
        assert!(!is_cacheable(&missing));

        let opaque = response(b"").with_type(ResponseType::Opaque);
        assert!(!is_cacheable(&opaque));

        let error = Response::network_error(url("https://app.example/"));
        assert!(!is_cacheable(&error));
    }

    #[test]
    fn test_cache() {
        let mut cache = Cache::new("v1");
        let key = CacheKey::get(&url("https://app.example/style.css"));
        cache.put(key.clone(), CacheEntry::from_response(&key, &response(b"a")));

        assert!(cache.match_key(&key).is_some());
        assert!(cache
            .match_key(&CacheKey::get(&url("https://app.example/other.css")))
            .is_none());
        assert_eq!(cache.len(), 1);

        assert!(cache.delete(&key));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_storage_open_has_delete() {
        let storage = MemoryCacheStorage::new();

        assert!(!storage.has("v1").await.unwrap());
        storage.open("v1").await.unwrap();
        assert!(storage.has("v1").await.unwrap());

        assert!(storage.delete("v1").await.unwrap());
        assert!(!storage.has("v1").await.unwrap());
        assert!(!storage.delete("v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_storage_keys_sorted() {
        let storage = MemoryCacheStorage::new();
        storage.open("b-runtime").await.unwrap();
        storage.open("a-precache").await.unwrap();
        assert_eq!(storage.keys().await.unwrap(), vec!["a-precache", "b-runtime"]);
    }

    #[tokio::test]
    async fn test_storage_put_and_match() {
        let storage = MemoryCacheStorage::new();
        let resp = response(b"x");
        let key = CacheKey::get(&resp.url);

        storage
            .put("rt", key.clone(), CacheEntry::from_response(&key, &resp))
            .await
            .unwrap();

        assert!(storage.has("rt").await.unwrap());
        assert!(storage.match_entry("rt", &key).await.unwrap().is_some());
        assert!(storage.match_entry("other", &key).await.unwrap().is_none());
        assert_eq!(storage.entries("rt").await.unwrap(), vec![key]);
    }

    #[tokio::test]
    async fn test_storage_rejects_non_get() {
        let storage = MemoryCacheStorage::new();
        let resp = response(b"x");
        let key = CacheKey::new(Method::POST, &resp.url);
        let result = storage
            .put("rt", key.clone(), CacheEntry::from_response(&key, &resp))
            .await;
        assert_eq!(result, Err(CacheError::UnsupportedMethod("POST".to_string())));
    }

    #[tokio::test]
    async fn test_put_all_is_all_or_nothing() {
        let storage = MemoryCacheStorage::new();
        let resp = response(b"x");
        let good = CacheKey::get(&resp.url);
        let bad = CacheKey::new(Method::PUT, &resp.url);

        let result = storage
            .put_all(
                "pre",
                vec![
                    (good.clone(), CacheEntry::from_response(&good, &resp)),
                    (bad.clone(), CacheEntry::from_response(&bad, &resp)),
                ],
            )
            .await;

        assert!(result.is_err());
        assert!(storage.match_entry("pre", &good).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_entries_of_missing_cache() {
        let storage = MemoryCacheStorage::new();
        assert_eq!(
            storage.entries("nope").await,
            Err(CacheError::NotFound("nope".to_string()))
        );
    }
}
