//! # OfflineKit Net
//!
//! The request and response values that flow between a page, the caching
//! worker and the network, plus the [`Fetcher`] seam the worker fetches
//! through.
//!
//! Responses carry their body as shared [`Bytes`]: the fetch policy hands one
//! copy to the page and stores another in the runtime cache, and cloning never
//! copies the payload. [`ResponseType`] follows the `fetch()` taxonomy so the
//! worker can refuse to store opaque and error responses.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use thiserror::Error;
use url::Url;

pub mod loader;

pub use loader::{Fetcher, LoaderConfig, ResourceLoader};

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A fetch that produced no response at all.
///
/// HTTP error statuses are not `NetError`s; they come back as a [`Response`].
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Identifies one request in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// An outgoing request, as the page issued it.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
    pub referrer: Option<Url>,
}

impl Request {
    fn new(method: Method, url: Url, body: Option<Bytes>) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method,
            headers: HeaderMap::new(),
            body,
            timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            referrer: None,
        }
    }

    /// A `GET` for `url`.
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url, None)
    }

    /// A `POST` of `body` to `url`.
    pub fn post(url: Url, body: Bytes) -> Self {
        Self::new(Method::POST, url, Some(body))
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// The page the request was issued from.
    pub fn referrer(mut self, referrer: Url) -> Self {
        self.referrer = Some(referrer);
        self
    }

    /// Whether `url` shares this request's origin.
    pub fn is_same_origin(&self, url: &Url) -> bool {
        self.url.origin() == url.origin()
    }
}

/// Response type, following the `fetch()` response taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseType {
    /// Same-origin network response.
    #[default]
    Basic,
    /// Cross-origin response read under CORS.
    Cors,
    /// Built locally (`new Response()`).
    Default,
    /// Network error (`Response.error()`).
    Error,
    /// Cross-origin response without CORS; body and status hidden.
    Opaque,
    /// Redirect followed in `manual` mode.
    OpaqueRedirect,
}

impl ResponseType {
    /// Whether the status, headers and body are hidden from the worker.
    pub fn is_opaque(&self) -> bool {
        matches!(self, Self::Opaque | Self::OpaqueRedirect)
    }
}

/// A response, as the page would see it.
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Url,
    /// Status code; `0` for network-error and opaque responses.
    pub status: u16,
    pub status_text: String,
    pub headers: HeaderMap,
    pub response_type: ResponseType,
    body: Bytes,
}

impl Response {
    pub fn new(url: Url, status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            url,
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            response_type: ResponseType::Basic,
            body,
        }
    }

    /// A network-error response (`Response.error()`).
    pub fn network_error(url: Url) -> Self {
        Self {
            url,
            status: 0,
            status_text: String::new(),
            headers: HeaderMap::new(),
            response_type: ResponseType::Error,
            body: Bytes::new(),
        }
    }

    pub fn with_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    /// Keep a stored status text instead of the canonical reason.
    pub fn with_status_text(mut self, status_text: impl Into<String>) -> Self {
        self.status_text = status_text.into();
        self
    }

    /// 2xx status.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The body decoded as UTF-8.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_request_builder() {
        let request = Request::get(url("https://app.example/data.json"))
            .header(
                HeaderName::from_static("accept"),
                HeaderValue::from_static("application/json"),
            )
            .timeout(Duration::from_secs(10))
            .referrer(url("https://app.example/"));

        assert_eq!(request.method, Method::GET);
        assert!(request.headers.contains_key("accept"));
        assert_eq!(request.timeout, Some(Duration::from_secs(10)));
        assert!(request.body.is_none());
        assert_eq!(request.referrer, Some(url("https://app.example/")));
    }

    #[test]
    fn test_post_carries_body() {
        let request = Request::post(url("https://app.example/api"), Bytes::from_static(b"{}"));
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.body.as_deref(), Some(&b"{}"[..]));
        assert_eq!(request.timeout, Some(DEFAULT_REQUEST_TIMEOUT));
    }

    #[test]
    fn test_same_origin() {
        let request = Request::get(url("https://app.example/index.html"));
        assert!(request.is_same_origin(&url("https://app.example/style.css")));
        assert!(!request.is_same_origin(&url("https://cdn.example/app.js")));
        assert!(!request.is_same_origin(&url("http://app.example/")));
    }

    #[test]
    fn test_request_ids_are_unique() {
        assert_ne!(RequestId::new(), RequestId::new());
        assert!(RequestId::new().to_string().starts_with("req-"));
    }

    #[test]
    fn test_response_status() {
        let target = url("https://app.example/a");
        let ok = Response::new(target.clone(), StatusCode::OK, HeaderMap::new(), Bytes::new());
        assert!(ok.ok());
        assert_eq!(ok.status_text, "OK");

        let missing = Response::new(
            target.clone(),
            StatusCode::NOT_FOUND,
            HeaderMap::new(),
            Bytes::new(),
        );
        assert!(!missing.ok());

        let error = Response::network_error(target);
        assert_eq!(error.status, 0);
        assert_eq!(error.response_type, ResponseType::Error);
        assert!(!error.ok());
    }

    #[test]
    fn test_clone_shares_body() {
        let response = Response::new(
            url("https://app.example/a"),
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::from_static(b"hello"),
        );
        let copy = response.clone();
        assert_eq!(copy.body().as_ptr(), response.body().as_ptr());
        assert_eq!(copy.text().unwrap(), "hello");
    }

    #[test]
    fn test_opaque_types() {
        assert!(ResponseType::Opaque.is_opaque());
        assert!(ResponseType::OpaqueRedirect.is_opaque());
        assert!(!ResponseType::Basic.is_opaque());
        assert!(!ResponseType::Error.is_opaque());
    }
}
