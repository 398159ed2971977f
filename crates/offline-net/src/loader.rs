//! Network loading.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, trace};

use crate::{NetError, Request, Response, ResponseType};

/// Something that can perform a network fetch.
///
/// An `Err` means the request never produced a response (the page would see
/// a rejected `fetch()`); HTTP error statuses come back as `Ok`.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}

/// Resource loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Accept-Language header.
    pub accept_language: String,
    /// Default timeout.
    pub default_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
    /// Enable cookies.
    pub cookies_enabled: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("OfflineKit/{}", env!("CARGO_PKG_VERSION")),
            accept_language: "en-US,en;q=0.9".to_string(),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
            cookies_enabled: true,
        }
    }
}

/// Resource loader for fetching URLs over HTTP(S).
pub struct ResourceLoader {
    client: Client,
    config: LoaderConfig,
}

impl ResourceLoader {
    /// Create a new resource loader.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .cookie_store(config.cookies_enabled)
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!("ResourceLoader initialized");

        Ok(Self { client, config })
    }

    /// Get the loader configuration.
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }
}

impl std::fmt::Debug for ResourceLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLoader")
            .field("config", &self.config)
            .finish()
    }
}

#[async_trait]
impl Fetcher for ResourceLoader {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        match request.url.scheme() {
            "http" | "https" => {}
            other => return Err(NetError::UnsupportedScheme(other.to_string())),
        }

        debug!(id = %request.id, url = %request.url, method = %request.method, "Fetching resource");

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            req_builder = req_builder.header(name, value);
        }

        req_builder = req_builder.header("Accept-Language", &self.config.accept_language);

        if let Some(ref referrer) = request.referrer {
            req_builder = req_builder.header("Referer", referrer.as_str());
        }

        if let Some(ref body) = request.body {
            req_builder = req_builder.body(body.clone());
        }

        if let Some(timeout) = request.timeout {
            req_builder = req_builder.timeout(timeout);
        }

        let response = req_builder.send().await?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();

        let response_type = if request.is_same_origin(&url) {
            ResponseType::Basic
        } else {
            ResponseType::Cors
        };

        let body = response.bytes().await?;

        trace!(
            url = %url,
            status = %status,
            body_len = body.len(),
            "Response received"
        );

        Ok(Response::new(url, status, headers, body).with_type(response_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_loader_config_default() {
        let config = LoaderConfig::default();
        assert!(config.user_agent.starts_with("OfflineKit/"));
        assert!(config.cookies_enabled);
        assert_eq!(config.max_redirects, 10);
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/style.css"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw("body{}", "text/css"),
            )
            .mount(&server)
            .await;

        let loader = ResourceLoader::new(LoaderConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/style.css", server.uri())).unwrap();
        let response = loader.fetch(&Request::get(url)).await.unwrap();

        assert_eq!(response.status, 200);
        assert!(response.ok());
        assert_eq!(response.response_type, ResponseType::Basic);
        assert_eq!(response.header("content-type"), Some("text/css"));
        assert_eq!(response.text().unwrap(), "body{}");
    }

    #[tokio::test]
    async fn test_fetch_error_status_is_ok_result() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let loader = ResourceLoader::new(LoaderConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/missing", server.uri())).unwrap();
        let response = loader.fetch(&Request::get(url)).await.unwrap();

        assert_eq!(response.status, 404);
        assert!(!response.ok());
    }

    #[tokio::test]
    async fn test_fetch_unsupported_scheme() {
        let loader = ResourceLoader::new(LoaderConfig::default()).unwrap();
        let url = Url::parse("chrome-extension://abc/page.html").unwrap();
        let result = loader.fetch(&Request::get(url)).await;
        assert!(matches!(result, Err(NetError::UnsupportedScheme(_))));
    }
}
