//! Install handler: fill the precache generation.

use futures::future::try_join_all;
use offline_net::{Fetcher, Request};
use tracing::{debug, error, info};
use url::Url;

use crate::cache::{is_cacheable, CacheEntry, CacheKey};
use crate::worker::WorkerContext;
use crate::ServiceWorkerError;

/// Outcome of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    /// Precache generation that was filled.
    pub cache: String,
    /// Number of manifest entries stored.
    pub cached: usize,
    /// Whether the worker asks to replace the active one immediately.
    pub skip_waiting: bool,
}

/// Fetch every manifest URL and store it in the precache.
///
/// All fetches finish before anything is stored, so a failed fetch leaves the
/// precache untouched. Any failure fails the whole install; nothing retries.
pub async fn handle_install(ctx: &WorkerContext) -> Result<InstallReport, ServiceWorkerError> {
    let cache = ctx.config.precache_name.clone();
    info!(cache = %cache, "Installing caching worker");

    match precache(ctx, &cache).await {
        Ok(cached) => {
            info!(cache = %cache, cached, "Installation complete");
            Ok(InstallReport {
                cache,
                cached,
                skip_waiting: true,
            })
        }
        Err(e) => {
            error!(cache = %cache, error = %e, "Installation failed");
            Err(ServiceWorkerError::InstallFailed(e.to_string()))
        }
    }
}

async fn precache(ctx: &WorkerContext, cache: &str) -> Result<usize, ServiceWorkerError> {
    ctx.storage.open(cache).await?;
    let urls = ctx.config.manifest.resolve(ctx.base())?;
    debug!(cache = %cache, count = urls.len(), "Caching app shell");
    add_all(ctx, cache, urls).await
}

/// Fetch `urls` and store them all in `cache`, or store none (`cache.addAll`).
pub(crate) async fn add_all(
    ctx: &WorkerContext,
    cache: &str,
    urls: Vec<Url>,
) -> Result<usize, ServiceWorkerError> {
    let fetcher = ctx.fetcher.as_ref();
    let entries = try_join_all(urls.iter().map(|url| fetch_entry(fetcher, url))).await?;
    let count = entries.len();
    ctx.storage.put_all(cache, entries).await?;
    Ok(count)
}

async fn fetch_entry(
    fetcher: &dyn Fetcher,
    url: &Url,
) -> Result<(CacheKey, CacheEntry), ServiceWorkerError> {
    let request = Request::get(url.clone());
    let response = fetcher
        .fetch(&request)
        .await
        .map_err(|e| ServiceWorkerError::AddFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    if !is_cacheable(&response) {
        return Err(ServiceWorkerError::AddFailed {
            url: url.to_string(),
            reason: format!("unexpected status {}", response.status),
        });
    }

    let key = CacheKey::for_request(&request);
    let entry = CacheEntry::from_response(&key, &response);
    Ok((key, entry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context, StaticFetcher};
    use std::sync::Arc;

    const ORIGIN: &str = "https://app.example/";

    #[tokio::test]
    async fn test_install_caches_every_manifest_url() {
        let fetcher = Arc::new(
            StaticFetcher::new()
                .with_asset(ORIGIN, "/index.html", "<html>app</html>")
                .with_asset(ORIGIN, "/style.css", "body{}"),
        );
        let ctx = context(ORIGIN, &["/index.html", "/style.css"], fetcher);

        let report = handle_install(&ctx).await.unwrap();
        assert_eq!(report.cached, 2);
        assert!(report.skip_waiting);

        for path in ["/index.html", "/style.css"] {
            let key = CacheKey::get(&ctx.resolve(path).unwrap());
            let entry = ctx
                .storage
                .match_entry(&ctx.config.precache_name, &key)
                .await
                .unwrap();
            assert!(entry.is_some(), "{path} should be precached");
        }
    }

    #[tokio::test]
    async fn test_install_fails_on_missing_asset() {
        let fetcher = Arc::new(StaticFetcher::new().with_asset(ORIGIN, "/index.html", "<html/>"));
        let ctx = context(ORIGIN, &["/index.html", "/style.css"], fetcher);

        let err = handle_install(&ctx).await.unwrap_err();
        assert!(matches!(err, ServiceWorkerError::InstallFailed(_)));
        assert!(err.to_string().contains("style.css"));

        // Nothing was committed.
        let key = CacheKey::get(&ctx.resolve("/index.html").unwrap());
        assert!(ctx
            .storage
            .match_entry(&ctx.config.precache_name, &key)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_install_fails_when_offline() {
        let fetcher = Arc::new(
            StaticFetcher::new()
                .with_asset(ORIGIN, "/index.html", "<html/>")
                .with_asset(ORIGIN, "/style.css", "body{}"),
        );
        fetcher.set_offline(true);
        let ctx = context(ORIGIN, &["/index.html", "/style.css"], fetcher);

        assert!(matches!(
            handle_install(&ctx).await,
            Err(ServiceWorkerError::InstallFailed(_))
        ));
    }
}
