//! Control messages posted by client pages.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::install::add_all;
use crate::scope::WorkerScope;
use crate::tasks::DetachedTasks;
use crate::worker::WorkerContext;

/// A message a client page can post to the worker.
///
/// Wire format: `{"type": "SKIP_WAITING"}` and
/// `{"type": "CACHE_URLS", "urls": [...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    /// Activate the waiting worker now.
    SkipWaiting,
    /// Fetch these URLs into the runtime cache.
    CacheUrls { urls: Vec<String> },
}

impl ClientMessage {
    /// Parse a posted message; anything unrecognized yields `None`.
    pub fn parse(data: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(data.clone()).ok()
    }

    pub fn to_value(&self) -> serde_json::Value {
        // Serializing a plain tagged enum cannot fail.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Act on a message. Both kinds are fire-and-forget.
pub fn handle_message(
    ctx: &WorkerContext,
    tasks: &DetachedTasks,
    scope: &dyn WorkerScope,
    message: ClientMessage,
) {
    match message {
        ClientMessage::SkipWaiting => {
            info!("Skip waiting requested by client");
            scope.skip_waiting();
        }
        ClientMessage::CacheUrls { urls } => {
            let urls = same_origin_urls(ctx, &urls);
            if urls.is_empty() {
                debug!("CACHE_URLS carried nothing to cache");
                return;
            }

            let cache = ctx.config.runtime_name.clone();
            info!(cache = %cache, count = urls.len(), "Caching URLs on request");
            let ctx = ctx.clone();
            tasks.spawn("cache-urls", async move {
                add_all(&ctx, &cache, urls).await.map(|_| ())
            });
        }
    }
}

fn same_origin_urls(ctx: &WorkerContext, urls: &[String]) -> Vec<Url> {
    urls.iter()
        .filter_map(|raw| match ctx.resolve(raw) {
            Ok(url) if ctx.is_same_origin(&url) => Some(url),
            Ok(url) => {
                warn!(url = %url, "Refusing to cache cross-origin URL");
                None
            }
            Err(e) => {
                warn!(url = %raw, error = %e, "Skipping invalid URL");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheKey, CacheStorage};
    use crate::testing::{context, RecordingScope, StaticFetcher};
    use serde_json::json;
    use std::sync::Arc;

    const ORIGIN: &str = "https://app.example/";

    #[test]
    fn test_parse_skip_waiting() {
        assert_eq!(
            ClientMessage::parse(&json!({"type": "SKIP_WAITING"})),
            Some(ClientMessage::SkipWaiting)
        );
    }

    #[test]
    fn test_parse_cache_urls() {
        assert_eq!(
            ClientMessage::parse(&json!({"type": "CACHE_URLS", "urls": ["/a", "/b"]})),
            Some(ClientMessage::CacheUrls {
                urls: vec!["/a".to_string(), "/b".to_string()]
            })
        );
    }

    #[test]
    fn test_parse_ignores_unknown() {
        assert_eq!(ClientMessage::parse(&json!({"type": "PING"})), None);
        assert_eq!(ClientMessage::parse(&json!("SKIP_WAITING")), None);
        assert_eq!(ClientMessage::parse(&json!({"type": "CACHE_URLS"})), None);
    }

    #[test]
    fn test_to_value_matches_wire_format() {
        assert_eq!(
            ClientMessage::SkipWaiting.to_value(),
            json!({"type": "SKIP_WAITING"})
        );
    }

    #[tokio::test]
    async fn test_skip_waiting_reaches_scope() {
        let ctx = context(ORIGIN, &["/index.html"], Arc::new(StaticFetcher::new()));
        let tasks = DetachedTasks::new();
        let scope = RecordingScope::new();

        handle_message(&ctx, &tasks, &scope, ClientMessage::SkipWaiting);
        assert_eq!(scope.skip_waiting_calls(), 1);
    }

    #[tokio::test]
    async fn test_cache_urls_fills_runtime_cache() {
        let fetcher = Arc::new(
            StaticFetcher::new()
                .with_asset(ORIGIN, "/sc-a350.html", "a350")
                .with_asset(ORIGIN, "/sc-a359.html", "a359"),
        );
        let ctx = context(ORIGIN, &["/index.html"], fetcher.clone());
        let tasks = DetachedTasks::new();
        let scope = RecordingScope::new();

        handle_message(
            &ctx,
            &tasks,
            &scope,
            ClientMessage::CacheUrls {
                urls: vec![
                    "/sc-a350.html".to_string(),
                    "https://app.example/sc-a359.html".to_string(),
                    "https://cdn.example/font.woff2".to_string(),
                ],
            },
        );
        tasks.drain().await;

        let entries = ctx.storage.entries(&ctx.config.runtime_name).await.unwrap();
        assert_eq!(entries.len(), 2);
        let key = CacheKey::get(&ctx.resolve("/sc-a350.html").unwrap());
        assert!(entries.contains(&key));
        assert_eq!(fetcher.calls_for("https://cdn.example/font.woff2"), 0);
    }

    #[tokio::test]
    async fn test_cache_urls_failure_stores_nothing() {
        let fetcher = Arc::new(StaticFetcher::new().with_asset(ORIGIN, "/ok.html", "ok"));
        let ctx = context(ORIGIN, &["/index.html"], fetcher);
        let tasks = DetachedTasks::new();
        let scope = RecordingScope::new();

        handle_message(
            &ctx,
            &tasks,
            &scope,
            ClientMessage::CacheUrls {
                urls: vec!["/ok.html".to_string(), "/missing.html".to_string()],
            },
        );
        tasks.drain().await;

        let key = CacheKey::get(&ctx.resolve("/ok.html").unwrap());
        assert!(ctx
            .storage
            .match_entry(&ctx.config.runtime_name, &key)
            .await
            .unwrap()
            .is_none());
    }
}
