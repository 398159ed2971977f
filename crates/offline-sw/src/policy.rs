//! Fetch interception policy: cache-first, network fallback, runtime caching.

use http::Method;
use offline_net::{NetError, Request, Response};
use tracing::{debug, error, trace, warn};

use crate::cache::{is_cacheable, CacheEntry, CacheKey};
use crate::tasks::DetachedTasks;
use crate::worker::WorkerContext;
use crate::ServiceWorkerError;

/// What the worker does with an intercepted request.
#[derive(Debug, Clone)]
pub enum FetchDecision {
    /// Not intercepted; the platform handles the request as if no worker existed.
    Passthrough,
    /// Answer the page with this response.
    Respond {
        response: Response,
        source: ResponseSource,
    },
}

impl FetchDecision {
    /// The response, if the request was intercepted.
    pub fn response(&self) -> Option<&Response> {
        match self {
            Self::Passthrough => None,
            Self::Respond { response, .. } => Some(response),
        }
    }

    pub fn source(&self) -> Option<ResponseSource> {
        match self {
            Self::Passthrough => None,
            Self::Respond { source, .. } => Some(*source),
        }
    }
}

/// Where an intercepted response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Precache,
    RuntimeCache,
    Network,
    OfflineFallback,
}

/// Check if a request falls within the worker's interception scope.
pub fn should_intercept(ctx: &WorkerContext, request: &Request) -> bool {
    ctx.is_same_origin(&request.url) && matches!(request.url.scheme(), "http" | "https")
}

/// Handle an intercepted request.
///
/// A network failure with no cached offline document comes back as `Err`,
/// which the page sees exactly as it would with no worker installed.
pub async fn handle_fetch(
    ctx: &WorkerContext,
    tasks: &DetachedTasks,
    request: &Request,
) -> Result<FetchDecision, NetError> {
    if !should_intercept(ctx, request) {
        trace!(url = %request.url, "Not intercepting request");
        return Ok(FetchDecision::Passthrough);
    }

    let key = CacheKey::for_request(request);

    if let Some((response, source)) = lookup(ctx, &key).await {
        debug!(url = %request.url, ?source, "Serving from cache");
        return Ok(FetchDecision::Respond { response, source });
    }

    debug!(url = %request.url, "Fetching from network");
    match ctx.fetcher.fetch(request).await {
        Ok(response) => {
            if is_cacheable(&response) && request.method == Method::GET {
                store_runtime(ctx, tasks, key, &response);
            }
            Ok(FetchDecision::Respond {
                response,
                source: ResponseSource::Network,
            })
        }
        Err(e) => {
            error!(url = %request.url, error = %e, "Fetch failed");
            match offline_fallback(ctx).await {
                Some(response) => Ok(FetchDecision::Respond {
                    response,
                    source: ResponseSource::OfflineFallback,
                }),
                None => Err(e),
            }
        }
    }
}

/// Look the key up in the precache, then the runtime cache.
async fn lookup(ctx: &WorkerContext, key: &CacheKey) -> Option<(Response, ResponseSource)> {
    let generations = [
        (&ctx.config.precache_name, ResponseSource::Precache),
        (&ctx.config.runtime_name, ResponseSource::RuntimeCache),
    ];

    for (name, source) in generations {
        if let Some(response) = match_response(ctx, name, key).await {
            return Some((response, source));
        }
    }
    None
}

async fn match_response(ctx: &WorkerContext, cache: &str, key: &CacheKey) -> Option<Response> {
    let entry = match ctx.storage.match_entry(cache, key).await {
        Ok(entry) => entry?,
        Err(e) => {
            warn!(cache = %cache, key = %key, error = %e, "Cache lookup failed");
            return None;
        }
    };

    match entry.to_response() {
        Ok(response) => Some(response),
        Err(e) => {
            warn!(cache = %cache, key = %key, error = %e, "Discarding unreadable cache entry");
            None
        }
    }
}

/// Store a copy of `response` in the runtime cache without blocking the caller.
fn store_runtime(ctx: &WorkerContext, tasks: &DetachedTasks, key: CacheKey, response: &Response) {
    let entry = CacheEntry::from_response(&key, response);
    let storage = ctx.storage.clone();
    let cache = ctx.config.runtime_name.clone();

    tasks.spawn("runtime-cache", async move {
        storage.put(&cache, key, entry).await?;
        Ok::<_, ServiceWorkerError>(())
    });
}

async fn offline_fallback(ctx: &WorkerContext) -> Option<Response> {
    let key = match ctx.offline_fallback_key() {
        Ok(key) => key,
        Err(e) => {
            warn!(error = %e, "Invalid offline fallback path");
            return None;
        }
    };
    match_response(ctx, &ctx.config.precache_name, &key).await
}
