//! The caching worker: one running worker version and its event dispatch.

use std::sync::Arc;

use bytes::Bytes;
use offline_net::{Fetcher, NetError, Request};
use tracing::{debug, info};
use url::Url;

use crate::activate::{handle_activate, ActivateReport};
use crate::cache::{CacheKey, CacheStorage};
use crate::config::WorkerConfig;
use crate::install::{handle_install, InstallReport};
use crate::message::{handle_message, ClientMessage};
use crate::policy::{handle_fetch, FetchDecision};
use crate::push::{handle_push, handle_sync, SyncOutcome};
use crate::scope::WorkerScope;
use crate::tasks::DetachedTasks;
use crate::ServiceWorkerError;

/// Everything a lifecycle handler needs, passed explicitly.
#[derive(Clone)]
pub struct WorkerContext {
    base: Url,
    pub config: Arc<WorkerConfig>,
    pub storage: Arc<dyn CacheStorage>,
    pub fetcher: Arc<dyn Fetcher>,
}

impl WorkerContext {
    /// Create a context for a worker served from `origin`.
    pub fn new(
        origin: &Url,
        config: Arc<WorkerConfig>,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, ServiceWorkerError> {
        if !matches!(origin.scheme(), "http" | "https") {
            return Err(ServiceWorkerError::SecurityError(format!(
                "worker origin must be http(s): {origin}"
            )));
        }
        let base = origin
            .join("/")
            .map_err(|e| ServiceWorkerError::SecurityError(e.to_string()))?;

        Ok(Self {
            base,
            config,
            storage,
            fetcher,
        })
    }

    /// Root URL of the worker's origin.
    pub fn base(&self) -> &Url {
        &self.base
    }

    pub fn is_same_origin(&self, url: &Url) -> bool {
        url.origin() == self.base.origin()
    }

    /// Resolve a path (or absolute URL) against the origin.
    pub fn resolve(&self, path: &str) -> Result<Url, ServiceWorkerError> {
        self.base
            .join(path)
            .map_err(|e| ServiceWorkerError::ScriptError(format!("bad URL {path}: {e}")))
    }

    /// Cache key of the offline fallback document.
    pub fn offline_fallback_key(&self) -> Result<CacheKey, ServiceWorkerError> {
        Ok(CacheKey::get(&self.resolve(&self.config.offline_fallback)?))
    }
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("base", &self.base.as_str())
            .field("precache", &self.config.precache_name)
            .field("runtime", &self.config.runtime_name)
            .finish()
    }
}

/// Lifecycle and functional events delivered to a worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Install,
    Activate,
    Fetch(Request),
    Message(serde_json::Value),
    Push(Option<Bytes>),
    Sync(String),
}

/// Result of dispatching a [`WorkerEvent`].
#[derive(Debug)]
pub enum EventOutcome {
    Installed(InstallReport),
    Activated(ActivateReport),
    Fetch(FetchDecision),
    Synced(SyncOutcome),
    Handled,
}

/// A running caching worker.
pub struct CachingWorker {
    ctx: WorkerContext,
    scope: Arc<dyn WorkerScope>,
    tasks: DetachedTasks,
}

impl CachingWorker {
    pub fn new(ctx: WorkerContext, scope: Arc<dyn WorkerScope>) -> Self {
        Self {
            ctx,
            scope,
            tasks: DetachedTasks::new(),
        }
    }

    pub fn context(&self) -> &WorkerContext {
        &self.ctx
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.ctx.config
    }

    /// Install: fill the precache, then ask to skip waiting.
    pub async fn install(&self) -> Result<InstallReport, ServiceWorkerError> {
        let report = handle_install(&self.ctx).await?;
        if report.skip_waiting {
            self.scope.skip_waiting();
        }
        Ok(report)
    }

    /// Activate: drop stale generations, claim clients.
    pub async fn activate(&self) -> Result<ActivateReport, ServiceWorkerError> {
        handle_activate(&self.ctx, self.scope.as_ref()).await
    }

    /// Intercept a request.
    pub async fn fetch(&self, request: &Request) -> Result<FetchDecision, NetError> {
        handle_fetch(&self.ctx, &self.tasks, request).await
    }

    /// Handle a message posted by a client page. Unknown messages are ignored.
    pub fn message(&self, data: &serde_json::Value) {
        match ClientMessage::parse(data) {
            Some(message) => handle_message(&self.ctx, &self.tasks, self.scope.as_ref(), message),
            None => debug!(data = %data, "Ignoring unrecognized message"),
        }
    }

    pub async fn push(&self, payload: Option<Bytes>) -> Result<(), ServiceWorkerError> {
        handle_push(&self.ctx, self.scope.as_ref(), payload.as_deref()).await
    }

    pub async fn sync(&self, tag: &str) -> SyncOutcome {
        handle_sync(tag).await
    }

    /// Dispatch any event.
    pub async fn dispatch(&self, event: WorkerEvent) -> Result<EventOutcome, ServiceWorkerError> {
        match event {
            WorkerEvent::Install => self.install().await.map(EventOutcome::Installed),
            WorkerEvent::Activate => self.activate().await.map(EventOutcome::Activated),
            WorkerEvent::Fetch(request) => Ok(EventOutcome::Fetch(self.fetch(&request).await?)),
            WorkerEvent::Message(data) => {
                self.message(&data);
                Ok(EventOutcome::Handled)
            }
            WorkerEvent::Push(payload) => {
                self.push(payload).await?;
                Ok(EventOutcome::Handled)
            }
            WorkerEvent::Sync(tag) => Ok(EventOutcome::Synced(self.sync(&tag).await)),
        }
    }

    /// Number of background tasks still running.
    pub fn pending_tasks(&self) -> usize {
        self.tasks.pending()
    }

    /// Wait for all background work to settle.
    pub async fn wait_idle(&self) {
        self.tasks.drain().await;
        info!(cache = %self.ctx.config.runtime_name, "Background work settled");
    }
}

impl std::fmt::Debug for CachingWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingWorker")
            .field("ctx", &self.ctx)
            .field("pending_tasks", &self.tasks.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStorage;
    use crate::testing::{config, context, RecordingScope, StaticFetcher};

    const ORIGIN: &str = "https://app.example/";

    fn worker(fetcher: Arc<StaticFetcher>) -> (CachingWorker, Arc<RecordingScope>) {
        let scope = Arc::new(RecordingScope::new());
        let ctx = context(ORIGIN, &["/index.html", "/style.css"], fetcher);
        (CachingWorker::new(ctx, scope.clone()), scope)
    }

    fn shell() -> Arc<StaticFetcher> {
        Arc::new(
            StaticFetcher::new()
                .with_asset(ORIGIN, "/index.html", "<html>")
                .with_asset(ORIGIN, "/style.css", "body{}"),
        )
    }

    #[test]
    fn test_context_requires_network_origin() {
        let result = WorkerContext::new(
            &Url::parse("file:///srv/app/").unwrap(),
            Arc::new(config(&["/index.html"])),
            Arc::new(MemoryCacheStorage::new()),
            shell(),
        );
        assert!(matches!(result, Err(ServiceWorkerError::SecurityError(_))));
    }

    #[test]
    fn test_context_resolves_against_origin_root() {
        let ctx = context("https://app.example/nested/page", &["/index.html"], shell());
        assert_eq!(ctx.base().as_str(), ORIGIN);
        assert_eq!(
            ctx.offline_fallback_key().unwrap().url(),
            "https://app.example/index.html"
        );
        assert!(ctx.is_same_origin(&Url::parse("https://app.example/a.js").unwrap()));
        assert!(!ctx.is_same_origin(&Url::parse("https://cdn.example/a.js").unwrap()));
    }

    #[tokio::test]
    async fn test_dispatch_install_then_activate() {
        let (worker, scope) = worker(shell());

        let outcome = worker.dispatch(WorkerEvent::Install).await.unwrap();
        let EventOutcome::Installed(report) = outcome else {
            panic!("expected install report, got {outcome:?}");
        };
        assert_eq!(report.cached, 2);
        assert_eq!(scope.skip_waiting_calls(), 1);

        let outcome = worker.dispatch(WorkerEvent::Activate).await.unwrap();
        assert!(matches!(outcome, EventOutcome::Activated(ActivateReport { claimed: true, .. })));
        assert_eq!(scope.claims(), 1);
    }

    #[tokio::test]
    async fn test_failed_install_does_not_skip_waiting() {
        let fetcher = Arc::new(StaticFetcher::new().with_asset(ORIGIN, "/index.html", "<html>"));
        let (worker, scope) = worker(fetcher);

        let result = worker.dispatch(WorkerEvent::Install).await;
        assert!(matches!(result, Err(ServiceWorkerError::InstallFailed(_))));
        assert_eq!(scope.skip_waiting_calls(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_cross_origin_fetch_passes_through() {
        let fetcher = shell();
        let (worker, _) = worker(fetcher.clone());

        let request = Request::get(Url::parse("https://cdn.example/lib.js").unwrap());
        let outcome = worker.dispatch(WorkerEvent::Fetch(request)).await.unwrap();

        assert!(matches!(outcome, EventOutcome::Fetch(FetchDecision::Passthrough)));
        assert_eq!(fetcher.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_sync_and_unknown_message() {
        let fetcher = shell();
        let (worker, _) = worker(fetcher.clone());

        let outcome = worker
            .dispatch(WorkerEvent::Sync("sync-reports".to_string()))
            .await
            .unwrap();
        assert!(matches!(outcome, EventOutcome::Synced(SyncOutcome::Ran)));

        let outcome = worker
            .dispatch(WorkerEvent::Message(serde_json::json!({ "type": "PING" })))
            .await
            .unwrap();
        assert!(matches!(outcome, EventOutcome::Handled));

        worker.wait_idle().await;
        assert_eq!(worker.pending_tasks(), 0);
        assert_eq!(fetcher.total_calls(), 0);
    }
}
