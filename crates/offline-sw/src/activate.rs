//! Activate handler: garbage-collect stale generations and claim clients.

use futures::future::join_all;
use tracing::{error, info, warn};

use crate::scope::WorkerScope;
use crate::worker::WorkerContext;
use crate::ServiceWorkerError;

/// Outcome of an activation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivateReport {
    /// Stale generations that were deleted.
    pub deleted: Vec<String>,
    /// Stale generations whose deletion failed, with the reason.
    pub failed: Vec<(String, String)>,
    /// Whether open clients were claimed.
    pub claimed: bool,
}

/// Delete every generation except the current two, then claim clients.
///
/// Deletion is best effort per generation: a failure is logged and recorded
/// but neither stops the other deletions nor the claim.
pub async fn handle_activate(
    ctx: &WorkerContext,
    scope: &dyn WorkerScope,
) -> Result<ActivateReport, ServiceWorkerError> {
    info!(
        precache = %ctx.config.precache_name,
        runtime = %ctx.config.runtime_name,
        "Activating caching worker"
    );

    let mut report = ActivateReport::default();

    match ctx.storage.keys().await {
        Ok(names) => {
            let stale: Vec<String> = names
                .into_iter()
                .filter(|name| !ctx.config.is_current_generation(name))
                .collect();

            let results = join_all(stale.iter().map(|name| async move {
                info!(cache = %name, "Deleting old cache");
                (name, ctx.storage.delete(name).await)
            }))
            .await;

            for (name, result) in results {
                match result {
                    Ok(_) => report.deleted.push(name.clone()),
                    Err(e) => {
                        warn!(cache = %name, error = %e, "Failed to delete old cache");
                        report.failed.push((name.clone(), e.to_string()));
                    }
                }
            }
        }
        Err(e) => error!(error = %e, "Could not list caches; skipping cleanup"),
    }

    scope.claim_clients()?;
    report.claimed = true;

    info!(
        deleted = report.deleted.len(),
        failed = report.failed.len(),
        "Activation complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheError, CacheStorage, MemoryCacheStorage};
    use crate::testing::{context_with_storage, FlakyStorage, RecordingScope, StaticFetcher};
    use std::sync::Arc;

    const ORIGIN: &str = "https://app.example/";

    #[tokio::test]
    async fn test_activate_keeps_only_current_generations() {
        let storage = Arc::new(MemoryCacheStorage::new());
        for name in ["app-v0", "app-runtime-v0", "app-v1", "app-runtime-v1", "unrelated"] {
            storage.open(name).await.unwrap();
        }
        let ctx = context_with_storage(
            ORIGIN,
            &["/index.html"],
            Arc::new(StaticFetcher::new()),
            storage.clone(),
        );
        let scope = RecordingScope::new();

        let report = handle_activate(&ctx, &scope).await.unwrap();

        assert_eq!(storage.keys().await.unwrap(), vec!["app-runtime-v1", "app-v1"]);
        assert_eq!(report.deleted.len(), 3);
        assert!(report.failed.is_empty());
        assert!(report.claimed);
        assert_eq!(scope.claims(), 1);
    }

    #[tokio::test]
    async fn test_delete_failure_does_not_block_others_or_claim() {
        let storage = Arc::new(FlakyStorage::new(["app-v0"]));
        for name in ["app-v0", "old-a", "old-b", "app-v1"] {
            storage.open(name).await.unwrap();
        }
        let ctx = context_with_storage(
            ORIGIN,
            &["/index.html"],
            Arc::new(StaticFetcher::new()),
            storage.clone(),
        );
        let scope = RecordingScope::new();

        let report = handle_activate(&ctx, &scope).await.unwrap();

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "app-v0");
        assert_eq!(
            report.failed[0].1,
            CacheError::Storage("delete refused".to_string()).to_string()
        );
        assert!(report.deleted.contains(&"old-a".to_string()));
        assert!(report.deleted.contains(&"old-b".to_string()));
        assert_eq!(scope.claims(), 1);
        assert_eq!(storage.keys().await.unwrap(), vec!["app-v0", "app-v1"]);
    }

    #[tokio::test]
    async fn test_claim_failure_is_reported() {
        let ctx = context_with_storage(
            ORIGIN,
            &["/index.html"],
            Arc::new(StaticFetcher::new()),
            Arc::new(MemoryCacheStorage::new()),
        );
        let scope = RecordingScope::new();
        scope.fail_claims(true);

        assert!(handle_activate(&ctx, &scope).await.is_err());
    }
}
