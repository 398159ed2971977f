//! # OfflineKit Service Worker
//!
//! The caching worker that makes a single-page app available offline.
//!
//! ## Features
//!
//! - **Install**: fill the precache generation from a fixed manifest
//! - **Activate**: delete stale cache generations, claim open pages
//! - **Fetch**: cache-first with network fallback and runtime caching
//! - **Messages**: `SKIP_WAITING` and `CACHE_URLS` from client pages
//! - **Container**: registration, update checks, and the worker lifecycle
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer
//!     │
//!     ├── ServiceWorkerRegistration (per scope)
//!     │       ├── installing ─┐
//!     │       ├── waiting    ─┼── ServiceWorker ── CachingWorker
//!     │       └── active     ─┘                        │
//!     │                                                ├── WorkerConfig (names, manifest)
//!     ├── Clients (controlled pages)                   ├── dyn CacheStorage
//!     └── dyn ScriptLoader                             └── dyn Fetcher
//!
//! CacheStorage
//!     ├── <app>-vX.Y          (precache)
//!     └── <app>-runtime-vX.Y  (runtime cache)
//!             └── CacheKey (METHOD + URL) → CacheEntry
//! ```

use offline_common::OfflineError;
use offline_net::NetError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

pub mod activate;
pub mod cache;
pub mod config;
pub mod container;
pub mod install;
pub mod message;
pub mod policy;
pub mod push;
pub mod scope;
pub mod tasks;
pub mod worker;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;


pub use activate::{handle_activate, ActivateReport};
pub use cache::{
    is_cacheable, Cache, CacheEntry, CacheError, CacheKey, CacheStorage, MemoryCacheStorage,
};
pub use config::{NotificationConfig, PrecacheManifest, WorkerConfig, DEFAULT_OFFLINE_FALLBACK};
pub use container::{
    Client, ClientMatchOptions, ClientType, Clients, MessageTarget, NetworkScriptLoader,
    RegistrationHandle, RegistrationInfo, RegistrationOptions, ScriptLoader, ServiceWorker,
    ServiceWorkerContainer, ServiceWorkerEvent, ServiceWorkerRegistration, StaticScriptLoader,
    UpdateOutcome, VisibilityState, WorkerInfo,
};
pub use install::{handle_install, InstallReport};
pub use message::{handle_message, ClientMessage};
pub use policy::{handle_fetch, FetchDecision, ResponseSource};
pub use push::{handle_push, handle_sync, NotificationOptions, SyncOutcome, SYNC_REPORTS_TAG};
pub use scope::WorkerScope;
pub use tasks::DetachedTasks;
pub use worker::{CachingWorker, EventOutcome, WorkerContext, WorkerEvent};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Script error: {0}")]
    ScriptError(String),

    #[error("Security error: {0}")]
    SecurityError(String),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Failed to add {url}: {reason}")]
    AddFailed { url: String, reason: String },

    #[error(transparent)]
    Common(#[from] OfflineError),
}

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ServiceWorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sw-{}", self.0)
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Initial state, script loaded.
    #[default]
    Parsed,
    /// Installing (install event).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Redundant (replaced or install failed).
    Redundant,
}

impl ServiceWorkerState {
    /// Check if this state allows fetch interception.
    pub fn can_intercept_fetch(&self) -> bool {
        matches!(self, Self::Activating | Self::Activated)
    }
}

impl std::fmt::Display for ServiceWorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Parsed => "parsed",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Activated => "activated",
            Self::Redundant => "redundant",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_ids_are_unique() {
        assert_ne!(ServiceWorkerId::new(), ServiceWorkerId::new());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ServiceWorkerState::Installed.to_string(), "installed");
        assert_eq!(ServiceWorkerState::default(), ServiceWorkerState::Parsed);
    }

    #[test]
    fn test_fetch_interception_states() {
        assert!(ServiceWorkerState::Activated.can_intercept_fetch());
        assert!(!ServiceWorkerState::Installed.can_intercept_fetch());
        assert!(!ServiceWorkerState::Redundant.can_intercept_fetch());
    }

    #[test]
    fn test_error_conversions() {
        let err: ServiceWorkerError = CacheError::NotFound("v1".to_string()).into();
        assert!(matches!(err, ServiceWorkerError::Cache(_)));

        let err: ServiceWorkerError = OfflineError::config("bad").into();
        assert_eq!(err.to_string(), "Config error: bad");
    }
}
