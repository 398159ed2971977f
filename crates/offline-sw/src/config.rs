//! Worker configuration.
//!
//! A worker's configuration is what its script would otherwise hold as
//! top-level constants: the two current cache generation names, the precache
//! manifest, and the offline fallback document. It is fixed when the worker
//! starts and never mutated afterwards.

use offline_common::{OfflineError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::ServiceWorkerError;

/// Default offline fallback document.
pub const DEFAULT_OFFLINE_FALLBACK: &str = "/index.html";

const DEFAULT_LIFECYCLE_TIMEOUT_SECS: u64 = 300;

/// Ordered list of root-relative paths fetched at install time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrecacheManifest(Vec<String>);

impl PrecacheManifest {
    /// Create a manifest from a list of paths.
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(paths.into_iter().map(Into::into).collect())
    }

    pub fn paths(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.0.iter().any(|p| p == path)
    }

    /// Resolve every path against the worker's base URL.
    pub fn resolve(&self, base: &Url) -> std::result::Result<Vec<Url>, ServiceWorkerError> {
        self.0
            .iter()
            .map(|path| {
                base.join(path).map_err(|e| {
                    ServiceWorkerError::ScriptError(format!("bad manifest path {path}: {e}"))
                })
            })
            .collect()
    }
}

/// Notification defaults used by the push handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            icon: "/icon-192.png".to_string(),
            badge: "/icon-72.png".to_string(),
            vibrate: vec![200, 100, 200],
        }
    }
}

/// Immutable configuration of one worker version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Display name used in notifications.
    pub app_name: String,

    /// Current precache generation name.
    pub precache_name: String,

    /// Current runtime cache generation name.
    pub runtime_name: String,

    /// Paths fetched into the precache at install time.
    pub manifest: PrecacheManifest,

    /// Document served when the network fails.
    #[serde(default = "default_offline_fallback")]
    pub offline_fallback: String,

    #[serde(default)]
    pub notification: NotificationConfig,

    /// Upper bound on install and activate work, in seconds.
    #[serde(default = "default_lifecycle_timeout_secs")]
    pub lifecycle_timeout_secs: u64,
}

fn default_offline_fallback() -> String {
    DEFAULT_OFFLINE_FALLBACK.to_string()
}

fn default_lifecycle_timeout_secs() -> u64 {
    DEFAULT_LIFECYCLE_TIMEOUT_SECS
}

impl WorkerConfig {
    /// Build a configuration with `<slug>-v<version>` and
    /// `<slug>-runtime-v<version>` generation names.
    pub fn versioned(slug: &str, version: &str, manifest: PrecacheManifest) -> Self {
        Self {
            app_name: slug.to_string(),
            precache_name: format!("{slug}-v{version}"),
            runtime_name: format!("{slug}-runtime-v{version}"),
            manifest,
            offline_fallback: default_offline_fallback(),
            notification: NotificationConfig::default(),
            lifecycle_timeout_secs: DEFAULT_LIFECYCLE_TIMEOUT_SECS,
        }
    }

    /// Set the display name.
    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    /// Set the offline fallback document.
    pub fn with_offline_fallback(mut self, path: impl Into<String>) -> Self {
        self.offline_fallback = path.into();
        self
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        Self::from_slice(json.as_bytes())
    }

    /// Parse and validate a JSON configuration from raw bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let config: Self = serde_json::from_slice(bytes)
            .map_err(|e| OfflineError::config_with_source("invalid worker config", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration invariants.
    pub fn validate(&self) -> Result<()> {
        if self.precache_name.is_empty() || self.runtime_name.is_empty() {
            return Err(OfflineError::config("cache names must not be empty"));
        }
        if self.precache_name == self.runtime_name {
            return Err(OfflineError::config(format!(
                "precache and runtime cache share the name {}",
                self.precache_name
            )));
        }
        if let Some(path) = self.manifest.paths().iter().find(|p| !p.starts_with('/')) {
            return Err(OfflineError::config(format!(
                "manifest path {path} is not root-relative"
            )));
        }
        if !self.manifest.contains(&self.offline_fallback) {
            return Err(OfflineError::config(format!(
                "manifest does not include the offline fallback {}",
                self.offline_fallback
            )));
        }
        if self.lifecycle_timeout_secs == 0 {
            return Err(OfflineError::config("lifecycle timeout must be positive"));
        }
        Ok(())
    }

    /// Check if a generation name is one of the two current ones.
    pub fn is_current_generation(&self, name: &str) -> bool {
        name == self.precache_name || name == self.runtime_name
    }

    pub fn lifecycle_timeout(&self) -> Duration {
        Duration::from_secs(self.lifecycle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> PrecacheManifest {
        PrecacheManifest::new(["/index.html", "/style.css"])
    }

    #[test]
    fn test_versioned_names() {
        let config = WorkerConfig::versioned("bpm-pro", "4.0", manifest());
        assert_eq!(config.precache_name, "bpm-pro-v4.0");
        assert_eq!(config.runtime_name, "bpm-pro-runtime-v4.0");
        assert!(config.is_current_generation("bpm-pro-v4.0"));
        assert!(config.is_current_generation("bpm-pro-runtime-v4.0"));
        assert!(!config.is_current_generation("bpm-pro-v3.9"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_applies_defaults() {
        let config = WorkerConfig::from_json(
            r#"{
                "app_name": "BPM Pro",
                "precache_name": "bpm-pro-v4.0",
                "runtime_name": "bpm-pro-runtime-v4.0",
                "manifest": ["/index.html", "/style.css", "/manifest.json"]
            }"#,
        )
        .unwrap();

        assert_eq!(config.offline_fallback, "/index.html");
        assert_eq!(config.manifest.len(), 3);
        assert_eq!(config.notification.vibrate, vec![200, 100, 200]);
        assert_eq!(config.lifecycle_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_validate_rejects_missing_fallback() {
        let config = WorkerConfig::versioned("app", "1", PrecacheManifest::new(["/style.css"]));
        let err = config.validate().unwrap_err();
        assert_eq!(err.category(), "config");
    }

    #[test]
    fn test_validate_rejects_shared_names() {
        let mut config = WorkerConfig::versioned("app", "1", manifest());
        config.runtime_name = config.precache_name.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_relative_paths() {
        let config = WorkerConfig::versioned(
            "app",
            "1",
            PrecacheManifest::new(["/index.html", "style.css"]),
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(WorkerConfig::from_json("{not json").is_err());
    }

    #[test]
    fn test_manifest_resolve() {
        let base = Url::parse("https://app.example/").unwrap();
        let urls = manifest().resolve(&base).unwrap();
        assert_eq!(urls[0].as_str(), "https://app.example/index.html");
        assert_eq!(urls[1].as_str(), "https://app.example/style.css");
    }
}
