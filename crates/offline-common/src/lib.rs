//! # OfflineKit Common
//!
//! Common utilities, error types, and logging configuration shared by the
//! OfflineKit crates.
//!
//! ## Features
//!
//! - Unified error type with backtrace support
//! - Logging configuration and setup
//! - Timeout utilities for lifecycle work

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod time;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use time::with_timeout;

/// Unified error type for OfflineKit.
#[derive(Error, Debug)]
pub enum OfflineError {
    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Lifecycle work that ran past its deadline.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Internal error (unexpected).
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        backtrace: Option<backtrace::Backtrace>,
    },
}

impl OfflineError {
    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an internal error with backtrace.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            backtrace: Some(backtrace::Backtrace::new()),
        }
    }

    /// Get the error category for diagnostics.
    pub fn category(&self) -> &'static str {
        match self {
            OfflineError::Config { .. } => "config",
            OfflineError::Io(_) => "io",
            OfflineError::Timeout(_) => "timeout",
            OfflineError::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for OfflineKit operations.
pub type Result<T> = std::result::Result<T, OfflineError>;
