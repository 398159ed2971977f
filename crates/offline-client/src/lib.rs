//! # OfflineKit Client
//!
//! Page-side glue around the caching worker.
//!
//! - [`RegistrationController`]: registers the worker once per page load,
//!   checks for updates hourly and when the page becomes visible, and offers
//!   a reload when a new version installs under a controlled page.
//! - [`InstallPromptController`]: captures the platform install prompt and
//!   replays it from the page's own install button.
//! - [`ConnectivityIndicator`]: the online/offline badge.
//!
//! All UI is reached through small traits so the controllers run headless.

pub mod install_prompt;
pub mod registration;
pub mod status;

pub use install_prompt::{
    InstallButton, InstallPromptController, InstallPromptEvent, PromptError, PromptState,
    UserChoice,
};
pub use registration::{
    ControllerConfig, RegistrationController, UpdateChoice, UpdateUi, WorkerRegistry,
};
pub use status::{Connectivity, ConnectivityIndicator, StatusBadge};
