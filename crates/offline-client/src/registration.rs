//! Worker registration and update checks for one page.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use offline_sw::{
    ClientMessage, MessageTarget, RegistrationHandle, RegistrationOptions, ServiceWorkerContainer,
    ServiceWorkerError, ServiceWorkerEvent, ServiceWorkerId, ServiceWorkerState, UpdateOutcome,
    VisibilityState,
};
use tokio::sync::{mpsc, watch, OnceCell};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use url::Url;

const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// The parts of `navigator.serviceWorker` a page uses.
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    async fn register(
        &self,
        script_url: &str,
        options: RegistrationOptions,
    ) -> Result<RegistrationHandle, ServiceWorkerError>;

    async fn update(&self, scope: &str) -> Result<UpdateOutcome, ServiceWorkerError>;

    async fn post_message(
        &self,
        scope: &str,
        target: MessageTarget,
        data: &serde_json::Value,
    ) -> Result<(), ServiceWorkerError>;

    async fn controller(&self, client_id: &str) -> Option<ServiceWorkerId>;
}

#[async_trait]
impl WorkerRegistry for ServiceWorkerContainer {
    async fn register(
        &self,
        script_url: &str,
        options: RegistrationOptions,
    ) -> Result<RegistrationHandle, ServiceWorkerError> {
        ServiceWorkerContainer::register(self, script_url, options).await
    }

    async fn update(&self, scope: &str) -> Result<UpdateOutcome, ServiceWorkerError> {
        ServiceWorkerContainer::update(self, scope).await
    }

    async fn post_message(
        &self,
        scope: &str,
        target: MessageTarget,
        data: &serde_json::Value,
    ) -> Result<(), ServiceWorkerError> {
        ServiceWorkerContainer::post_message(self, scope, target, data).await
    }

    async fn controller(&self, client_id: &str) -> Option<ServiceWorkerId> {
        ServiceWorkerContainer::controller(self, client_id).await
    }
}

/// User's answer to the "new version available" banner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateChoice {
    ReloadNow,
    Later,
}

/// Page UI used by the update flow.
#[async_trait]
pub trait UpdateUi: Send + Sync {
    /// Show the update banner and wait for the user's choice.
    async fn offer_update(&self) -> UpdateChoice;

    /// Reload the page.
    fn reload(&self);
}

/// Registration settings, relative to the page URL.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub script_url: String,
    pub scope: String,
    pub update_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            script_url: "/sw.js".to_string(),
            scope: "/".to_string(),
            update_interval: DEFAULT_UPDATE_INTERVAL,
        }
    }
}

/// Registers the worker for a page and drives update checks.
pub struct RegistrationController {
    registry: Arc<dyn WorkerRegistry>,
    ui: Arc<dyn UpdateUi>,
    config: ControllerConfig,
    page: Url,
    client_id: String,
    scope: OnceCell<String>,
    controller: Mutex<Option<ServiceWorkerId>>,
    controller_change_seen: Mutex<bool>,
}

impl RegistrationController {
    pub fn new(
        registry: Arc<dyn WorkerRegistry>,
        ui: Arc<dyn UpdateUi>,
        config: ControllerConfig,
        page: Url,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            ui,
            config,
            page,
            client_id: client_id.into(),
            scope: OnceCell::new(),
            controller: Mutex::new(None),
            controller_change_seen: Mutex::new(false),
        }
    }

    /// Register the worker script. Only the first successful call registers.
    pub async fn register(&self) -> Result<&str, ServiceWorkerError> {
        let scope = self
            .scope
            .get_or_try_init(|| async {
                let controller = self.registry.controller(&self.client_id).await;
                *self.controller.lock().unwrap_or_else(|e| e.into_inner()) = controller;

                let script_url = match self.page.join(&self.config.script_url) {
                    Ok(url) => url,
                    Err(e) => return Err(ServiceWorkerError::RegistrationFailed(e.to_string())),
                };
                let options = RegistrationOptions {
                    scope: Some(self.config.scope.clone()),
                };

                match self.registry.register(script_url.as_str(), options).await {
                    Ok(handle) => {
                        info!(scope = %handle.scope, "Service worker registered");
                        Ok(handle.scope)
                    }
                    Err(e) => {
                        error!(
                            script = %script_url,
                            error = %e,
                            "Service worker registration failed"
                        );
                        Err(e)
                    }
                }
            })
            .await?;
        Ok(scope.as_str())
    }

    /// Scope of the registration, once registered.
    pub fn scope(&self) -> Option<&str> {
        self.scope.get().map(String::as_str)
    }

    /// Worker controlling this page, as last observed.
    pub fn current_controller(&self) -> Option<ServiceWorkerId> {
        *self.controller.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ask the registration to look for a new script.
    pub async fn check_for_update(&self) {
        let Some(scope) = self.scope() else {
            debug!("Update check skipped; not registered");
            return;
        };
        match self.registry.update(scope).await {
            Ok(outcome) => debug!(scope = %scope, ?outcome, "Update check finished"),
            Err(e) => warn!(scope = %scope, error = %e, "Update check failed"),
        }
    }

    /// React to one container event.
    pub async fn on_event(&self, event: &ServiceWorkerEvent) {
        match event {
            ServiceWorkerEvent::StateChange {
                registration_scope,
                worker_id,
                new_state: ServiceWorkerState::Installed,
            } if self.scope() == Some(registration_scope.as_str()) => {
                let controlled_by_other = self
                    .current_controller()
                    .is_some_and(|current| current != *worker_id);
                if controlled_by_other {
                    info!(worker = %worker_id, "New version available");
                    self.offer_update(registration_scope).await;
                }
            }
            ServiceWorkerEvent::ControllerChange {
                client_id,
                worker_id,
            } if *client_id == self.client_id => {
                *self.controller.lock().unwrap_or_else(|e| e.into_inner()) = Some(*worker_id);
                let mut seen = self
                    .controller_change_seen
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                if !*seen {
                    *seen = true;
                    info!(worker = %worker_id, "New service worker activated");
                }
            }
            _ => {}
        }
    }

    async fn offer_update(&self, scope: &str) {
        match self.ui.offer_update().await {
            UpdateChoice::ReloadNow => {
                let message = ClientMessage::SkipWaiting.to_value();
                match self
                    .registry
                    .post_message(scope, MessageTarget::Waiting, &message)
                    .await
                {
                    Ok(()) => {}
                    Err(ServiceWorkerError::NotFound(_)) => {
                        debug!(scope = %scope, "New version already active")
                    }
                    Err(e) => warn!(scope = %scope, error = %e, "Could not activate new version"),
                }
                self.ui.reload();
            }
            UpdateChoice::Later => debug!("Update postponed"),
        }
    }

    /// Register, then check for updates on the interval and whenever the page
    /// becomes visible, until the event stream closes.
    pub async fn run(
        &self,
        mut events: mpsc::UnboundedReceiver<ServiceWorkerEvent>,
        mut visibility: watch::Receiver<VisibilityState>,
    ) -> Result<(), ServiceWorkerError> {
        self.register().await?;

        let period = self.config.update_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut watching_visibility = true;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.check_for_update().await,
                changed = visibility.changed(), if watching_visibility => {
                    if changed.is_err() {
                        watching_visibility = false;
                        continue;
                    }
                    let state = *visibility.borrow_and_update();
                    if state == VisibilityState::Visible {
                        self.check_for_update().await;
                    }
                }
                event = events.recv() => match event {
                    Some(event) => self.on_event(&event).await,
                    None => return Ok(()),
                },
            }
        }
    }
}

impl std::fmt::Debug for RegistrationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationController")
            .field("config", &self.config)
            .field("page", &self.page.as_str())
            .field("client_id", &self.client_id)
            .field("scope", &self.scope.get())
            .finish()
    }
}
