//! Registration and lifecycle host (`navigator.serviceWorker`).
//!
//! The container owns registrations, the pages they control, and the worker
//! versions moving through `installing -> waiting -> active`. Handlers run on
//! [`CachingWorker`]; the container only sequences them and moves control.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hashbrown::HashMap;
use offline_common::{with_timeout, OfflineError};
use offline_net::{Fetcher, Request};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::config::WorkerConfig;
use crate::policy::FetchDecision;
use crate::push::{NotificationOptions, SyncOutcome};
use crate::scope::WorkerScope;
use crate::worker::{CachingWorker, WorkerContext};
use crate::{ServiceWorkerError, ServiceWorkerId, ServiceWorkerState};

// ==================== Script Loading ====================

/// Loads the worker "script": the JSON configuration served at its URL.
#[async_trait]
pub trait ScriptLoader: Send + Sync {
    async fn load(&self, script_url: &Url) -> Result<WorkerConfig, ServiceWorkerError>;
}

/// Script loader that fetches the script over the network.
pub struct NetworkScriptLoader {
    fetcher: Arc<dyn Fetcher>,
}

impl NetworkScriptLoader {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl ScriptLoader for NetworkScriptLoader {
    async fn load(&self, script_url: &Url) -> Result<WorkerConfig, ServiceWorkerError> {
        debug!(url = %script_url, "Loading worker script");
        let response = self.fetcher.fetch(&Request::get(script_url.clone())).await?;
        if !response.ok() {
            return Err(ServiceWorkerError::ScriptError(format!(
                "{script_url} returned status {}",
                response.status
            )));
        }
        Ok(WorkerConfig::from_slice(response.body())?)
    }
}

/// Script loader serving configurations registered in memory.
#[derive(Debug, Default)]
pub struct StaticScriptLoader {
    scripts: std::sync::RwLock<HashMap<String, WorkerConfig>>,
}

impl StaticScriptLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `config` at `script_url`.
    pub fn with_script(self, script_url: &str, config: WorkerConfig) -> Self {
        self.set(script_url, config);
        self
    }

    /// Replace the script served at `script_url`.
    pub fn set(&self, script_url: &str, config: WorkerConfig) {
        self.scripts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(script_url.to_string(), config);
    }
}

#[async_trait]
impl ScriptLoader for StaticScriptLoader {
    async fn load(&self, script_url: &Url) -> Result<WorkerConfig, ServiceWorkerError> {
        let config = self
            .scripts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(script_url.as_str())
            .cloned()
            .ok_or_else(|| ServiceWorkerError::NotFound(script_url.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

// ==================== Global Scope ====================

/// The host side of a worker's `self`.
#[derive(Debug)]
struct GlobalScope {
    skip_waiting: AtomicBool,
    claim_requested: AtomicBool,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl GlobalScope {
    fn new(event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>) -> Self {
        Self {
            skip_waiting: AtomicBool::new(false),
            claim_requested: AtomicBool::new(false),
            event_tx,
        }
    }

    fn wants_skip_waiting(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    fn take_claim(&self) -> bool {
        self.claim_requested.swap(false, Ordering::SeqCst)
    }
}

impl WorkerScope for GlobalScope {
    fn skip_waiting(&self) {
        self.skip_waiting.store(true, Ordering::SeqCst);
    }

    fn claim_clients(&self) -> Result<(), ServiceWorkerError> {
        self.claim_requested.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn show_notification(
        &self,
        title: &str,
        options: NotificationOptions,
    ) -> Result<(), ServiceWorkerError> {
        let _ = self.event_tx.send(ServiceWorkerEvent::Notification {
            title: title.to_string(),
            options,
        });
        Ok(())
    }
}

// ==================== Service Worker ====================

/// One worker version known to a registration.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Script URL.
    pub script_url: Url,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Error message if install failed.
    pub error: Option<String>,

    /// Time of last state change.
    pub state_changed_at: Instant,

    config: Arc<WorkerConfig>,
    runtime: Arc<CachingWorker>,
    global: Arc<GlobalScope>,
}

impl ServiceWorker {
    /// Set state.
    pub fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    /// Check if redundant.
    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// The running worker behind this version.
    pub fn runtime(&self) -> &CachingWorker {
        &self.runtime
    }

    /// Post message to worker.
    pub fn post_message(&self, data: &serde_json::Value) -> Result<(), ServiceWorkerError> {
        if self.is_redundant() {
            return Err(ServiceWorkerError::StateError(
                "Cannot post message to redundant worker".to_string(),
            ));
        }
        self.runtime.message(data);
        Ok(())
    }

    fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.id,
            state: self.state,
            precache_name: self.config.precache_name.clone(),
        }
    }
}

// ==================== Registration ====================

/// Options for service worker registration.
#[derive(Debug, Clone, Default)]
pub struct RegistrationOptions {
    /// Scope, resolved against the script URL. Defaults to the script's directory.
    pub scope: Option<String>,
}

/// A service worker registration.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    /// Script URL.
    pub script_url: Url,

    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorker>,

    /// Active worker.
    pub active: Option<ServiceWorker>,

    /// Last update check time.
    pub last_update_check: Option<Instant>,
}

impl ServiceWorkerRegistration {
    /// Create a new registration.
    pub fn new(scope: Url, script_url: Url) -> Self {
        Self {
            scope,
            script_url,
            installing: None,
            waiting: None,
            active: None,
            last_update_check: None,
        }
    }

    /// Get the active worker.
    pub fn get_active(&self) -> Option<&ServiceWorker> {
        self.active.as_ref()
    }

    /// Check if update is needed.
    pub fn needs_update(&self, check_interval: Duration) -> bool {
        match self.last_update_check {
            Some(last) => last.elapsed() > check_interval,
            None => true,
        }
    }

    /// Check if `url` is inside this registration's scope.
    pub fn covers(&self, url: &Url) -> bool {
        url.as_str().starts_with(self.scope.as_str())
    }

    /// Configuration of the newest installed version.
    fn newest_config(&self) -> Option<Arc<WorkerConfig>> {
        self.waiting
            .as_ref()
            .or(self.active.as_ref())
            .map(|worker| worker.config.clone())
    }

    fn worker_mut(&mut self, id: ServiceWorkerId) -> Option<&mut ServiceWorker> {
        [&mut self.installing, &mut self.waiting, &mut self.active]
            .into_iter()
            .flatten()
            .find(|worker| worker.id == id)
    }

    /// Unregister (mark every version redundant).
    pub fn unregister(&mut self) {
        for slot in [&mut self.installing, &mut self.waiting, &mut self.active] {
            if let Some(mut worker) = slot.take() {
                worker.set_state(ServiceWorkerState::Redundant);
            }
        }
    }

    fn info(&self) -> RegistrationInfo {
        RegistrationInfo {
            scope: self.scope.to_string(),
            script_url: self.script_url.to_string(),
            installing: self.installing.as_ref().map(ServiceWorker::info),
            waiting: self.waiting.as_ref().map(ServiceWorker::info),
            active: self.active.as_ref().map(ServiceWorker::info),
        }
    }
}

/// Snapshot of a worker version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerInfo {
    pub id: ServiceWorkerId,
    pub state: ServiceWorkerState,
    pub precache_name: String,
}

/// Snapshot of a registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrationInfo {
    pub scope: String,
    pub script_url: String,
    pub installing: Option<WorkerInfo>,
    pub waiting: Option<WorkerInfo>,
    pub active: Option<WorkerInfo>,
}

/// Result of [`ServiceWorkerContainer::register`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationHandle {
    pub scope: String,
    pub script_url: Url,
    pub outcome: UpdateOutcome,
}

/// Result of an update check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The script is unchanged.
    UpToDate,
    /// A new version installed and is waiting.
    Waiting(ServiceWorkerId),
    /// A new version installed and took over.
    Activated(ServiceWorkerId),
}

/// Which worker of a registration a message goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTarget {
    Active,
    Waiting,
}

// ==================== Clients ====================

/// A client (open page).
#[derive(Debug, Clone)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Client URL.
    pub url: Url,

    /// Client type.
    pub client_type: ClientType,

    /// Visibility state.
    pub visibility_state: VisibilityState,

    /// Whether focused.
    pub focused: bool,

    /// Worker controlling this client.
    pub controller: Option<ServiceWorkerId>,
}

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    SharedWorker,
    All,
}

/// Visibility state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityState {
    Hidden,
    Visible,
}

/// Options for `clients.matchAll()`.
#[derive(Debug, Clone, Default)]
pub struct ClientMatchOptions {
    pub include_uncontrolled: bool,
    pub client_type: ClientType,
}

/// Clients API.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Match all clients.
    pub fn match_all(&self, options: &ClientMatchOptions) -> Vec<&Client> {
        self.clients
            .values()
            .filter(|c| options.include_uncontrolled || c.controller.is_some())
            .filter(|c| match options.client_type {
                ClientType::All => true,
                t => c.client_type == t,
            })
            .collect()
    }

    /// Open a window client.
    pub fn open_window(&mut self, url: &str) -> Result<Client, ServiceWorkerError> {
        let url = Url::parse(url).map_err(|e| ServiceWorkerError::StateError(e.to_string()))?;

        let id = format!("client-{}", uuid_simple());
        let client = Client {
            id: id.clone(),
            url,
            client_type: ClientType::Window,
            visibility_state: VisibilityState::Visible,
            focused: true,
            controller: None,
        };

        self.clients.insert(id, client.clone());
        Ok(client)
    }

    /// Make `worker` the controller of every client inside `scope`.
    ///
    /// Returns the IDs of clients whose controller changed.
    pub fn claim(&mut self, scope: &Url, worker: ServiceWorkerId) -> Vec<String> {
        self.clients
            .values_mut()
            .filter(|c| c.url.as_str().starts_with(scope.as_str()))
            .filter(|c| c.controller != Some(worker))
            .map(|c| {
                c.controller = Some(worker);
                c.id.clone()
            })
            .collect()
    }

    /// Move clients controlled by `old` to `new`.
    pub fn replace_controller(
        &mut self,
        old: ServiceWorkerId,
        new: ServiceWorkerId,
    ) -> Vec<String> {
        self.clients
            .values_mut()
            .filter(|c| c.controller == Some(old))
            .map(|c| {
                c.controller = Some(new);
                c.id.clone()
            })
            .collect()
    }

    /// Add a client.
    pub fn add(&mut self, client: Client) {
        self.clients.insert(client.id.clone(), client);
    }

    /// Remove a client.
    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }
}

// ==================== Service Worker Container ====================

/// Service worker events.
#[derive(Debug, Clone)]
pub enum ServiceWorkerEvent {
    /// State changed.
    StateChange {
        registration_scope: String,
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// A new version started installing.
    UpdateFound { registration_scope: String },
    /// Controller changed.
    ControllerChange {
        client_id: String,
        worker_id: ServiceWorkerId,
    },
    /// A worker asked to show a notification.
    Notification {
        title: String,
        options: NotificationOptions,
    },
}

/// Service worker container (navigator.serviceWorker).
pub struct ServiceWorkerContainer {
    /// Registrations by scope.
    registrations: Arc<RwLock<HashMap<String, ServiceWorkerRegistration>>>,

    /// Cache storage shared by every worker version.
    caches: Arc<dyn CacheStorage>,

    /// Clients.
    clients: Arc<RwLock<Clients>>,

    fetcher: Arc<dyn Fetcher>,
    scripts: Arc<dyn ScriptLoader>,

    /// Event sender for state changes.
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerContainer {
    /// Create a new container.
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        scripts: Arc<dyn ScriptLoader>,
        caches: Arc<dyn CacheStorage>,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                registrations: Arc::new(RwLock::new(HashMap::new())),
                caches,
                clients: Arc::new(RwLock::new(Clients::new())),
                fetcher,
                scripts,
                event_tx,
            },
            event_rx,
        )
    }

    /// Cache storage shared by the workers.
    pub fn caches(&self) -> Arc<dyn CacheStorage> {
        self.caches.clone()
    }

    /// Register a worker script and run the first update check.
    pub async fn register(
        &self,
        script_url: &str,
        options: RegistrationOptions,
    ) -> Result<RegistrationHandle, ServiceWorkerError> {
        let script_url = Url::parse(script_url)
            .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?;
        if !matches!(script_url.scheme(), "http" | "https") {
            return Err(ServiceWorkerError::SecurityError(format!(
                "script must be served over http(s): {script_url}"
            )));
        }

        let scope = resolve_scope(&script_url, options.scope.as_deref())?;
        let scope_str = scope.to_string();

        {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .entry(scope_str.clone())
                .or_insert_with(|| ServiceWorkerRegistration::new(scope, script_url.clone()));
            registration.script_url = script_url.clone();
        }

        info!(scope = %scope_str, script = %script_url, "Registered service worker");

        let outcome = self.update(&scope_str).await?;
        Ok(RegistrationHandle {
            scope: scope_str,
            script_url,
            outcome,
        })
    }

    /// Check the script for changes and install a new version if it changed.
    ///
    /// A failed install leaves the previous version in control and returns
    /// the install error.
    pub async fn update(&self, scope: &str) -> Result<UpdateOutcome, ServiceWorkerError> {
        let (script_url, scope_url, current) = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(scope)
                .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?;
            if registration.installing.is_some() {
                return Err(ServiceWorkerError::StateError(format!(
                    "an install is already running for {scope}"
                )));
            }
            registration.last_update_check = Some(Instant::now());
            (
                registration.script_url.clone(),
                registration.scope.clone(),
                registration.newest_config(),
            )
        };

        let config = self.scripts.load(&script_url).await?;
        if current.as_deref() == Some(&config) {
            debug!(scope = %scope, "Worker script unchanged");
            return Ok(UpdateOutcome::UpToDate);
        }

        let worker = self.spawn_worker(&script_url, &scope_url, config)?;
        let worker_id = worker.id;
        let runtime = worker.runtime.clone();
        let global = worker.global.clone();
        let timeout = worker.config.lifecycle_timeout();

        {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(scope)
                .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?;
            let mut worker = worker;
            worker.set_state(ServiceWorkerState::Installing);
            registration.installing = Some(worker);
        }
        self.emit(ServiceWorkerEvent::UpdateFound {
            registration_scope: scope.to_string(),
        });
        self.emit_state(scope, worker_id, ServiceWorkerState::Installing);

        let installed = match with_timeout(timeout, || runtime.install()).await {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(ServiceWorkerError::InstallFailed(e.to_string())),
        };

        let mut registrations = self.registrations.write().await;
        let registration = registrations
            .get_mut(scope)
            .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?;
        let Some(mut worker) = registration.installing.take() else {
            let message = format!("installing worker vanished from {scope}");
            return Err(OfflineError::internal(message).into());
        };

        if let Err(e) = installed {
            error!(
                scope = %scope,
                worker = %worker_id,
                error = %e,
                "Install failed; keeping current worker"
            );
            worker.error = Some(e.to_string());
            worker.set_state(ServiceWorkerState::Redundant);
            drop(registrations);
            self.emit_state(scope, worker_id, ServiceWorkerState::Redundant);
            return Err(match e {
                ServiceWorkerError::InstallFailed(_) => e,
                other => ServiceWorkerError::InstallFailed(other.to_string()),
            });
        }

        worker.set_state(ServiceWorkerState::Installed);
        if let Some(mut replaced) = registration.waiting.replace(worker) {
            replaced.set_state(ServiceWorkerState::Redundant);
        }
        let has_active = registration.active.is_some();
        drop(registrations);

        info!(scope = %scope, worker = %worker_id, "Worker installed");
        self.emit_state(scope, worker_id, ServiceWorkerState::Installed);

        if global.wants_skip_waiting() || !has_active {
            self.activate_waiting(scope).await?;
            Ok(UpdateOutcome::Activated(worker_id))
        } else {
            Ok(UpdateOutcome::Waiting(worker_id))
        }
    }

    /// Promote the waiting worker to active.
    ///
    /// The previous active worker becomes redundant and its clients move to
    /// the new worker, as do clients the new worker claims.
    pub async fn activate_waiting(
        &self,
        scope: &str,
    ) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let (worker_id, runtime, global, timeout, scope_url, previous) = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(scope)
                .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?;
            let mut worker = registration
                .waiting
                .take()
                .ok_or_else(|| {
                    ServiceWorkerError::StateError(format!("no waiting worker in {scope}"))
                })?;

            worker.set_state(ServiceWorkerState::Activating);
            let previous = registration.active.take().map(|mut old| {
                old.set_state(ServiceWorkerState::Redundant);
                old.id
            });

            let handles = (
                worker.id,
                worker.runtime.clone(),
                worker.global.clone(),
                worker.config.lifecycle_timeout(),
                registration.scope.clone(),
                previous,
            );
            registration.active = Some(worker);
            handles
        };

        if let Some(old) = previous {
            self.emit_state(scope, old, ServiceWorkerState::Redundant);
        }
        self.emit_state(scope, worker_id, ServiceWorkerState::Activating);

        match with_timeout(timeout, || runtime.activate()).await {
            Ok(Ok(report)) => debug!(
                scope = %scope,
                deleted = report.deleted.len(),
                "Activate handler finished"
            ),
            Ok(Err(e)) => warn!(scope = %scope, error = %e, "Activate handler failed"),
            Err(e) => warn!(scope = %scope, error = %e, "Activate handler timed out"),
        }

        {
            let mut registrations = self.registrations.write().await;
            if let Some(worker) = registrations
                .get_mut(scope)
                .and_then(|registration| registration.worker_mut(worker_id))
            {
                worker.set_state(ServiceWorkerState::Activated);
            }
        }
        info!(scope = %scope, worker = %worker_id, "Worker activated");
        self.emit_state(scope, worker_id, ServiceWorkerState::Activated);

        let changed = {
            let mut clients = self.clients.write().await;
            let mut changed = match previous {
                Some(old) => clients.replace_controller(old, worker_id),
                None => Vec::new(),
            };
            if global.take_claim() {
                changed.extend(clients.claim(&scope_url, worker_id));
            }
            changed
        };
        for client_id in changed {
            self.emit(ServiceWorkerEvent::ControllerChange {
                client_id,
                worker_id,
            });
        }

        Ok(worker_id)
    }

    /// Route a request made by `client_id` through its controller.
    ///
    /// Uncontrolled clients get [`FetchDecision::Passthrough`].
    pub async fn handle_fetch(
        &self,
        client_id: &str,
        request: &Request,
    ) -> Result<FetchDecision, ServiceWorkerError> {
        let Some(controller) = self.controller(client_id).await else {
            return Ok(FetchDecision::Passthrough);
        };

        let runtime = {
            let registrations = self.registrations.read().await;
            registrations
                .values()
                .filter_map(|registration| registration.active.as_ref())
                .find(|worker| worker.id == controller && worker.state.can_intercept_fetch())
                .map(|worker| worker.runtime.clone())
        };

        match runtime {
            Some(runtime) => Ok(runtime.fetch(request).await?),
            None => Ok(FetchDecision::Passthrough),
        }
    }

    /// Post a message to the active or waiting worker of a registration.
    pub async fn post_message(
        &self,
        scope: &str,
        target: MessageTarget,
        data: &serde_json::Value,
    ) -> Result<(), ServiceWorkerError> {
        let worker = self.worker(scope, target).await?;
        worker.post_message(data)?;

        if target == MessageTarget::Waiting && worker.global.wants_skip_waiting() {
            self.activate_waiting(scope).await?;
        }
        Ok(())
    }

    /// Deliver a push message to the active worker.
    pub async fn push(
        &self,
        scope: &str,
        payload: Option<bytes::Bytes>,
    ) -> Result<(), ServiceWorkerError> {
        let worker = self.worker(scope, MessageTarget::Active).await?;
        worker.runtime.push(payload).await
    }

    /// Deliver a background sync event to the active worker.
    pub async fn sync(&self, scope: &str, tag: &str) -> Result<SyncOutcome, ServiceWorkerError> {
        let worker = self.worker(scope, MessageTarget::Active).await?;
        Ok(worker.runtime.sync(tag).await)
    }

    /// Get the scope of the registration covering `url`.
    pub async fn get_registration(&self, url: &str) -> Option<String> {
        let url = Url::parse(url).ok()?;
        let registrations = self.registrations.read().await;

        // Longest matching scope wins.
        registrations
            .iter()
            .filter(|(_, registration)| registration.covers(&url))
            .max_by_key(|(scope, _)| scope.len())
            .map(|(scope, _)| scope.clone())
    }

    /// Get all registration scopes.
    pub async fn get_registrations(&self) -> Vec<String> {
        let mut scopes: Vec<String> = self.registrations.read().await.keys().cloned().collect();
        scopes.sort();
        scopes
    }

    /// Snapshot a registration.
    pub async fn registration_info(&self, scope: &str) -> Option<RegistrationInfo> {
        self.registrations.read().await.get(scope).map(ServiceWorkerRegistration::info)
    }

    /// Unregister a service worker.
    pub async fn unregister(&self, scope: &str) -> Result<bool, ServiceWorkerError> {
        let mut registrations = self.registrations.write().await;
        if let Some(mut registration) = registrations.remove(scope) {
            registration.unregister();
            info!(scope = %scope, "Unregistered service worker");
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Open a page. A page inside the scope of an active worker starts
    /// controlled by it.
    pub async fn add_client(&self, url: &str) -> Result<String, ServiceWorkerError> {
        let mut client = self.clients.write().await.open_window(url)?;

        if let Some(scope) = self.get_registration(url).await {
            let registrations = self.registrations.read().await;
            client.controller = registrations
                .get(&scope)
                .and_then(|registration| registration.get_active())
                .map(|worker| worker.id);
        }

        let id = client.id.clone();
        self.clients.write().await.add(client);
        Ok(id)
    }

    /// Close a page.
    pub async fn remove_client(&self, client_id: &str) -> Option<Client> {
        self.clients.write().await.remove(client_id)
    }

    /// Worker controlling a client.
    pub async fn controller(&self, client_id: &str) -> Option<ServiceWorkerId> {
        self.clients.read().await.get(client_id).and_then(|c| c.controller)
    }

    /// Wait for background work of every live worker to settle.
    pub async fn wait_idle(&self) {
        let runtimes: Vec<Arc<CachingWorker>> = {
            let registrations = self.registrations.read().await;
            registrations
                .values()
                .flat_map(|r| [&r.installing, &r.waiting, &r.active])
                .flatten()
                .map(|worker| worker.runtime.clone())
                .collect()
        };
        for runtime in runtimes {
            runtime.wait_idle().await;
        }
    }

    async fn worker(
        &self,
        scope: &str,
        target: MessageTarget,
    ) -> Result<ServiceWorker, ServiceWorkerError> {
        let registrations = self.registrations.read().await;
        let registration = registrations
            .get(scope)
            .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?;
        let slot = match target {
            MessageTarget::Active => &registration.active,
            MessageTarget::Waiting => &registration.waiting,
        };
        slot.clone()
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("no {target:?} worker in {scope}")))
    }

    fn spawn_worker(
        &self,
        script_url: &Url,
        scope: &Url,
        config: WorkerConfig,
    ) -> Result<ServiceWorker, ServiceWorkerError> {
        let config = Arc::new(config);
        let global = Arc::new(GlobalScope::new(self.event_tx.clone()));
        let ctx = WorkerContext::new(
            scope,
            config.clone(),
            self.caches.clone(),
            self.fetcher.clone(),
        )?;
        let runtime = Arc::new(CachingWorker::new(ctx, global.clone()));

        Ok(ServiceWorker {
            id: ServiceWorkerId::new(),
            script_url: script_url.clone(),
            state: ServiceWorkerState::Parsed,
            error: None,
            state_changed_at: Instant::now(),
            config,
            runtime,
            global,
        })
    }

    fn emit_state(&self, scope: &str, worker_id: ServiceWorkerId, new_state: ServiceWorkerState) {
        self.emit(ServiceWorkerEvent::StateChange {
            registration_scope: scope.to_string(),
            worker_id,
            new_state,
        });
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl std::fmt::Debug for ServiceWorkerContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceWorkerContainer").finish_non_exhaustive()
    }
}

// ==================== Helpers ====================

/// Resolve and check a registration scope.
///
/// The scope must share the script's origin and sit at or below the
/// script's directory.
fn resolve_scope(script_url: &Url, scope: Option<&str>) -> Result<Url, ServiceWorkerError> {
    let directory = script_url
        .join("./")
        .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?;

    let Some(scope) = scope else {
        return Ok(directory);
    };

    let scope = script_url
        .join(scope)
        .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?;
    if scope.origin() != script_url.origin() {
        return Err(ServiceWorkerError::SecurityError(format!(
            "scope {scope} is not same-origin with {script_url}"
        )));
    }
    if !scope.path().starts_with(directory.path()) {
        return Err(ServiceWorkerError::SecurityError(format!(
            "scope {scope} is outside the script directory {}",
            directory.path()
        )));
    }
    Ok(scope)
}

/// Generate a simple UUID-like string.
fn uuid_simple() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    format!("{:016x}-{:04x}", nanos, COUNTER.fetch_add(1, Ordering::Relaxed))
}
