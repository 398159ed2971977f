//! Online/offline badge.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

const ONLINE_BADGE_DURATION: Duration = Duration::from_secs(3);

/// Network connectivity as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Online => "🟢 Online",
            Self::Offline => "🔴 Offline Mode",
        }
    }
}

/// Page UI for the badge.
pub trait StatusBadge: Send + Sync {
    fn show(&self, status: Connectivity, label: &str);
    fn hide(&self);
}

/// Shows "Online" briefly and "Offline Mode" until the network returns.
pub struct ConnectivityIndicator {
    badge: Arc<dyn StatusBadge>,
    online_duration: Duration,
    pending_hide: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectivityIndicator {
    pub fn new(badge: Arc<dyn StatusBadge>) -> Self {
        Self {
            badge,
            online_duration: ONLINE_BADGE_DURATION,
            pending_hide: Mutex::new(None),
        }
    }

    /// Override how long the online badge stays up.
    pub fn with_online_duration(mut self, duration: Duration) -> Self {
        self.online_duration = duration;
        self
    }

    /// Render a connectivity change.
    pub fn update(&self, status: Connectivity) {
        let mut pending = self.pending_hide.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = pending.take() {
            task.abort();
        }

        debug!(?status, "Connectivity changed");
        self.badge.show(status, status.label());

        if status == Connectivity::Online {
            let badge = self.badge.clone();
            let delay = self.online_duration;
            *pending = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                badge.hide();
            }));
        }
    }

    /// Render the current status and every later change.
    pub async fn run(&self, mut status: watch::Receiver<Connectivity>) {
        let initial = *status.borrow_and_update();
        self.update(initial);
        while status.changed().await.is_ok() {
            let next = *status.borrow_and_update();
            self.update(next);
        }
    }
}

impl Drop for ConnectivityIndicator {
    fn drop(&mut self) {
        if let Some(task) = self
            .pending_hide
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}
