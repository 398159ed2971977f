//! Capabilities the host grants a running worker.

use crate::push::NotificationOptions;
use crate::ServiceWorkerError;

/// The worker's view of its global scope (`self` in a worker script).
pub trait WorkerScope: Send + Sync {
    /// Skip the waiting phase and activate as soon as installed.
    fn skip_waiting(&self);

    /// Take control of every open client in scope.
    fn claim_clients(&self) -> Result<(), ServiceWorkerError>;

    /// Show a system notification.
    fn show_notification(
        &self,
        title: &str,
        options: NotificationOptions,
    ) -> Result<(), ServiceWorkerError>;
}
