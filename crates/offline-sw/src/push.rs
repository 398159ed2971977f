//! Push and background sync events.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::scope::WorkerScope;
use crate::worker::WorkerContext;
use crate::ServiceWorkerError;

/// Tag of the report sync registered by the app.
pub const SYNC_REPORTS_TAG: &str = "sync-reports";

const DEFAULT_PUSH_BODY: &str = "New update available";

/// Options for a system notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationOptions {
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
}

/// Build the notification shown for a push message.
pub fn push_notification(
    ctx: &WorkerContext,
    payload: Option<&[u8]>,
) -> (String, NotificationOptions) {
    let body = payload
        .map(|data| String::from_utf8_lossy(data).into_owned())
        .unwrap_or_else(|| DEFAULT_PUSH_BODY.to_string());

    let notification = &ctx.config.notification;
    let title = format!("{} Update", ctx.config.app_name);
    let options = NotificationOptions {
        body,
        icon: notification.icon.clone(),
        badge: notification.badge.clone(),
        vibrate: notification.vibrate.clone(),
    };
    (title, options)
}

/// Show a notification for an incoming push message.
pub async fn handle_push(
    ctx: &WorkerContext,
    scope: &dyn WorkerScope,
    payload: Option<&[u8]>,
) -> Result<(), ServiceWorkerError> {
    let (title, options) = push_notification(ctx, payload);
    debug!(title = %title, "Showing push notification");
    scope.show_notification(&title, options)
}

/// Outcome of a background sync event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Ran,
    Ignored,
}

/// Handle a background sync event.
pub async fn handle_sync(tag: &str) -> SyncOutcome {
    if tag == SYNC_REPORTS_TAG {
        sync_reports().await;
        SyncOutcome::Ran
    } else {
        debug!(tag = %tag, "Ignoring unknown sync tag");
        SyncOutcome::Ignored
    }
}

// TODO: upload reports saved while offline once the app exposes a report store.
async fn sync_reports() {
    info!("Syncing reports");
}
