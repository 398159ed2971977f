//! Deferred install prompt.
//!
//! The platform fires an installability signal once it considers the app
//! installable. The page suppresses the default mini-infobar, keeps the
//! signal, and replays it when the user presses its own install button.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from presenting the install prompt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PromptError {
    #[error("Install prompt was already shown")]
    AlreadyShown,

    #[error("Install prompt failed: {0}")]
    Platform(String),
}

/// The user's answer to the install prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserChoice {
    Accepted,
    Dismissed,
}

/// The platform's installability signal (`beforeinstallprompt`).
#[async_trait]
pub trait InstallPromptEvent: Send + Sync {
    /// Suppress the platform's own install UI.
    fn prevent_default(&self);

    /// Show the install prompt and wait for the one-time choice.
    async fn prompt(&self) -> Result<UserChoice, PromptError>;
}

/// Page UI used by the install flow.
pub trait InstallButton: Send + Sync {
    fn show(&self);
    fn hide(&self);
    fn show_success(&self, message: &str);
}

/// Where the deferred install intent stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PromptState {
    /// Nothing captured yet.
    #[default]
    Idle,
    /// A signal is held and the install button is shown.
    Captured,
    /// The held signal was used or discarded.
    Consumed,
}

enum Slot {
    Idle,
    Captured(Box<dyn InstallPromptEvent>),
    Consumed,
}

/// Owns the deferred install intent of one page.
pub struct InstallPromptController {
    app_name: String,
    button: Arc<dyn InstallButton>,
    slot: Mutex<Slot>,
}

impl InstallPromptController {
    pub fn new(app_name: impl Into<String>, button: Arc<dyn InstallButton>) -> Self {
        Self {
            app_name: app_name.into(),
            button,
            slot: Mutex::new(Slot::Idle),
        }
    }

    pub fn state(&self) -> PromptState {
        match *self.lock() {
            Slot::Idle => PromptState::Idle,
            Slot::Captured(_) => PromptState::Captured,
            Slot::Consumed => PromptState::Consumed,
        }
    }

    /// Keep the installability signal and show the install button.
    pub fn capture(&self, event: Box<dyn InstallPromptEvent>) {
        event.prevent_default();
        *self.lock() = Slot::Captured(event);
        debug!("Install prompt captured");
        self.button.show();
    }

    /// Replay the captured prompt.
    ///
    /// Returns `None` when nothing is captured. The intent is discarded and
    /// the button hidden whatever the user chooses.
    pub async fn consume(&self) -> Option<Result<UserChoice, PromptError>> {
        let event = {
            let mut slot = self.lock();
            match std::mem::replace(&mut *slot, Slot::Consumed) {
                Slot::Captured(event) => event,
                other => {
                    *slot = other;
                    return None;
                }
            }
        };

        let choice = event.prompt().await;
        match &choice {
            Ok(UserChoice::Accepted) => info!("User accepted the install prompt"),
            Ok(UserChoice::Dismissed) => info!("User dismissed the install prompt"),
            Err(e) => warn!(error = %e, "Install prompt failed"),
        }

        self.button.hide();
        Some(choice)
    }

    /// The app was installed (`appinstalled`).
    pub fn on_app_installed(&self) {
        *self.lock() = Slot::Consumed;
        info!(app = %self.app_name, "App installed");
        self.button.hide();
        self.button.show_success(&format!(
            "✨ {} installed! You can now use it offline.",
            self.app_name
        ));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for InstallPromptController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallPromptController")
            .field("app_name", &self.app_name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakePrompt {
        answer: Result<UserChoice, PromptError>,
        prevented: Arc<AtomicBool>,
        prompts: Arc<AtomicUsize>,
    }

    impl FakePrompt {
        fn new(
            answer: Result<UserChoice, PromptError>,
        ) -> (Box<Self>, Arc<AtomicBool>, Arc<AtomicUsize>) {
            let prevented = Arc::new(AtomicBool::new(false));
            let prompts = Arc::new(AtomicUsize::new(0));
            let event = Box::new(Self {
                answer,
                prevented: prevented.clone(),
                prompts: prompts.clone(),
            });
            (event, prevented, prompts)
        }
    }

    #[async_trait]
    impl InstallPromptEvent for FakePrompt {
        fn prevent_default(&self) {
            self.prevented.store(true, Ordering::SeqCst);
        }

        async fn prompt(&self) -> Result<UserChoice, PromptError> {
            self.prompts.fetch_add(1, Ordering::SeqCst);
            self.answer.clone()
        }
    }

    #[derive(Default)]
    struct FakeButton {
        visible: AtomicBool,
        messages: Mutex<Vec<String>>,
    }

    impl InstallButton for FakeButton {
        fn show(&self) {
            self.visible.store(true, Ordering::SeqCst);
        }

        fn hide(&self) {
            self.visible.store(false, Ordering::SeqCst);
        }

        fn show_success(&self, message: &str) {
            self.messages.lock().unwrap().push(message.to_string());
        }
    }

    fn setup() -> (InstallPromptController, Arc<FakeButton>) {
        let button = Arc::new(FakeButton::default());
        (InstallPromptController::new("BPM Pro", button.clone()), button)
    }

    #[test]
    fn test_capture_suppresses_default_and_shows_button() {
        let (controller, button) = setup();
        let (event, prevented, _) = FakePrompt::new(Ok(UserChoice::Accepted));

        controller.capture(event);

        assert!(prevented.load(Ordering::SeqCst));
        assert!(button.visible.load(Ordering::SeqCst));
        assert_eq!(controller.state(), PromptState::Captured);
    }

    #[tokio::test]
    async fn test_consume_without_capture_is_noop() {
        let (controller, button) = setup();
        assert!(controller.consume().await.is_none());
        assert_eq!(controller.state(), PromptState::Idle);
        assert!(!button.visible.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_consume_prompts_once() {
        let (controller, button) = setup();
        let (event, _, prompts) = FakePrompt::new(Ok(UserChoice::Accepted));
        controller.capture(event);

        assert_eq!(controller.consume().await, Some(Ok(UserChoice::Accepted)));
        assert_eq!(controller.state(), PromptState::Consumed);
        assert!(!button.visible.load(Ordering::SeqCst));

        assert!(controller.consume().await.is_none());
        assert_eq!(prompts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dismissal_and_failure_still_discard() {
        let (controller, button) = setup();
        let (event, _, _) = FakePrompt::new(Ok(UserChoice::Dismissed));
        controller.capture(event);
        assert_eq!(controller.consume().await, Some(Ok(UserChoice::Dismissed)));
        assert!(!button.visible.load(Ordering::SeqCst));

        let (event, _, _) = FakePrompt::new(Err(PromptError::AlreadyShown));
        controller.capture(event);
        assert_eq!(controller.consume().await, Some(Err(PromptError::AlreadyShown)));
        assert_eq!(controller.state(), PromptState::Consumed);
        assert!(!button.visible.load(Ordering::SeqCst));
    }

    #[test]
    fn test_app_installed_discards_intent() {
        let (controller, button) = setup();
        let (event, _, _) = FakePrompt::new(Ok(UserChoice::Accepted));
        controller.capture(event);

        controller.on_app_installed();

        assert_eq!(controller.state(), PromptState::Consumed);
        assert!(!button.visible.load(Ordering::SeqCst));
        assert_eq!(
            button.messages.lock().unwrap().as_slice(),
            ["✨ BPM Pro installed! You can now use it offline."]
        );
    }
}
