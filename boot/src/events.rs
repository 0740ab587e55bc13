//! Lifecycle notifications.

use tokio::sync::broadcast;

use crate::token::{LoginFailure, LoginStatus};

const EVENT_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootEvent {
    UserLoggedIn(LoginStatus),
    UserLoginFailed(LoginFailure),
    UserLoggedOut,
    TokenReady,
    DocumentReady,
    EverythingReady,
}

impl BootEvent {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            BootEvent::UserLoggedIn(_) => "UserLoggedIn",
            BootEvent::UserLoginFailed(_) => "UserLoginFailed",
            BootEvent::UserLoggedOut => "UserLoggedOut",
            BootEvent::TokenReady => "TokenReady",
            BootEvent::DocumentReady => "DocumentReady",
            BootEvent::EverythingReady => "EverythingReady",
        }
    }
}

/// Fan-out of [`BootEvent`]s. Emitting with nobody subscribed is not an error.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BootEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn emit(&self, event: BootEvent) {
        tracing::debug!("trigger {}", event.name());
        let _ = self.sender.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BootEvent> {
        self.sender.subscribe()
    }
}
