//! Collaborators the sync engine consults but does not own: login state, the
//! rollout gate, and the UI refresh signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use tokio::sync::broadcast;

pub trait AuthProvider: Send + Sync {
    fn is_authenticated(&self) -> bool;
    fn current_token(&self) -> Option<String>;
}

/// Must report true before the engine attempts any sync.
pub trait FeatureGate: Send + Sync {
    fn is_enabled(&self) -> bool;
}

/// Fire-and-forget "data changed, redraw" signal.
pub trait RefreshNotifier: Send + Sync {
    fn refresh(&self);
}

/// Token holder for the logged-in user.
#[derive(Default)]
pub struct SessionAuth {
    token: RwLock<Option<String>>,
}

impl SessionAuth {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token.filter(|t| !t.is_empty())),
        }
    }

    pub fn from_env() -> Self {
        Self::new(std::env::var("TASKSYNC_AUTH_TOKEN").ok())
    }

    pub fn log_in(&self, token: impl Into<String>) {
        if let Ok(mut guard) = self.token.write() {
            *guard = Some(token.into());
        }
    }

    pub fn log_out(&self) {
        if let Ok(mut guard) = self.token.write() {
            *guard = None;
        }
    }
}

impl AuthProvider for SessionAuth {
    fn is_authenticated(&self) -> bool {
        self.current_token().is_some()
    }

    fn current_token(&self) -> Option<String> {
        self.token.read().ok().and_then(|guard| guard.clone())
    }
}

pub struct SyncGate {
    enabled: AtomicBool,
}

impl SyncGate {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

impl FeatureGate for SyncGate {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshEvent;

/// Broadcasts refresh events to any number of UI subscribers.
pub struct RefreshBroadcaster {
    tx: broadcast::Sender<RefreshEvent>,
}

impl RefreshBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RefreshEvent> {
        self.tx.subscribe()
    }
}

impl Default for RefreshBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl RefreshNotifier for RefreshBroadcaster {
    fn refresh(&self) {
        let _ = self.tx.send(RefreshEvent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_token_is_not_a_session() {
        let auth = SessionAuth::new(Some(String::new()));
        assert!(!auth.is_authenticated());

        auth.log_in("abc");
        assert_eq!(auth.current_token().as_deref(), Some("abc"));

        auth.log_out();
        assert!(!auth.is_authenticated());
    }

    #[test]
    fn gate_toggles() {
        let gate = SyncGate::new(false);
        assert!(!gate.is_enabled());
        gate.set_enabled(true);
        assert!(gate.is_enabled());
    }

    #[tokio::test]
    async fn broadcaster_reaches_subscribers() {
        let notifier = RefreshBroadcaster::new();
        let mut rx = notifier.subscribe();
        notifier.refresh();
        assert_eq!(rx.recv().await.unwrap(), RefreshEvent);
    }
}
