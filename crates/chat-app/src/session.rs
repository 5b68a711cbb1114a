use snafu::ensure;
use tokio::sync::watch;

use crate::error::{ChatResult, ValidationSnafu};

/// Signed-in identity. Presence is all the chat cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user: String,
}

/// Holds the current session and notifies listeners when it changes.
#[derive(Debug)]
pub struct SessionGate {
    tx: watch::Sender<Option<Session>>,
}

impl Default for SessionGate {
    fn default() -> Self {
        Self::new(None)
    }
}

impl SessionGate {
    pub fn new(initial: Option<Session>) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn session(&self) -> Option<Session> {
        self.tx.borrow().clone()
    }

    pub fn is_signed_in(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.tx.subscribe()
    }

    pub fn sign_in(&self, user: &str) -> ChatResult<Session> {
        let user = user.trim();
        ensure!(
            !user.is_empty(),
            ValidationSnafu {
                stage: "session-sign-in",
                details: "user name is empty".to_string(),
            }
        );

        let session = Session {
            user: user.to_string(),
        };
        tracing::info!(user = %session.user, "signed in");
        self.tx.send_replace(Some(session.clone()));
        Ok(session)
    }

    pub fn sign_out(&self) {
        if self.tx.send_replace(None).is_some() {
            tracing::info!("signed out");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listeners_see_sign_in_and_sign_out() {
        let gate = SessionGate::default();
        let mut changes = gate.subscribe();
        assert!(!gate.is_signed_in());

        gate.sign_in("  ada ").unwrap();
        assert!(changes.has_changed().unwrap());
        assert_eq!(
            changes.borrow_and_update().as_ref().map(|s| s.user.as_str()),
            Some("ada")
        );

        gate.sign_out();
        assert!(changes.has_changed().unwrap());
        assert!(changes.borrow_and_update().is_none());
        assert_eq!(gate.session(), None);
    }

    #[test]
    fn blank_user_names_are_rejected() {
        let gate = SessionGate::default();
        assert!(gate.sign_in("   ").is_err());
        assert!(!gate.is_signed_in());
    }
}
