//! Caller-supplied session state: identity, hints, preferences, cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use uuid::Uuid;

/// Cooperative cancellation shared between the caller and the gate.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserPreferences {
    /// When false the top confidence tier still asks for confirmation.
    pub allow_auto_execute: bool,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            allow_auto_execute: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionContext {
    pub id: String,
    /// Free-text context passed to the classifier.
    pub hints: Vec<String>,
    pub preferences: UserPreferences,
    pub cancel: CancelToken,
}

impl SessionContext {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hints: Vec::new(),
            preferences: UserPreferences::default(),
            cancel: CancelToken::new(),
        }
    }

    /// Session with a random id.
    pub fn anonymous() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    pub fn with_hints(mut self, hints: Vec<String>) -> Self {
        self.hints = hints;
        self
    }

    pub fn with_preferences(mut self, preferences: UserPreferences) -> Self {
        self.preferences = preferences;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_visible_through_clones() {
        let session = SessionContext::new("s1");
        let handle = session.cancel.clone();
        assert!(!session.is_cancelled());
        handle.cancel();
        assert!(session.is_cancelled());
    }
}
