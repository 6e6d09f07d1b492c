//! Auth - signed-in user tracking
//!
//! `AuthProvider` is what the orchestrator consumes. `AuthSession` is the
//! in-process implementation: the app calls `sign_in` after its login flow
//! and `sign_out` on logout; the bearer token is read by the HTTP backend.

use std::sync::RwLock;

use super::events::{EventBus, Subscription};

/// Auth state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn { user_id: String },
    SignedOut,
}

pub type AuthListener = Box<dyn Fn(&AuthEvent) + Send + Sync>;

/// Source of the current user
pub trait AuthProvider: Send + Sync {
    fn is_authenticated(&self) -> bool;

    fn current_user_id(&self) -> Option<String>;

    fn on_auth_state_changed(&self, listener: AuthListener) -> Subscription;
}

#[derive(Debug, Clone, Default)]
struct SessionState {
    user_id: Option<String>,
    access_token: Option<String>,
}

/// In-memory auth session
#[derive(Default)]
pub struct AuthSession {
    state: RwLock<SessionState>,
    events: EventBus<AuthEvent>,
}

impl AuthSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the signed-in user and token (after login)
    pub fn sign_in(&self, user_id: impl Into<String>, access_token: impl Into<String>) {
        let user_id = user_id.into();
        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            state.user_id = Some(user_id.clone());
            state.access_token = Some(access_token.into());
        }

        log::info!("User {} signed in", user_id);
        self.events.publish(&AuthEvent::SignedIn { user_id });
    }

    /// Replace the token (after refresh)
    pub fn set_token(&self, access_token: impl Into<String>) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.access_token = Some(access_token.into());
    }

    /// Clear user and token (logout)
    pub fn sign_out(&self) {
        let was_signed_in = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            let was = state.user_id.is_some();
            *state = SessionState::default();
            was
        };

        if was_signed_in {
            log::info!("User signed out");
            self.events.publish(&AuthEvent::SignedOut);
        }
    }

    pub fn access_token(&self) -> Option<String> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .access_token
            .clone()
    }
}

impl AuthProvider for AuthSession {
    fn is_authenticated(&self) -> bool {
        self.current_user_id().is_some()
    }

    fn current_user_id(&self) -> Option<String> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .user_id
            .clone()
    }

    fn on_auth_state_changed(&self, listener: AuthListener) -> Subscription {
        self.events.subscribe(move |event: &AuthEvent| listener(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_session_lifecycle() {
        let session = AuthSession::new();
        assert!(!session.is_authenticated());
        assert!(session.access_token().is_none());

        session.sign_in("user-1", "token-1");
        assert!(session.is_authenticated());
        assert_eq!(session.current_user_id().as_deref(), Some("user-1"));
        assert_eq!(session.access_token().as_deref(), Some("token-1"));

        session.set_token("token-2");
        assert_eq!(session.access_token().as_deref(), Some("token-2"));

        session.sign_out();
        assert!(!session.is_authenticated());
        assert!(session.access_token().is_none());
    }

    #[test]
    fn test_auth_events() {
        let session = AuthSession::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let subscription = session.on_auth_state_changed(Box::new(move |event| {
            sink.lock().unwrap().push(event.clone());
        }));

        session.sign_in("user-1", "token");
        session.sign_out();
        // Signing out twice publishes once
        session.sign_out();
        subscription.unsubscribe();
        session.sign_in("user-2", "token");

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                AuthEvent::SignedIn {
                    user_id: "user-1".to_string()
                },
                AuthEvent::SignedOut,
            ]
        );
    }
}
