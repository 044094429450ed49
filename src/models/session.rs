use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Authenticated identity handed out by the auth collaborator.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub email: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Whether the access token expires within `margin` of `now`. Sessions
    /// without an expiry never do.
    pub fn expires_within(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        self.expires_at.is_some_and(|at| at - now <= margin)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("email", &self.email)
            .field("access_token", &"***")
            .field("refresh_token", &"***")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    InitialSession(Option<Session>),
    SignedIn(Session),
    SignedOut,
    TokenRefreshed(Session),
}

impl SessionEvent {
    /// The session this event leaves in place, if any.
    pub fn session(&self) -> Option<&Session> {
        match self {
            SessionEvent::InitialSession(session) => session.as_ref(),
            SessionEvent::SignedIn(session) | SessionEvent::TokenRefreshed(session) => {
                Some(session)
            }
            SessionEvent::SignedOut => None,
        }
    }
}

/// Result of a successful credential submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    SignedIn(Session),
    /// Sign-up accepted; the account must confirm its email before a
    /// session is issued.
    ConfirmationPending { email: String },
}

impl AuthOutcome {
    pub fn session(&self) -> Option<&Session> {
        match self {
            AuthOutcome::SignedIn(session) => Some(session),
            AuthOutcome::ConfirmationPending { .. } => None,
        }
    }
}
