use async_trait::async_trait;
use tokio::sync::broadcast;

use super::types::{AuthProviderError, ProviderError};
use crate::models::{AuthOutcome, Session, SessionEvent};

/// Text-generation backend. Receives one prompt, returns one reply; the
/// persona system prompt is the implementation's concern.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, ProviderError>;
}

/// Hosted identity service: credential checks and session lifecycle.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn sign_in(
        &self,
        email: &str,
        password: &str,
        captcha_token: Option<&str>,
    ) -> Result<Session, AuthProviderError>;

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        captcha_token: Option<&str>,
    ) -> Result<AuthOutcome, AuthProviderError>;

    async fn sign_out(&self) -> Result<(), AuthProviderError>;

    async fn refresh_session(&self) -> Result<Session, AuthProviderError>;

    async fn current_session(&self) -> Option<Session>;

    /// Session transitions. A fresh subscriber should be sent the current
    /// state as `InitialSession` by the caller if it needs one.
    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;
}
