use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, StatusCode};
use tokio::sync::{broadcast, RwLock};

use super::models::*;
use crate::config::AuthConfig;
use crate::models::{AuthOutcome, Session, SessionEvent};
use crate::providers::traits::AuthProvider;
use crate::providers::types::AuthProviderError;

const EVENT_CAPACITY: usize = 16;

/// Client for a GoTrue-compatible hosted auth API.
pub struct HostedAuthProvider {
    client: Client,
    config: AuthConfig,
    session: RwLock<Option<Session>>,
    events: broadcast::Sender<SessionEvent>,
}

impl HostedAuthProvider {
    pub fn new(config: AuthConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            client: Client::new(),
            config,
            session: RwLock::new(None),
            events,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Reinstate a session from a stored refresh token and announce it as the
    /// initial session. A rejected token announces an empty initial session.
    pub async fn restore_session(&self, refresh_token: &str) -> Result<Session, AuthProviderError> {
        match self.exchange_refresh_token(refresh_token).await {
            Ok(session) => {
                *self.session.write().await = Some(session.clone());
                self.emit(SessionEvent::InitialSession(Some(session.clone())));
                Ok(session)
            }
            Err(e) => {
                self.emit(SessionEvent::InitialSession(None));
                Err(e)
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn post_json<T: serde::Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        bearer: Option<&str>,
    ) -> Result<reqwest::Response, AuthProviderError> {
        let mut req = self
            .client
            .post(url)
            .header("apikey", &self.config.anon_key)
            .json(body);
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }
        let response = req
            .send()
            .await
            .map_err(|e| AuthProviderError::Network(e.to_string()))?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(classify_error(status, &body))
    }

    async fn exchange_refresh_token(&self, refresh_token: &str) -> Result<Session, AuthProviderError> {
        let url = self.endpoint("token?grant_type=refresh_token");
        let response = self
            .post_json(&url, &RefreshTokenGrant { refresh_token }, None)
            .await?;
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthProviderError::Unexpected(e.to_string()))?;
        session_from_token(body, Utc::now())
            .ok_or_else(|| AuthProviderError::Unexpected("Token response without session".into()))
    }
}

fn credentials<'a>(
    email: &'a str,
    password: &'a str,
    captcha_token: Option<&'a str>,
) -> PasswordCredentials<'a> {
    PasswordCredentials {
        email,
        password,
        gotrue_meta_security: captcha_token.map(|captcha_token| MetaSecurity { captcha_token }),
    }
}

/// Map an error status and payload onto the auth error taxonomy.
fn classify_error(status: StatusCode, body: &str) -> AuthProviderError {
    let parsed: AuthErrorResponse = serde_json::from_str(body).unwrap_or_default();
    let code = parsed.error_code.as_deref().unwrap_or_default();
    let text = parsed.text();
    let lower = text.to_lowercase();

    if status == StatusCode::TOO_MANY_REQUESTS || code.starts_with("over_") {
        AuthProviderError::RateLimited
    } else if code == "invalid_credentials" || lower.contains("invalid login credentials") {
        AuthProviderError::InvalidCredentials
    } else if code == "email_not_confirmed" || lower.contains("email not confirmed") {
        AuthProviderError::EmailNotConfirmed
    } else if code == "user_already_exists"
        || code == "email_exists"
        || lower.contains("already registered")
    {
        AuthProviderError::AlreadyRegistered
    } else if code.starts_with("captcha") || lower.contains("captcha") {
        AuthProviderError::Captcha(text)
    } else if text.is_empty() {
        AuthProviderError::Unexpected(format!("HTTP {}", status.as_u16()))
    } else {
        AuthProviderError::Unexpected(format!("HTTP {}: {}", status.as_u16(), text))
    }
}

fn session_from_token(body: TokenResponse, now: DateTime<Utc>) -> Option<Session> {
    let user = body.user?;
    let expires_at = match (body.expires_at, body.expires_in) {
        (Some(at), _) => DateTime::from_timestamp(at, 0),
        (None, Some(secs)) => Some(now + Duration::seconds(secs)),
        (None, None) => None,
    };
    Some(Session {
        user_id: user.id,
        email: user.email.unwrap_or_default(),
        access_token: body.access_token?,
        refresh_token: body.refresh_token.unwrap_or_default(),
        expires_at,
    })
}

#[async_trait]
impl AuthProvider for HostedAuthProvider {
    async fn sign_in(
        &self,
        email: &str,
        password: &str,
        captcha_token: Option<&str>,
    ) -> Result<Session, AuthProviderError> {
        let url = self.endpoint("token?grant_type=password");
        let response = self
            .post_json(&url, &credentials(email, password, captcha_token), None)
            .await?;
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthProviderError::Unexpected(e.to_string()))?;
        let session = session_from_token(body, Utc::now())
            .ok_or_else(|| AuthProviderError::Unexpected("Token response without session".into()))?;

        *self.session.write().await = Some(session.clone());
        self.emit(SessionEvent::SignedIn(session.clone()));
        tracing::info!(user_id = %session.user_id, "Signed in");
        Ok(session)
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        captcha_token: Option<&str>,
    ) -> Result<AuthOutcome, AuthProviderError> {
        let url = self.endpoint("signup");
        let response = self
            .post_json(&url, &credentials(email, password, captcha_token), None)
            .await?;
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthProviderError::Unexpected(e.to_string()))?;

        let pending_email = body.email.clone();
        match session_from_token(body, Utc::now()) {
            Some(session) => {
                *self.session.write().await = Some(session.clone());
                self.emit(SessionEvent::SignedIn(session.clone()));
                tracing::info!(user_id = %session.user_id, "Signed up and signed in");
                Ok(AuthOutcome::SignedIn(session))
            }
            None => {
                tracing::info!("Sign-up awaiting email confirmation");
                Ok(AuthOutcome::ConfirmationPending {
                    email: pending_email.unwrap_or_else(|| email.to_string()),
                })
            }
        }
    }

    async fn sign_out(&self) -> Result<(), AuthProviderError> {
        let previous = self.session.write().await.take();
        self.emit(SessionEvent::SignedOut);

        let Some(session) = previous else {
            return Ok(());
        };
        let url = self.endpoint("logout");
        self.post_json(&url, &serde_json::json!({}), Some(&session.access_token))
            .await?;
        tracing::info!(user_id = %session.user_id, "Signed out");
        Ok(())
    }

    async fn refresh_session(&self) -> Result<Session, AuthProviderError> {
        let refresh_token = self
            .session
            .read()
            .await
            .as_ref()
            .map(|s| s.refresh_token.clone())
            .ok_or_else(|| AuthProviderError::Unexpected("No active session".into()))?;

        let session = self.exchange_refresh_token(&refresh_token).await?;
        *self.session.write().await = Some(session.clone());
        self.emit(SessionEvent::TokenRefreshed(session.clone()));
        Ok(session)
    }

    async fn current_session(&self) -> Option<Session> {
        self.session.read().await.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}
