//! Client-side brute-force mitigation around the hosted auth service.
//!
//! The guard counts consecutive failed submissions and locks further
//! attempts for a fixed window once the limit is hit. Expiry is lazy: the
//! lock is only lifted by the first submission made after the window ends.

use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::AuthOutcome;
use crate::providers::{AuthProvider, AuthProviderError};
use crate::services::clock::Clock;
use crate::services::store::AttemptLog;

pub const MAX_FAILED_ATTEMPTS: u32 = 5;
pub const LOCK_DURATION_MINUTES: i64 = 15;
pub const CAPTCHA_THRESHOLD: u32 = 3;
pub const MIN_PASSWORD_LEN: usize = 6;

static EMAIL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap());

/// When a CAPTCHA token must accompany a submission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptchaPolicy {
    #[default]
    Always,
    AfterFailures(u32),
}

impl CaptchaPolicy {
    pub fn requires_token(&self, failed_attempts: u32) -> bool {
        match self {
            CaptchaPolicy::Always => true,
            CaptchaPolicy::AfterFailures(threshold) => failed_attempts >= *threshold,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GuardPolicy {
    pub max_attempts: u32,
    pub lock_duration: Duration,
    pub captcha: CaptchaPolicy,
    pub min_password_len: usize,
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_FAILED_ATTEMPTS,
            lock_duration: Duration::minutes(LOCK_DURATION_MINUTES),
            captcha: CaptchaPolicy::default(),
            min_password_len: MIN_PASSWORD_LEN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    SignIn,
    SignUp,
}

#[derive(Clone)]
pub struct AuthRequest {
    pub email: String,
    pub password: String,
    /// Required for sign-up, ignored for sign-in.
    pub confirm_password: Option<String>,
    pub mode: AuthMode,
}

impl AuthRequest {
    pub fn sign_in(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            confirm_password: None,
            mode: AuthMode::SignIn,
        }
    }

    pub fn sign_up(
        email: impl Into<String>,
        password: impl Into<String>,
        confirm_password: impl Into<String>,
    ) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            confirm_password: Some(confirm_password.into()),
            mode: AuthMode::SignUp,
        }
    }
}

impl std::fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthRequest")
            .field("email", &self.email)
            .field("password", &"***")
            .field("mode", &self.mode)
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginAttemptState {
    pub failed_attempts: u32,
    pub is_locked: bool,
    pub lock_end_time: Option<DateTime<Utc>>,
    pub captcha_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Invalid email address")]
    InvalidEmail,

    #[error("Password shorter than {min} characters")]
    PasswordTooShort { min: usize },

    #[error("Passwords do not match")]
    PasswordMismatch,

    #[error("Email already registered")]
    AlreadyRegistered,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Email not confirmed")]
    EmailNotConfirmed,

    #[error("Captcha verification required")]
    CaptchaRequired,

    #[error("Auth service is throttling requests")]
    RateLimited,

    #[error("Too many failed attempts, locked for {remaining_minutes} more minute(s)")]
    Locked { remaining_minutes: i64 },

    #[error("Unexpected auth failure: {0}")]
    Unexpected(String),
}

impl AuthError {
    /// Text shown to the user.
    pub fn user_message(&self) -> String {
        match self {
            AuthError::InvalidEmail => "Por favor, insira um email válido.".to_string(),
            AuthError::PasswordTooShort { min } => {
                format!("A senha deve ter pelo menos {} caracteres.", min)
            }
            AuthError::PasswordMismatch => "As senhas não coincidem.".to_string(),
            AuthError::AlreadyRegistered => {
                "Este email já está cadastrado. Tente fazer login.".to_string()
            }
            AuthError::InvalidCredentials => "Email ou senha incorretos.".to_string(),
            AuthError::EmailNotConfirmed => {
                "Confirme seu email antes de fazer login. Verifique sua caixa de entrada."
                    .to_string()
            }
            AuthError::CaptchaRequired => {
                "Por favor, complete a verificação de segurança.".to_string()
            }
            AuthError::RateLimited => {
                "Muitas solicitações ao servidor. Aguarde alguns minutos e tente novamente."
                    .to_string()
            }
            AuthError::Locked { remaining_minutes } => format!(
                "Muitas tentativas falhas. Tente novamente em {} minuto(s).",
                remaining_minutes
            ),
            AuthError::Unexpected(_) => {
                "Ocorreu um erro inesperado. Tente novamente.".to_string()
            }
        }
    }
}

impl From<AuthProviderError> for AuthError {
    fn from(err: AuthProviderError) -> Self {
        match err {
            AuthProviderError::InvalidCredentials => AuthError::InvalidCredentials,
            AuthProviderError::EmailNotConfirmed => AuthError::EmailNotConfirmed,
            AuthProviderError::AlreadyRegistered => AuthError::AlreadyRegistered,
            AuthProviderError::Captcha(_) => AuthError::CaptchaRequired,
            AuthProviderError::RateLimited => AuthError::RateLimited,
            other => AuthError::Unexpected(other.to_string()),
        }
    }
}

pub struct AuthGuard {
    provider: Arc<dyn AuthProvider>,
    attempt_log: Option<Arc<dyn AttemptLog>>,
    clock: Arc<dyn Clock>,
    policy: GuardPolicy,
    state: LoginAttemptState,
}

impl AuthGuard {
    pub fn new(provider: Arc<dyn AuthProvider>, clock: Arc<dyn Clock>, policy: GuardPolicy) -> Self {
        Self {
            provider,
            attempt_log: None,
            clock,
            policy,
            state: LoginAttemptState::default(),
        }
    }

    pub fn with_attempt_log(mut self, log: Arc<dyn AttemptLog>) -> Self {
        self.attempt_log = Some(log);
        self
    }

    pub fn state(&self) -> &LoginAttemptState {
        &self.state
    }

    pub fn policy(&self) -> &GuardPolicy {
        &self.policy
    }

    pub fn set_captcha_policy(&mut self, captcha: CaptchaPolicy) {
        tracing::info!(?captcha, "Captcha policy changed");
        self.policy.captcha = captcha;
    }

    /// Raw lock flag. Stays set after the window ends until the next submit.
    pub fn is_locked(&self) -> bool {
        self.state.is_locked
    }

    /// Time left on an active lock at `now`, or `None` if unlocked or expired.
    pub fn remaining_lock(&self, now: DateTime<Utc>) -> Option<Duration> {
        let end = self.state.lock_end_time.filter(|_| self.state.is_locked)?;
        let left = end - now;
        (left > Duration::zero()).then_some(left)
    }

    pub fn captcha_required(&self) -> bool {
        self.policy.captcha.requires_token(self.state.failed_attempts)
    }

    pub fn set_captcha_token(&mut self, token: impl Into<String>) {
        self.state.captcha_token = Some(token.into());
    }

    /// Drop the token, e.g. when the CAPTCHA widget reports it expired.
    pub fn clear_captcha_token(&mut self) {
        self.state.captcha_token = None;
    }

    pub async fn submit(&mut self, request: &AuthRequest) -> Result<AuthOutcome, AuthError> {
        let now = self.clock.now();

        if self.state.is_locked {
            match self.state.lock_end_time {
                Some(end) if now < end => {
                    let remaining_minutes = ((end - now).num_seconds() + 59) / 60;
                    tracing::warn!(
                        email = %request.email,
                        remaining_minutes,
                        "Rejected submission while locked"
                    );
                    return Err(AuthError::Locked {
                        remaining_minutes: remaining_minutes.max(1),
                    });
                }
                _ => {
                    tracing::debug!("Lock window elapsed, resetting attempt counter");
                    self.state.is_locked = false;
                    self.state.lock_end_time = None;
                    self.state.failed_attempts = 0;
                }
            }
        }

        self.validate(request)?;

        if self.captcha_required() && self.state.captcha_token.is_none() {
            return Err(AuthError::CaptchaRequired);
        }

        let captcha = self.state.captcha_token.clone();
        let result = match request.mode {
            AuthMode::SignIn => self
                .provider
                .sign_in(&request.email, &request.password, captcha.as_deref())
                .await
                .map(AuthOutcome::SignedIn),
            AuthMode::SignUp => {
                self.provider
                    .sign_up(&request.email, &request.password, captcha.as_deref())
                    .await
            }
        };

        match result {
            Ok(outcome) => {
                self.state = LoginAttemptState::default();
                tracing::info!(email = %request.email, mode = ?request.mode, "Authentication succeeded");
                Ok(outcome)
            }
            Err(err) => {
                self.record_failure(&request.email, &err, now).await;
                Err(err.into())
            }
        }
    }

    pub async fn sign_out(&self) -> Result<(), AuthError> {
        self.provider.sign_out().await.map_err(AuthError::from)
    }

    fn validate(&self, request: &AuthRequest) -> Result<(), AuthError> {
        if !EMAIL_PATTERN.is_match(request.email.trim()) {
            return Err(AuthError::InvalidEmail);
        }
        if request.password.chars().count() < self.policy.min_password_len {
            return Err(AuthError::PasswordTooShort {
                min: self.policy.min_password_len,
            });
        }
        if request.mode == AuthMode::SignUp
            && request.confirm_password.as_deref() != Some(request.password.as_str())
        {
            return Err(AuthError::PasswordMismatch);
        }
        Ok(())
    }

    async fn record_failure(&mut self, email: &str, err: &AuthProviderError, now: DateTime<Utc>) {
        self.state.failed_attempts += 1;
        self.clear_captcha_token();

        if self.state.failed_attempts >= self.policy.max_attempts {
            self.state.is_locked = true;
            self.state.lock_end_time = Some(now + self.policy.lock_duration);
            tracing::warn!(
                email = %email,
                failed_attempts = self.state.failed_attempts,
                "Too many failed attempts, locking"
            );
        } else {
            tracing::debug!(
                email = %email,
                failed_attempts = self.state.failed_attempts,
                error = %err,
                "Authentication failed"
            );
        }

        if let Some(log) = &self.attempt_log {
            if let Err(e) = log.record_failed_attempt(email, err.code(), now).await {
                tracing::error!("Failed to record login attempt: {}", e);
            }
        }
    }
}
