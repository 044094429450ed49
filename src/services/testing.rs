//! In-process stand-ins for the remote collaborators.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::broadcast;

use crate::models::{AuthOutcome, Conversation, Message, Session, SessionEvent};
use crate::providers::{AuthProvider, AuthProviderError, CompletionService, ProviderError};
use crate::services::database::Database;
use crate::services::store::ChatStore;

pub const GOOD_PASSWORD: &str = "correct-horse";

pub fn session_for(email: &str) -> Session {
    Session {
        user_id: format!("user:{}", email),
        email: email.to_string(),
        access_token: "access".to_string(),
        refresh_token: "refresh".to_string(),
        expires_at: None,
    }
}

/// Accepts `GOOD_PASSWORD` for any account; rejects `TAKEN_EMAIL` on sign-up.
pub struct FakeAuthProvider {
    calls: AtomicUsize,
    refreshes: AtomicUsize,
    last_captcha: Mutex<Option<String>>,
    session: Mutex<Option<Session>>,
    events: broadcast::Sender<SessionEvent>,
}

impl FakeAuthProvider {
    pub const TAKEN_EMAIL: &'static str = "taken@example.com";

    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            calls: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
            last_captcha: Mutex::new(None),
            session: Mutex::new(None),
            events,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    /// Install a session without announcing it.
    pub fn set_session(&self, session: Session) {
        *self.session.lock().unwrap() = Some(session);
    }

    pub fn last_captcha(&self) -> Option<String> {
        self.last_captcha.lock().unwrap().clone()
    }

    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn record_call(&self, captcha_token: Option<&str>) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_captcha.lock().unwrap() = captcha_token.map(str::to_string);
    }

    fn start_session(&self, email: &str) -> Session {
        let session = session_for(email);
        *self.session.lock().unwrap() = Some(session.clone());
        self.emit(SessionEvent::SignedIn(session.clone()));
        session
    }
}

#[async_trait]
impl AuthProvider for FakeAuthProvider {
    async fn sign_in(
        &self,
        email: &str,
        password: &str,
        captcha_token: Option<&str>,
    ) -> Result<Session, AuthProviderError> {
        self.record_call(captcha_token);
        if password != GOOD_PASSWORD {
            return Err(AuthProviderError::InvalidCredentials);
        }
        Ok(self.start_session(email))
    }

    async fn sign_up(
        &self,
        email: &str,
        _password: &str,
        captcha_token: Option<&str>,
    ) -> Result<AuthOutcome, AuthProviderError> {
        self.record_call(captcha_token);
        if email == Self::TAKEN_EMAIL {
            return Err(AuthProviderError::AlreadyRegistered);
        }
        Ok(AuthOutcome::SignedIn(self.start_session(email)))
    }

    async fn sign_out(&self) -> Result<(), AuthProviderError> {
        *self.session.lock().unwrap() = None;
        self.emit(SessionEvent::SignedOut);
        Ok(())
    }

    /// Appends `+` to the access token and extends the expiry by an hour.
    async fn refresh_session(&self) -> Result<Session, AuthProviderError> {
        let session = {
            let mut current = self.session.lock().unwrap();
            let session = current
                .as_mut()
                .ok_or_else(|| AuthProviderError::Unexpected("No active session".into()))?;
            session.access_token.push('+');
            session.expires_at = Some(Utc::now() + Duration::hours(1));
            session.clone()
        };
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        self.emit(SessionEvent::TokenRefreshed(session.clone()));
        Ok(session)
    }

    async fn current_session(&self) -> Option<Session> {
        self.session.lock().unwrap().clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

/// Replies with a canned answer, or fails every call when `failing`.
pub struct FakeCompletion {
    reply: String,
    failing: bool,
    prompts: Mutex<Vec<String>>,
}

impl FakeCompletion {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            failing: false,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            reply: String::new(),
            failing: true,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionService for FakeCompletion {
    async fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if self.failing {
            return Err(ProviderError::NetworkError("connection reset".to_string()));
        }
        Ok(self.reply.clone())
    }
}

/// Wraps a real database, counting reads and failing on demand.
pub struct FlakyStore {
    inner: Database,
    pub fail_reads: AtomicBool,
    message_reads: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Database) -> Self {
        Self {
            inner,
            fail_reads: AtomicBool::new(false),
            message_reads: AtomicUsize::new(0),
        }
    }

    pub fn message_reads(&self) -> usize {
        self.message_reads.load(Ordering::SeqCst)
    }

    fn check_reads(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            bail!("connection refused");
        }
        Ok(())
    }
}

#[async_trait]
impl ChatStore for FlakyStore {
    async fn insert_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.inner.insert_conversation(conversation).await
    }

    async fn get_conversation(&self, owner_id: &str, id: &str) -> Result<Option<Conversation>> {
        self.check_reads()?;
        self.inner.get_conversation(owner_id, id).await
    }

    async fn list_conversations(&self, owner_id: &str) -> Result<Vec<Conversation>> {
        self.check_reads()?;
        self.inner.list_conversations(owner_id).await
    }

    async fn update_conversation_title(
        &self,
        owner_id: &str,
        id: &str,
        title: &str,
    ) -> Result<()> {
        self.inner.update_conversation_title(owner_id, id, title).await
    }

    async fn delete_conversation(&self, owner_id: &str, id: &str) -> Result<()> {
        self.inner.delete_conversation(owner_id, id).await
    }

    async fn insert_message(&self, owner_id: &str, message: &Message) -> Result<()> {
        self.inner.insert_message(owner_id, message).await
    }

    async fn list_messages(&self, owner_id: &str, conversation_id: &str) -> Result<Vec<Message>> {
        self.message_reads.fetch_add(1, Ordering::SeqCst);
        self.check_reads()?;
        self.inner.list_messages(owner_id, conversation_id).await
    }

    async fn count_messages(&self, owner_id: &str, conversation_id: &str) -> Result<usize> {
        self.inner.count_messages(owner_id, conversation_id).await
    }
}
