use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::models::Session;
use crate::providers::{AuthProvider, AuthProviderError};

/// Refresh this long before the access token expires.
const REFRESH_MARGIN_SECS: i64 = 60;

/// Follows the auth provider's session events and keeps the latest session.
pub struct SessionTracker {
    provider: Arc<dyn AuthProvider>,
    state: watch::Sender<Option<Session>>,
    cancel_token: CancellationToken,
}

impl SessionTracker {
    /// Seed from the provider's current session, then listen for changes
    /// until shut down.
    pub async fn start(provider: Arc<dyn AuthProvider>) -> Self {
        // Subscribe before reading the current session so no event is missed.
        let mut events = provider.subscribe();
        let (state, _) = watch::channel(provider.current_session().await);
        let cancel_token = CancellationToken::new();

        let task_provider = provider.clone();
        let task_state = state.clone();
        let task_token = cancel_token.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = task_token.cancelled() => break,
                    event = events.recv() => event,
                };

                if task_token.is_cancelled() {
                    break;
                }

                match event {
                    Ok(event) => {
                        tracing::debug!(?event, "Session event");
                        task_state.send_replace(event.session().cloned());
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Session events lagged, resyncing");
                        let session = task_provider.current_session().await;
                        if !task_token.is_cancelled() {
                            task_state.send_replace(session);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!("Session tracker stopped");
        });

        Self {
            provider,
            state,
            cancel_token,
        }
    }

    /// Ask the provider for a new access token when the current one expires
    /// within a minute of `now`. Returns the refreshed session, if any.
    pub async fn refresh_if_expiring(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>, AuthProviderError> {
        let Some(current) = self.current() else {
            return Ok(None);
        };
        if !current.expires_within(now, Duration::seconds(REFRESH_MARGIN_SECS)) {
            return Ok(None);
        }

        tracing::debug!(user_id = %current.user_id, "Access token expiring, refreshing");
        let session = self.provider.refresh_session().await?;
        if !self.cancel_token.is_cancelled() {
            self.state.send_replace(Some(session.clone()));
        }
        Ok(Some(session))
    }

    pub fn current(&self) -> Option<Session> {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.state.subscribe()
    }

    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

impl Drop for SessionTracker {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionEvent;
    use crate::services::testing::{session_for, FakeAuthProvider, GOOD_PASSWORD};

    #[tokio::test]
    async fn test_follows_sign_in_and_out() {
        let provider = Arc::new(FakeAuthProvider::new());
        let tracker = SessionTracker::start(provider.clone()).await;
        let mut updates = tracker.subscribe();
        assert!(tracker.current().is_none());

        provider
            .sign_in("ana@example.com", GOOD_PASSWORD, None)
            .await
            .unwrap();
        updates.wait_for(|s| s.is_some()).await.unwrap();
        assert_eq!(tracker.current().unwrap().email, "ana@example.com");

        provider.sign_out().await.unwrap();
        updates.wait_for(|s| s.is_none()).await.unwrap();
    }

    #[tokio::test]
    async fn test_seeded_with_existing_session() {
        let provider = Arc::new(FakeAuthProvider::new());
        provider
            .sign_in("ana@example.com", GOOD_PASSWORD, None)
            .await
            .unwrap();

        let tracker = SessionTracker::start(provider).await;
        assert_eq!(tracker.current().unwrap().email, "ana@example.com");
    }

    #[tokio::test]
    async fn test_token_refresh_replaces_session() {
        let provider = Arc::new(FakeAuthProvider::new());
        let tracker = SessionTracker::start(provider.clone()).await;
        let mut updates = tracker.subscribe();

        let mut refreshed = session_for("ana@example.com");
        refreshed.access_token = "rotated".to_string();
        provider.emit(SessionEvent::TokenRefreshed(refreshed));

        updates.wait_for(|s| s.is_some()).await.unwrap();
        assert_eq!(tracker.current().unwrap().access_token, "rotated");
    }

    #[tokio::test]
    async fn test_refreshes_expiring_session() {
        let provider = Arc::new(FakeAuthProvider::new());
        let mut expiring = session_for("ana@example.com");
        expiring.expires_at = Some(Utc::now() - Duration::seconds(5));
        provider.set_session(expiring);

        let tracker = SessionTracker::start(provider.clone()).await;
        let refreshed = tracker
            .refresh_if_expiring(Utc::now())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(refreshed.access_token, "access+");
        assert!(refreshed.expires_at.unwrap() > Utc::now());
        assert_eq!(tracker.current(), Some(refreshed));
        assert_eq!(provider.refreshes(), 1);

        // Now valid for an hour.
        assert!(tracker.refresh_if_expiring(Utc::now()).await.unwrap().is_none());
        assert_eq!(provider.refreshes(), 1);
    }

    #[tokio::test]
    async fn test_no_refresh_without_expiry_or_session() {
        let provider = Arc::new(FakeAuthProvider::new());
        let tracker = SessionTracker::start(provider.clone()).await;
        assert!(tracker.refresh_if_expiring(Utc::now()).await.unwrap().is_none());

        provider.set_session(session_for("ana@example.com"));
        let tracker = SessionTracker::start(provider.clone()).await;
        assert!(tracker.refresh_if_expiring(Utc::now()).await.unwrap().is_none());
        assert_eq!(provider.refreshes(), 0);
    }

    #[tokio::test]
    async fn test_no_updates_after_shutdown() {
        let provider = Arc::new(FakeAuthProvider::new());
        let tracker = SessionTracker::start(provider.clone()).await;

        tracker.shutdown();
        provider.emit(SessionEvent::SignedIn(session_for("ana@example.com")));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert!(tracker.current().is_none());
    }
}
