use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{Conversation, Message};

/// Row-level access to conversations and messages. Every call is scoped to
/// an owner; rows belonging to other users are invisible.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn insert_conversation(&self, conversation: &Conversation) -> Result<()>;

    async fn get_conversation(&self, owner_id: &str, id: &str) -> Result<Option<Conversation>>;

    /// Most recently updated first.
    async fn list_conversations(&self, owner_id: &str) -> Result<Vec<Conversation>>;

    async fn update_conversation_title(&self, owner_id: &str, id: &str, title: &str)
        -> Result<()>;

    /// Removes the conversation and all of its messages atomically.
    async fn delete_conversation(&self, owner_id: &str, id: &str) -> Result<()>;

    /// Appends a message and bumps the parent conversation's `updated_at`.
    async fn insert_message(&self, owner_id: &str, message: &Message) -> Result<()>;

    /// Oldest first.
    async fn list_messages(&self, owner_id: &str, conversation_id: &str) -> Result<Vec<Message>>;

    async fn count_messages(&self, owner_id: &str, conversation_id: &str) -> Result<usize>;
}

/// Server-side mirror of failed sign-in attempts. Written on every failure,
/// never consulted by the lockout logic.
#[async_trait]
pub trait AttemptLog: Send + Sync {
    async fn record_failed_attempt(
        &self,
        email: &str,
        reason: &str,
        attempted_at: DateTime<Utc>,
    ) -> Result<()>;
}
