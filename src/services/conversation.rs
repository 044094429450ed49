use std::sync::Arc;

use anyhow::Context;
use thiserror::Error;
use tokio::sync::watch;

use crate::models::{Attachment, Conversation, Message, Role, Session};
use crate::providers::CompletionService;
use crate::services::attachments;
use crate::services::export;
use crate::services::store::ChatStore;

/// Stored as the assistant reply whenever the completion service fails.
pub const FALLBACK_REPLY: &str =
    "Desculpe, ocorreu um erro ao processar sua mensagem. Por favor, tente novamente.";

const TITLE_MAX_CHARS: usize = 50;

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("A message is already being processed")]
    Busy,

    #[error("Message is empty")]
    EmptyMessage,

    #[error("Title is empty")]
    EmptyTitle,

    #[error("Conversation not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ConversationError>;

/// Snapshot of everything the chat screen renders.
#[derive(Debug, Clone, Default)]
pub struct ConversationView {
    pub conversations: Vec<Conversation>,
    pub active_conversation_id: Option<String>,
    pub messages: Vec<Message>,
    pub is_processing: bool,
}

/// The pair of messages persisted by one successful send.
#[derive(Debug, Clone)]
pub struct SentExchange {
    pub conversation_id: String,
    pub user_message: Message,
    pub assistant_message: Message,
}

/// Derive a conversation title from the first message: the first 50
/// characters followed by an ellipsis when longer.
pub fn truncate_title(text: &str) -> String {
    if text.chars().count() > TITLE_MAX_CHARS {
        let head: String = text.chars().take(TITLE_MAX_CHARS).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

/// Clears `is_processing` however the send ends.
struct ProcessingGuard<'a>(&'a watch::Sender<ConversationView>);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|view| view.is_processing = false);
    }
}

pub struct ConversationManager {
    session: Session,
    store: Arc<dyn ChatStore>,
    completion: Arc<dyn CompletionService>,
    view: watch::Sender<ConversationView>,
}

impl ConversationManager {
    pub fn new(
        session: Session,
        store: Arc<dyn ChatStore>,
        completion: Arc<dyn CompletionService>,
    ) -> Self {
        let (view, _) = watch::channel(ConversationView::default());
        Self {
            session,
            store,
            completion,
            view,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn view(&self) -> ConversationView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConversationView> {
        self.view.subscribe()
    }

    fn owner(&self) -> &str {
        &self.session.user_id
    }

    fn active_id(&self) -> Option<String> {
        self.view.borrow().active_conversation_id.clone()
    }

    /// Reload the owner's conversations, newest activity first. On failure the
    /// local list is emptied and the error returned.
    pub async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        match self.store.list_conversations(self.owner()).await {
            Ok(conversations) => {
                let snapshot = conversations.clone();
                self.view.send_modify(|view| view.conversations = snapshot);
                Ok(conversations)
            }
            Err(e) => {
                tracing::error!("Failed to load conversations: {:#}", e);
                self.view.send_modify(|view| view.conversations.clear());
                Err(e.into())
            }
        }
    }

    /// Make `id` the active conversation and load its messages. `None`
    /// clears the selection without touching the store.
    pub async fn select_conversation(&self, id: Option<&str>) -> Result<()> {
        let Some(id) = id else {
            self.view.send_modify(|view| {
                view.active_conversation_id = None;
                view.messages.clear();
            });
            return Ok(());
        };

        if self.store.get_conversation(self.owner(), id).await?.is_none() {
            return Err(ConversationError::NotFound(id.to_string()));
        }

        self.view.send_modify(|view| {
            view.active_conversation_id = Some(id.to_string());
            view.messages.clear();
        });
        self.refresh_messages(id).await
    }

    /// Insert an empty conversation. The caller decides whether to select it.
    pub async fn create_conversation(&self, title: Option<&str>) -> Result<Conversation> {
        let conversation = Conversation::new(self.owner(), title);
        self.store
            .insert_conversation(&conversation)
            .await
            .context("Failed to create conversation")?;
        tracing::debug!(conversation_id = %conversation.id, "Conversation created");
        Ok(conversation)
    }

    /// Persist a user message, obtain the assistant's reply and persist it.
    ///
    /// Targets `conversation_id`, else the active conversation, else a new
    /// conversation which becomes active. Attachments are folded into the
    /// message text. A failed completion is stored as [`FALLBACK_REPLY`].
    pub async fn send_message(
        &self,
        content: &str,
        conversation_id: Option<&str>,
        attachments: &[Attachment],
    ) -> Result<SentExchange> {
        if content.trim().is_empty() && attachments.is_empty() {
            return Err(ConversationError::EmptyMessage);
        }

        let acquired = self.view.send_if_modified(|view| {
            if view.is_processing {
                false
            } else {
                view.is_processing = true;
                true
            }
        });
        if !acquired {
            return Err(ConversationError::Busy);
        }
        let _processing = ProcessingGuard(&self.view);

        let conversation_id = match conversation_id.map(str::to_string).or_else(|| self.active_id()) {
            Some(id) => id,
            None => {
                let conversation = self.create_conversation(None).await?;
                self.view.send_modify(|view| {
                    view.active_conversation_id = Some(conversation.id.clone());
                    view.messages.clear();
                });
                conversation.id
            }
        };

        let augmented = attachments::augment_content(content, attachments);
        let user_message = Message::new(&conversation_id, Role::User, augmented.clone());
        self.store
            .insert_message(self.owner(), &user_message)
            .await
            .context("Failed to save user message")?;

        self.set_title_if_first(&conversation_id, content, attachments)
            .await;
        self.refresh_if_active(&conversation_id).await;

        let reply = match self.completion.complete(&augmented).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => {
                tracing::warn!(conversation_id = %conversation_id, "Empty completion, using fallback reply");
                FALLBACK_REPLY.to_string()
            }
            Err(e) => {
                tracing::warn!(conversation_id = %conversation_id, "Completion failed, using fallback reply: {}", e);
                FALLBACK_REPLY.to_string()
            }
        };

        let assistant_message = Message::new(&conversation_id, Role::Assistant, reply);
        self.store
            .insert_message(self.owner(), &assistant_message)
            .await
            .context("Failed to save assistant message")?;

        // Failures are logged inside; the exchange itself is already stored.
        let _ = self.list_conversations().await;
        self.refresh_if_active(&conversation_id).await;

        Ok(SentExchange {
            conversation_id,
            user_message,
            assistant_message,
        })
    }

    /// Delete a conversation together with its messages.
    pub async fn delete_conversation(&self, id: &str) -> Result<()> {
        self.store
            .delete_conversation(self.owner(), id)
            .await
            .context("Failed to delete conversation")?;

        self.view.send_modify(|view| {
            view.conversations.retain(|c| c.id != id);
            if view.active_conversation_id.as_deref() == Some(id) {
                view.active_conversation_id = None;
                view.messages.clear();
            }
        });
        tracing::info!(conversation_id = %id, "Conversation deleted");

        let _ = self.list_conversations().await;
        Ok(())
    }

    pub async fn rename_conversation(&self, id: &str, title: &str) -> Result<()> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ConversationError::EmptyTitle);
        }
        self.store
            .update_conversation_title(self.owner(), id, title)
            .await
            .context("Failed to rename conversation")?;
        let _ = self.list_conversations().await;
        Ok(())
    }

    pub async fn export_markdown(&self, id: &str) -> Result<String> {
        let conversation = self
            .store
            .get_conversation(self.owner(), id)
            .await?
            .ok_or_else(|| ConversationError::NotFound(id.to_string()))?;
        let messages = self.store.list_messages(self.owner(), id).await?;
        Ok(export::export_to_markdown(&conversation, &messages))
    }

    async fn set_title_if_first(&self, conversation_id: &str, content: &str, attachments: &[Attachment]) {
        match self.store.count_messages(self.owner(), conversation_id).await {
            Ok(1) => {}
            Ok(_) => return,
            Err(e) => {
                tracing::warn!("Failed to count messages: {:#}", e);
                return;
            }
        }

        let source = if content.trim().is_empty() {
            attachments.first().map(|a| a.filename.as_str()).unwrap_or(content)
        } else {
            content
        };
        let title = truncate_title(source);
        if let Err(e) = self
            .store
            .update_conversation_title(self.owner(), conversation_id, &title)
            .await
        {
            tracing::warn!("Failed to set conversation title: {:#}", e);
        }
    }

    async fn refresh_messages(&self, conversation_id: &str) -> Result<()> {
        let messages = self
            .store
            .list_messages(self.owner(), conversation_id)
            .await
            .context("Failed to load messages")?;
        self.view.send_modify(|view| {
            if view.active_conversation_id.as_deref() == Some(conversation_id) {
                view.messages = messages;
            }
        });
        Ok(())
    }

    async fn refresh_if_active(&self, conversation_id: &str) {
        if self.active_id().as_deref() != Some(conversation_id) {
            return;
        }
        if let Err(e) = self.refresh_messages(conversation_id).await {
            tracing::error!("{:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::database::Database;
    use crate::services::testing::{session_for, FakeCompletion, FlakyStore};
    use std::sync::atomic::Ordering;

    const REPLY: &str = "A onça-pintada (Panthera onca) é o maior felino das Américas.";

    fn manager_with(store: Arc<dyn ChatStore>, completion: Arc<dyn CompletionService>) -> ConversationManager {
        ConversationManager::new(session_for("ana@example.com"), store, completion)
    }

    fn manager() -> (ConversationManager, Database) {
        let db = Database::new_in_memory().unwrap();
        let manager = manager_with(Arc::new(db.clone()), Arc::new(FakeCompletion::replying(REPLY)));
        (manager, db)
    }

    #[tokio::test]
    async fn test_first_send_creates_and_selects_conversation() {
        let (manager, _) = manager();

        let exchange = manager
            .send_message("What is a jaguar?", None, &[])
            .await
            .unwrap();

        let view = manager.view();
        assert_eq!(view.active_conversation_id.as_deref(), Some(exchange.conversation_id.as_str()));
        assert!(!view.is_processing);
        assert_eq!(view.conversations.len(), 1);
        assert_eq!(view.conversations[0].title, "What is a jaguar?");

        assert_eq!(view.messages.len(), 2);
        assert_eq!(view.messages[0].role, Role::User);
        assert_eq!(view.messages[0].content, "What is a jaguar?");
        assert_eq!(view.messages[1].role, Role::Assistant);
        assert_eq!(view.messages[1].content, REPLY);
    }

    #[tokio::test]
    async fn test_each_send_appends_exactly_two_messages() {
        let (manager, db) = manager();
        let first = manager.send_message("Olá", None, &[]).await.unwrap();
        manager.send_message("E o lobo-guará?", None, &[]).await.unwrap();

        let messages = db
            .list_messages(&manager.session().user_id, &first.conversation_id)
            .await
            .unwrap();
        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User, Role::Assistant]);
    }

    #[tokio::test]
    async fn test_title_set_once_from_first_message() {
        let (manager, _) = manager();
        let long = "Quais espécies de aves migratórias passam pelo Pantanal durante o inverno?";

        let exchange = manager.send_message(long, None, &[]).await.unwrap();
        manager
            .send_message("Outra pergunta qualquer", Some(&exchange.conversation_id), &[])
            .await
            .unwrap();

        let title = &manager.view().conversations[0].title;
        assert_eq!(title, &format!("{}...", long.chars().take(50).collect::<String>()));
    }

    #[test]
    fn test_truncate_title() {
        let exactly_fifty = "a".repeat(50);
        assert_eq!(truncate_title(&exactly_fifty), exactly_fifty);
        assert_eq!(truncate_title(&"b".repeat(51)), format!("{}...", "b".repeat(50)));
        // Counted in characters, not bytes.
        let accents = "ç".repeat(60);
        assert_eq!(truncate_title(&accents), format!("{}...", "ç".repeat(50)));
    }

    #[tokio::test]
    async fn test_completion_failure_stores_fallback() {
        let db = Database::new_in_memory().unwrap();
        let manager = manager_with(Arc::new(db), Arc::new(FakeCompletion::failing()));

        let exchange = manager.send_message("Oi", None, &[]).await.unwrap();
        assert_eq!(exchange.assistant_message.content, FALLBACK_REPLY);
        assert_eq!(manager.view().messages[1].content, FALLBACK_REPLY);
    }

    #[tokio::test]
    async fn test_blank_completion_stores_fallback() {
        let db = Database::new_in_memory().unwrap();
        let manager = manager_with(Arc::new(db), Arc::new(FakeCompletion::replying("   ")));

        let exchange = manager.send_message("Oi", None, &[]).await.unwrap();
        assert_eq!(exchange.assistant_message.content, FALLBACK_REPLY);
    }

    #[tokio::test]
    async fn test_csv_attachment_is_folded_into_message() {
        let db = Database::new_in_memory().unwrap();
        let completion = Arc::new(FakeCompletion::replying(REPLY));
        let manager = manager_with(Arc::new(db), completion.clone());
        let csv = Attachment::new("censo.csv", "text/csv", b"especie,total\nararinha-azul,12\n".to_vec());

        let exchange = manager.send_message("Analyze this", None, &[csv]).await.unwrap();
        let content = &exchange.user_message.content;

        assert!(content.starts_with("Analyze this"));
        assert!(content.contains("=== PLANILHA CSV: censo.csv ===\nespecie,total\nararinha-azul,12"));
        assert_eq!(completion.prompts(), vec![content.clone()]);
        assert_eq!(manager.view().conversations[0].title, "Analyze this");
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let (manager, db) = manager();
        let result = manager.send_message("   ", None, &[]).await;
        assert!(matches!(result, Err(ConversationError::EmptyMessage)));
        assert!(db
            .list_conversations(&manager.session().user_id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_explicit_target_leaves_active_view_alone() {
        let (manager, _) = manager();
        let active = manager.send_message("primeira", None, &[]).await.unwrap();
        let other = manager.create_conversation(Some("Outra")).await.unwrap();

        manager
            .send_message("para a outra", Some(&other.id), &[])
            .await
            .unwrap();

        let view = manager.view();
        assert_eq!(view.active_conversation_id.as_deref(), Some(active.conversation_id.as_str()));
        assert!(view.messages.iter().all(|m| m.conversation_id == active.conversation_id));
        // Most recently updated first.
        assert_eq!(view.conversations[0].id, other.id);
        assert_eq!(view.conversations[0].title, "para a outra");
    }

    #[tokio::test]
    async fn test_create_does_not_select() {
        let (manager, _) = manager();
        let conversation = manager.create_conversation(None).await.unwrap();
        assert_eq!(conversation.title, "New Conversation");
        assert!(manager.view().active_conversation_id.is_none());

        manager.select_conversation(Some(&conversation.id)).await.unwrap();
        assert_eq!(manager.view().active_conversation_id, Some(conversation.id));
    }

    #[tokio::test]
    async fn test_select_none_never_fetches() {
        let store = Arc::new(FlakyStore::new(Database::new_in_memory().unwrap()));
        let manager = manager_with(store.clone(), Arc::new(FakeCompletion::replying(REPLY)));
        manager.send_message("Oi", None, &[]).await.unwrap();
        let reads = store.message_reads();

        manager.select_conversation(None).await.unwrap();
        assert!(manager.view().messages.is_empty());
        manager.select_conversation(None).await.unwrap();
        assert!(manager.view().messages.is_empty());
        assert!(manager.view().active_conversation_id.is_none());

        assert_eq!(store.message_reads(), reads);
    }

    #[tokio::test]
    async fn test_select_foreign_conversation_rejected() {
        let db = Database::new_in_memory().unwrap();
        let foreign = Conversation::new("someone-else", Some("Privada"));
        db.insert_conversation(&foreign).await.unwrap();
        let manager = manager_with(Arc::new(db), Arc::new(FakeCompletion::replying(REPLY)));

        let result = manager.select_conversation(Some(&foreign.id)).await;
        assert!(matches!(result, Err(ConversationError::NotFound(_))));
        assert!(manager.view().active_conversation_id.is_none());

        let result = manager.send_message("invasão", Some(&foreign.id), &[]).await;
        assert!(matches!(result, Err(ConversationError::Store(_))));
        assert!(!manager.view().is_processing);
    }

    #[tokio::test]
    async fn test_list_failure_is_reported() {
        let store = Arc::new(FlakyStore::new(Database::new_in_memory().unwrap()));
        let manager = manager_with(store.clone(), Arc::new(FakeCompletion::replying(REPLY)));
        manager.send_message("Oi", None, &[]).await.unwrap();
        assert_eq!(manager.view().conversations.len(), 1);

        store.fail_reads.store(true, Ordering::SeqCst);
        assert!(manager.list_conversations().await.is_err());
        assert!(manager.view().conversations.is_empty());

        store.fail_reads.store(false, Ordering::SeqCst);
        assert_eq!(manager.list_conversations().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_active_conversation() {
        let (manager, db) = manager();
        let exchange = manager.send_message("Oi", None, &[]).await.unwrap();
        let owner = manager.session().user_id.clone();

        manager.delete_conversation(&exchange.conversation_id).await.unwrap();

        let view = manager.view();
        assert!(view.active_conversation_id.is_none());
        assert!(view.messages.is_empty());
        assert!(manager
            .list_conversations()
            .await
            .unwrap()
            .iter()
            .all(|c| c.id != exchange.conversation_id));
        assert_eq!(db.count_messages(&owner, &exchange.conversation_id).await.unwrap(), 0);

        assert!(manager.delete_conversation(&exchange.conversation_id).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_send_is_rejected() {
        use async_trait::async_trait;
        use tokio::sync::Notify;

        struct GatedCompletion(Notify);

        #[async_trait]
        impl CompletionService for GatedCompletion {
            async fn complete(&self, _prompt: &str) -> std::result::Result<String, crate::providers::ProviderError> {
                self.0.notified().await;
                Ok(REPLY.to_string())
            }
        }

        let gate = Arc::new(GatedCompletion(Notify::new()));
        let db = Database::new_in_memory().unwrap();
        let manager = manager_with(Arc::new(db), gate.clone());
        let mut updates = manager.subscribe();

        let first = manager.send_message("primeira", None, &[]);
        let second = async {
            // Wait until the first send is in flight.
            updates.wait_for(|view| view.is_processing).await.unwrap();
            let result = manager.send_message("segunda", None, &[]).await;
            gate.0.notify_one();
            result
        };
        let (first, second) = tokio::join!(first, second);

        assert!(first.is_ok());
        assert!(matches!(second, Err(ConversationError::Busy)));
        assert!(!manager.view().is_processing);
        assert_eq!(manager.view().messages.len(), 2);
    }

    #[tokio::test]
    async fn test_rename_and_export() {
        let (manager, _) = manager();
        let exchange = manager.send_message("What is a jaguar?", None, &[]).await.unwrap();

        manager
            .rename_conversation(&exchange.conversation_id, "Onças")
            .await
            .unwrap();
        assert_eq!(manager.view().conversations[0].title, "Onças");

        let result = manager.rename_conversation(&exchange.conversation_id, "   ").await;
        assert!(matches!(result, Err(ConversationError::EmptyTitle)));
        assert_eq!(manager.view().conversations[0].title, "Onças");

        let markdown = manager.export_markdown(&exchange.conversation_id).await.unwrap();
        assert!(markdown.starts_with("# Onças"));
        assert!(markdown.contains("What is a jaguar?"));
        assert!(markdown.contains(REPLY));
    }
}
