use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::task;

use crate::models::{Conversation, Message, Role};
use crate::services::store::{AttemptLog, ChatStore};

#[derive(Debug, Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;

        tracing::info!(path = %path.display(), "Database ready");
        Ok(db)
    }

    /// Create an in-memory database (used for testing)
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    pub fn default_path() -> Result<PathBuf> {
        let data_dir = match std::env::var("XDG_DATA_HOME") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => {
                let home = std::env::var("HOME").context("HOME not set")?;
                PathBuf::from(home).join(".local/share")
            }
        };
        Ok(data_dir.join("biochat").join("biochat.db"))
    }

    fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
        conn.lock().map_err(|_| anyhow!("Database connection lock poisoned"))
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = Self::lock(&self.conn)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL
            );",
        )?;

        let version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if version < 1 {
            conn.execute_batch(
                "CREATE TABLE conversations (
                    id TEXT PRIMARY KEY,
                    owner_id TEXT NOT NULL,
                    title TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE messages (
                    id TEXT PRIMARY KEY,
                    conversation_id TEXT NOT NULL,
                    role TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
                    content TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
                );

                CREATE INDEX idx_conversations_owner ON conversations(owner_id, updated_at DESC);
                CREATE INDEX idx_messages_conversation ON messages(conversation_id, created_at);

                INSERT INTO schema_version (version) VALUES (1);",
            )?;
        }

        if version < 2 {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS login_attempts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    email TEXT NOT NULL,
                    reason TEXT NOT NULL,
                    attempted_at TEXT NOT NULL
                );
                CREATE INDEX idx_login_attempts_email ON login_attempts(email);

                UPDATE schema_version SET version = 2;",
            )?;
        }

        Ok(())
    }

    // --- Settings ---

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.clone();
        let key = key.to_string();
        task::spawn_blocking(move || {
            let conn = Self::lock(&conn)?;
            let result: Option<String> = conn
                .query_row(
                    "SELECT value FROM settings WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(result)
        })
        .await?
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.clone();
        let key = key.to_string();
        let value = value.to_string();
        task::spawn_blocking(move || {
            let conn = Self::lock(&conn)?;
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = ?2",
                params![key, value],
            )?;
            Ok(())
        })
        .await?
    }

    // --- Login attempts ---

    pub async fn count_failed_attempts(&self, email: &str) -> Result<usize> {
        let conn = self.conn.clone();
        let email = email.to_string();
        task::spawn_blocking(move || {
            let conn = Self::lock(&conn)?;
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM login_attempts WHERE email = ?1",
                params![email],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await?
    }

    // --- Row helpers ---

    fn row_to_conversation(row: &rusqlite::Row) -> Result<Conversation> {
        let created_str: String = row.get(3)?;
        let updated_str: String = row.get(4)?;

        Ok(Conversation {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            title: row.get(2)?,
            created_at: parse_timestamp(&created_str)?,
            updated_at: parse_timestamp(&updated_str)?,
        })
    }

    fn row_to_message(row: &rusqlite::Row) -> Result<Message> {
        let role_str: String = row.get(2)?;
        let created_str: String = row.get(4)?;

        Ok(Message {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            role: Role::from_str(&role_str)
                .ok_or_else(|| anyhow!("Unknown role: {}", role_str))?,
            content: row.get(3)?,
            created_at: parse_timestamp(&created_str)?,
        })
    }
}

/// Fixed-width RFC 3339 so lexical order matches chronological order.
fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

#[async_trait]
impl ChatStore for Database {
    async fn insert_conversation(&self, conversation: &Conversation) -> Result<()> {
        let conn = self.conn.clone();
        let conv = conversation.clone();
        task::spawn_blocking(move || {
            let conn = Self::lock(&conn)?;
            conn.execute(
                "INSERT INTO conversations (id, owner_id, title, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    conv.id,
                    conv.owner_id,
                    conv.title,
                    timestamp(&conv.created_at),
                    timestamp(&conv.updated_at),
                ],
            )?;
            Ok(())
        })
        .await?
    }

    async fn get_conversation(&self, owner_id: &str, id: &str) -> Result<Option<Conversation>> {
        let conn = self.conn.clone();
        let owner_id = owner_id.to_string();
        let id = id.to_string();
        task::spawn_blocking(move || {
            let conn = Self::lock(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT id, owner_id, title, created_at, updated_at
                 FROM conversations WHERE id = ?1 AND owner_id = ?2",
            )?;
            let result = stmt
                .query_row(params![id, owner_id], |row| Ok(Self::row_to_conversation(row)))
                .optional()?;
            result.transpose()
        })
        .await?
    }

    async fn list_conversations(&self, owner_id: &str) -> Result<Vec<Conversation>> {
        let conn = self.conn.clone();
        let owner_id = owner_id.to_string();
        task::spawn_blocking(move || {
            let conn = Self::lock(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT id, owner_id, title, created_at, updated_at
                 FROM conversations WHERE owner_id = ?1 ORDER BY updated_at DESC, rowid DESC",
            )?;
            let conversations = stmt
                .query_map(params![owner_id], |row| Ok(Self::row_to_conversation(row)))?
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .collect::<Result<Vec<_>, _>>()?;
            Ok(conversations)
        })
        .await?
    }

    async fn update_conversation_title(
        &self,
        owner_id: &str,
        id: &str,
        title: &str,
    ) -> Result<()> {
        let conn = self.conn.clone();
        let owner_id = owner_id.to_string();
        let id = id.to_string();
        let title = title.to_string();
        task::spawn_blocking(move || {
            let conn = Self::lock(&conn)?;
            let updated = conn.execute(
                "UPDATE conversations SET title = ?1, updated_at = ?2 WHERE id = ?3 AND owner_id = ?4",
                params![title, timestamp(&Utc::now()), id, owner_id],
            )?;
            if updated == 0 {
                bail!("Conversation not found: {}", id);
            }
            Ok(())
        })
        .await?
    }

    async fn delete_conversation(&self, owner_id: &str, id: &str) -> Result<()> {
        let conn = self.conn.clone();
        let owner_id = owner_id.to_string();
        let id = id.to_string();
        task::spawn_blocking(move || {
            let mut conn = Self::lock(&conn)?;
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM messages WHERE conversation_id IN
                    (SELECT id FROM conversations WHERE id = ?1 AND owner_id = ?2)",
                params![id, owner_id],
            )?;
            let deleted = tx.execute(
                "DELETE FROM conversations WHERE id = ?1 AND owner_id = ?2",
                params![id, owner_id],
            )?;
            if deleted == 0 {
                // Dropping the transaction rolls back.
                bail!("Conversation not found: {}", id);
            }
            tx.commit()?;
            Ok(())
        })
        .await?
    }

    async fn insert_message(&self, owner_id: &str, message: &Message) -> Result<()> {
        let conn = self.conn.clone();
        let owner_id = owner_id.to_string();
        let msg = message.clone();
        task::spawn_blocking(move || {
            let mut conn = Self::lock(&conn)?;
            let tx = conn.transaction()?;
            let inserted = tx.execute(
                "INSERT INTO messages (id, conversation_id, role, content, created_at)
                 SELECT ?1, id, ?3, ?4, ?5 FROM conversations WHERE id = ?2 AND owner_id = ?6",
                params![
                    msg.id,
                    msg.conversation_id,
                    msg.role.as_str(),
                    msg.content,
                    timestamp(&msg.created_at),
                    owner_id,
                ],
            )?;
            if inserted == 0 {
                bail!("Conversation not found: {}", msg.conversation_id);
            }
            tx.execute(
                "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                params![timestamp(&msg.created_at), msg.conversation_id],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await?
    }

    async fn list_messages(&self, owner_id: &str, conversation_id: &str) -> Result<Vec<Message>> {
        let conn = self.conn.clone();
        let owner_id = owner_id.to_string();
        let conversation_id = conversation_id.to_string();
        task::spawn_blocking(move || {
            let conn = Self::lock(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT m.id, m.conversation_id, m.role, m.content, m.created_at
                 FROM messages m JOIN conversations c ON c.id = m.conversation_id
                 WHERE m.conversation_id = ?1 AND c.owner_id = ?2
                 ORDER BY m.created_at ASC, m.rowid ASC",
            )?;
            let messages = stmt
                .query_map(params![conversation_id, owner_id], |row| {
                    Ok(Self::row_to_message(row))
                })?
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .collect::<Result<Vec<_>, _>>()?;
            Ok(messages)
        })
        .await?
    }

    async fn count_messages(&self, owner_id: &str, conversation_id: &str) -> Result<usize> {
        let conn = self.conn.clone();
        let owner_id = owner_id.to_string();
        let conversation_id = conversation_id.to_string();
        task::spawn_blocking(move || {
            let conn = Self::lock(&conn)?;
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages m JOIN conversations c ON c.id = m.conversation_id
                 WHERE m.conversation_id = ?1 AND c.owner_id = ?2",
                params![conversation_id, owner_id],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await?
    }
}

#[async_trait]
impl AttemptLog for Database {
    async fn record_failed_attempt(
        &self,
        email: &str,
        reason: &str,
        attempted_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.clone();
        let email = email.to_string();
        let reason = reason.to_string();
        task::spawn_blocking(move || {
            let conn = Self::lock(&conn)?;
            conn.execute(
                "INSERT INTO login_attempts (email, reason, attempted_at) VALUES (?1, ?2, ?3)",
                params![email, reason, timestamp(&attempted_at)],
            )?;
            Ok(())
        })
        .await?
    }
}
