//! Conversation history store.
//!
//! An embedded SQLite store of conversations and their messages, plus a
//! background [`HistoryWriter`] that serializes all appends through a single
//! queue so the request path never contends on database locks. Every
//! rusqlite call runs inside `tokio::task::spawn_blocking`; the async
//! surface itself never blocks.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Title given to conversations before one is inferred or set.
const DEFAULT_TITLE: &str = "New conversation";

/// One stored message of a conversation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StoredMessage {
    pub role: String,
    pub content: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thoughts: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

impl StoredMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            created_at: Utc::now().to_rfc3339(),
            thoughts: None,
            duration: None,
        }
    }

    /// Attach the thought trace that produced this message (builder pattern).
    pub fn with_thoughts(mut self, thoughts: Vec<serde_json::Value>) -> Self {
        self.thoughts = Some(thoughts);
        self
    }

    /// Attach the wall-clock duration in seconds (builder pattern).
    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = Some(duration);
        self
    }
}

/// A conversation with its messages in append order.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
    pub messages: Vec<StoredMessage>,
}

/// List/search row: conversation header plus a tail preview.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
    pub last_message: String,
    pub message_count: usize,
}

/// Store-level error.
#[derive(Debug)]
pub struct HistoryError(pub String);

impl fmt::Display for HistoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "history store error: {}", self.0)
    }
}

impl Error for HistoryError {}

impl From<rusqlite::Error> for HistoryError {
    fn from(e: rusqlite::Error) -> Self {
        HistoryError(e.to_string())
    }
}

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// SQLite-backed conversation store.
///
/// Each operation opens its own connection inside the blocking pool, which
/// keeps the store `Send + Sync` without a connection pool; WAL mode makes
/// concurrent readers cheap.
#[derive(Clone)]
pub struct SqliteHistoryStore {
    db_path: PathBuf,
}

impl SqliteHistoryStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    fn open(&self) -> Result<Connection, HistoryError> {
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, HistoryError>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteHistoryStore) -> Result<T, HistoryError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| HistoryError(format!("blocking task failed: {}", e)))?
    }

    /// Create tables and indexes.
    pub async fn initialize(&self) -> Result<(), HistoryError> {
        if let Some(parent) = self.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| HistoryError(e.to_string()))?;
            }
        }
        self.blocking(|store| {
            let conn = store.open()?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS conversations (
                     id TEXT PRIMARY KEY,
                     title TEXT NOT NULL,
                     created_at TEXT NOT NULL,
                     updated_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS messages (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     conversation_id TEXT NOT NULL,
                     role TEXT NOT NULL,
                     content TEXT NOT NULL,
                     created_at TEXT NOT NULL,
                     thoughts_json TEXT,
                     duration REAL,
                     FOREIGN KEY(conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
                 );
                 CREATE INDEX IF NOT EXISTS idx_conversations_updated_at
                     ON conversations(updated_at DESC);
                 CREATE INDEX IF NOT EXISTS idx_messages_conversation_id
                     ON messages(conversation_id, id);",
            )?;
            Ok(())
        })
        .await
    }

    /// Create a conversation with the given (or default) title.
    pub async fn create(&self, title: Option<String>) -> Result<Conversation, HistoryError> {
        let id = Uuid::new_v4().to_string();
        let title = title.unwrap_or_else(|| DEFAULT_TITLE.to_string());
        let now = now_iso();
        let row = (id.clone(), title.clone(), now.clone());
        self.blocking(move |store| {
            let conn = store.open()?;
            conn.execute(
                "INSERT INTO conversations (id, title, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
                params![row.0, row.1, row.2],
            )?;
            Ok(())
        })
        .await?;
        Ok(Conversation {
            id,
            title,
            created_at: now.clone(),
            updated_at: now,
            messages: Vec::new(),
        })
    }

    /// Fetch a conversation with its messages, or `None`.
    pub async fn get(&self, conversation_id: &str) -> Result<Option<Conversation>, HistoryError> {
        let id = conversation_id.to_string();
        self.blocking(move |store| {
            let conn = store.open()?;
            let header = conn
                .query_row(
                    "SELECT id, title, created_at, updated_at FROM conversations WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )
                .optional()?;

            let (id, title, created_at, updated_at) = match header {
                Some(header) => header,
                None => return Ok(None),
            };

            let mut statement = conn.prepare(
                "SELECT role, content, created_at, thoughts_json, duration
                 FROM messages WHERE conversation_id = ?1 ORDER BY id ASC",
            )?;
            let messages = statement
                .query_map(params![id], |row| {
                    let thoughts_json: Option<String> = row.get(3)?;
                    Ok(StoredMessage {
                        role: row.get(0)?,
                        content: row.get(1)?,
                        created_at: row.get(2)?,
                        thoughts: thoughts_json
                            .and_then(|raw| serde_json::from_str::<Vec<serde_json::Value>>(&raw).ok()),
                        duration: row.get(4)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(Some(Conversation {
                id,
                title,
                created_at,
                updated_at,
                messages,
            }))
        })
        .await
    }

    /// Fetch an existing conversation or create a fresh one.
    pub async fn get_or_create(
        &self,
        conversation_id: Option<&str>,
    ) -> Result<Conversation, HistoryError> {
        if let Some(id) = conversation_id {
            if let Some(existing) = self.get(id).await? {
                return Ok(existing);
            }
        }
        self.create(None).await
    }

    /// All conversation summaries, most recently updated first.
    pub async fn list_summaries(&self) -> Result<Vec<ConversationSummary>, HistoryError> {
        self.query_summaries(None).await
    }

    /// Summaries whose title or any message matches `query`
    /// (case-insensitive substring).
    pub async fn search_summaries(
        &self,
        query: &str,
    ) -> Result<Vec<ConversationSummary>, HistoryError> {
        let normalized = query.trim().to_lowercase();
        if normalized.is_empty() {
            return self.list_summaries().await;
        }
        self.query_summaries(Some(normalized)).await
    }

    async fn query_summaries(
        &self,
        filter: Option<String>,
    ) -> Result<Vec<ConversationSummary>, HistoryError> {
        self.blocking(move |store| {
            let conn = store.open()?;
            let base = "SELECT
                    c.id, c.title, c.created_at, c.updated_at,
                    COALESCE((SELECT m.content FROM messages m
                              WHERE m.conversation_id = c.id
                              ORDER BY m.id DESC LIMIT 1), '') AS last_message,
                    (SELECT COUNT(*) FROM messages m2 WHERE m2.conversation_id = c.id)
                        AS message_count
                 FROM conversations c";
            let (sql, like) = match &filter {
                Some(needle) => (
                    format!(
                        "{} WHERE lower(c.title) LIKE ?1 OR EXISTS (
                             SELECT 1 FROM messages m
                             WHERE m.conversation_id = c.id AND lower(m.content) LIKE ?1)
                         ORDER BY c.updated_at DESC",
                        base
                    ),
                    Some(format!("%{}%", needle)),
                ),
                None => (format!("{} ORDER BY c.updated_at DESC", base), None),
            };

            let mut statement = conn.prepare(&sql)?;
            let map_row = |row: &rusqlite::Row<'_>| {
                let last_message: String = row.get(4)?;
                Ok(ConversationSummary {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    created_at: row.get(2)?,
                    updated_at: row.get(3)?,
                    last_message: last_message.chars().take(160).collect(),
                    message_count: row.get::<_, i64>(5)? as usize,
                })
            };
            let rows = match like {
                Some(like) => statement
                    .query_map(params![like], map_row)?
                    .collect::<Result<Vec<_>, _>>()?,
                None => statement
                    .query_map([], map_row)?
                    .collect::<Result<Vec<_>, _>>()?,
            };
            Ok(rows)
        })
        .await
    }

    /// Append one message. Returns `false` when the conversation is unknown.
    ///
    /// The first user message of a still-untitled conversation becomes its
    /// inferred title.
    pub async fn add_message(
        &self,
        conversation_id: &str,
        message: StoredMessage,
    ) -> Result<bool, HistoryError> {
        let id = conversation_id.to_string();
        self.blocking(move |store| {
            let conn = store.open()?;
            let exists: Option<String> = conn
                .query_row(
                    "SELECT id FROM conversations WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Ok(false);
            }

            let thoughts_json = message
                .thoughts
                .as_ref()
                .and_then(|thoughts| serde_json::to_string(thoughts).ok());
            conn.execute(
                "INSERT INTO messages (conversation_id, role, content, created_at, thoughts_json, duration)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id,
                    message.role,
                    message.content,
                    message.created_at,
                    thoughts_json,
                    message.duration
                ],
            )?;
            conn.execute(
                "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                params![now_iso(), id],
            )?;

            if message.role == "user" {
                let inferred: String = message
                    .content
                    .trim()
                    .lines()
                    .next()
                    .unwrap_or("")
                    .chars()
                    .take(80)
                    .collect();
                let inferred = if inferred.is_empty() {
                    DEFAULT_TITLE.to_string()
                } else {
                    inferred
                };
                conn.execute(
                    "UPDATE conversations SET title = ?1 WHERE id = ?2 AND title = ?3",
                    params![inferred, id, DEFAULT_TITLE],
                )?;
            }
            Ok(true)
        })
        .await
    }

    /// Rename a conversation. Returns `false` for unknown ids or empty titles.
    pub async fn update_title(
        &self,
        conversation_id: &str,
        title: &str,
    ) -> Result<bool, HistoryError> {
        let safe_title: String = title.trim().chars().take(120).collect();
        if safe_title.is_empty() {
            return Ok(false);
        }
        let id = conversation_id.to_string();
        self.blocking(move |store| {
            let conn = store.open()?;
            let changed = conn.execute(
                "UPDATE conversations SET title = ?1, updated_at = ?2 WHERE id = ?3",
                params![safe_title, now_iso(), id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// Delete a conversation and its messages.
    pub async fn delete(&self, conversation_id: &str) -> Result<bool, HistoryError> {
        let id = conversation_id.to_string();
        self.blocking(move |store| {
            let conn = store.open()?;
            let changed = conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
            Ok(changed > 0)
        })
        .await
    }
}

enum WriteOp {
    AddMessage {
        conversation_id: String,
        message: StoredMessage,
    },
    UpdateTitle {
        conversation_id: String,
        title: String,
    },
}

/// Background single-writer queue in front of the store.
///
/// Decouples the request path from database writes: callers enqueue and move
/// on, the worker applies operations strictly in order.
pub struct HistoryWriter {
    sender: UnboundedSender<WriteOp>,
    worker: JoinHandle<()>,
}

impl HistoryWriter {
    /// Start the writer task over `store`.
    pub fn start(store: Arc<SqliteHistoryStore>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<WriteOp>();
        let worker = tokio::spawn(async move {
            while let Some(op) = receiver.recv().await {
                let result = match op {
                    WriteOp::AddMessage {
                        conversation_id,
                        message,
                    } => store
                        .add_message(&conversation_id, message)
                        .await
                        .map(|_| ()),
                    WriteOp::UpdateTitle {
                        conversation_id,
                        title,
                    } => store
                        .update_title(&conversation_id, &title)
                        .await
                        .map(|_| ()),
                };
                if let Err(e) = result {
                    log::error!("HistoryWriter: write failed: {}", e);
                }
            }
        });
        Self { sender, worker }
    }

    /// Enqueue one message append.
    pub fn add_message(&self, conversation_id: impl Into<String>, message: StoredMessage) {
        let op = WriteOp::AddMessage {
            conversation_id: conversation_id.into(),
            message,
        };
        if self.sender.send(op).is_err() {
            log::warn!("HistoryWriter: worker gone, message dropped");
        }
    }

    /// Enqueue a title update.
    pub fn update_title(&self, conversation_id: impl Into<String>, title: impl Into<String>) {
        let op = WriteOp::UpdateTitle {
            conversation_id: conversation_id.into(),
            title: title.into(),
        };
        if self.sender.send(op).is_err() {
            log::warn!("HistoryWriter: worker gone, title update dropped");
        }
    }

    /// Close the queue and wait until every pending write is applied.
    pub async fn stop(self) {
        drop(self.sender);
        if let Err(e) = self.worker.await {
            log::error!("HistoryWriter: worker join failed: {}", e);
        }
    }
}
