use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::{migrate::MigrateDatabase, sqlite::SqlitePoolOptions, Sqlite, SqliteConnection, SqlitePool};

use crate::models::{new_id, ChatMessage, Conversation, ConversationSummary, Message, Role};

// Define the database schema using CREATE TABLE IF NOT EXISTS statements
const MIGRATIONS_SQL: &str = "
-- Conversations Table
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY NOT NULL,
    title TEXT NOT NULL,
    provider TEXT NOT NULL,
    model TEXT NOT NULL,
    created_at INTEGER NOT NULL, -- Unix Timestamp (milliseconds)
    updated_at INTEGER NOT NULL  -- Unix Timestamp (milliseconds), never decreases
);

-- Messages Table
CREATE TABLE IF NOT EXISTS messages (
    id TEXT NOT NULL,
    conversation_id TEXT NOT NULL,
    position INTEGER NOT NULL, -- Conversation order
    role TEXT NOT NULL, -- 'user', 'assistant' or 'system'
    content TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (conversation_id, id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation_position ON messages(conversation_id, position);
CREATE INDEX IF NOT EXISTS idx_conversations_updated_at ON conversations(updated_at);
";

/// Fields accepted when creating a conversation record.
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub id: Option<String>,
    pub title: String,
    pub provider: String,
    pub model: String,
}

/// A message as supplied by a bulk replacement; the id is optional.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub id: Option<String>,
    pub role: Role,
    pub content: String,
}

/// Partial update; `None` leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub struct ConversationPatch {
    pub title: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    /// Replaces every existing message when present.
    pub messages: Option<Vec<IncomingMessage>>,
}

#[derive(sqlx::FromRow)]
struct ConversationRow {
    id: String,
    title: String,
    provider: String,
    model: String,
    created_at: i64,
    updated_at: i64,
}

#[derive(sqlx::FromRow)]
struct SummaryRow {
    id: String,
    title: String,
    provider: String,
    model: String,
    created_at: i64,
    updated_at: i64,
    message_count: i64,
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    role: String,
    content: String,
    created_at: i64,
}

fn timestamp(ms: i64) -> Result<DateTime<Utc>, anyhow::Error> {
    DateTime::from_timestamp_millis(ms).context("Invalid timestamp in database")
}

impl ConversationRow {
    fn into_conversation(self, messages: Vec<Message>) -> Result<Conversation, anyhow::Error> {
        Ok(Conversation {
            id: self.id,
            title: self.title,
            messages,
            provider: self.provider,
            model: self.model,
            created_at: timestamp(self.created_at)?,
            updated_at: timestamp(self.updated_at)?,
        })
    }
}

impl MessageRow {
    fn into_message(self) -> Result<Message, anyhow::Error> {
        let role = Role::parse(&self.role)
            .with_context(|| format!("Unknown role '{}' stored for message {}", self.role, self.id))?;
        Ok(Message {
            id: self.id,
            role,
            content: self.content,
            created_at: Some(timestamp(self.created_at)?),
        })
    }
}

/// Durable mirror of conversations and their messages.
#[derive(Debug, Clone)]
pub struct StorageManager {
    pool: SqlitePool,
}

impl StorageManager {
    /// Connects to the database (creating it if needed) and runs migrations.
    pub async fn connect(db_url: &str) -> Result<Self, anyhow::Error> {
        log::info!("Connecting to database: {}", db_url);

        // Create the database file if it doesn't exist
        if !Sqlite::database_exists(db_url).await.unwrap_or(false) {
            log::info!("Database file not found, creating...");
            Sqlite::create_database(db_url)
                .await
                .context("Failed to create database")?;
        }

        let pool = SqlitePoolOptions::new()
            .connect(db_url)
            .await
            .context("Failed to connect to SQLite database")?;

        Self::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies the database schema migrations.
    async fn run_migrations(pool: &SqlitePool) -> Result<(), anyhow::Error> {
        log::info!("Running database migrations...");
        sqlx::query(MIGRATIONS_SQL)
            .execute(pool)
            .await
            .context("Failed to run database migrations")?;
        log::info!("Database migrations completed.");
        Ok(())
    }

    /// Fetches all conversation summaries, ordered by last updated descending.
    pub async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, anyhow::Error> {
        log::debug!("Fetching all conversations from database");
        let rows: Vec<SummaryRow> = sqlx::query_as(
            r#"
            SELECT c.id, c.title, c.provider, c.model, c.created_at, c.updated_at,
                   (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id) AS message_count
            FROM conversations c
            ORDER BY c.updated_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch conversations from database")?;

        let conversations = rows
            .into_iter()
            .map(|row| {
                Ok(ConversationSummary {
                    id: row.id,
                    title: row.title,
                    provider: row.provider,
                    model: row.model,
                    message_count: row.message_count,
                    created_at: timestamp(row.created_at)?,
                    updated_at: timestamp(row.updated_at)?,
                })
            })
            .collect::<Result<Vec<_>, anyhow::Error>>()?;

        log::info!("Fetched {} conversations", conversations.len());
        Ok(conversations)
    }

    /// Fetches a single conversation with its messages in conversation order.
    pub async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>, anyhow::Error> {
        log::debug!("Fetching conversation with ID: {}", conversation_id);
        let mut conn = self.pool.acquire().await.context("Failed to acquire connection")?;
        load_conversation(&mut conn, conversation_id).await
    }

    /// Creates a conversation with no messages.
    pub async fn create_conversation(&self, new: NewConversation) -> Result<Conversation, anyhow::Error> {
        let now = Utc::now();
        let conversation = Conversation {
            id: new.id.unwrap_or_else(new_id),
            title: new.title,
            messages: Vec::new(),
            provider: new.provider,
            model: new.model,
            created_at: now,
            updated_at: now,
        };
        log::info!("Creating conversation {}", conversation.id);

        sqlx::query(
            r#"
            INSERT INTO conversations (id, title, provider, model, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&conversation.id)
        .bind(&conversation.title)
        .bind(&conversation.provider)
        .bind(&conversation.model)
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to insert new conversation into database")?;

        Ok(conversation)
    }

    /// Applies a partial update. Returns `None` when the conversation does not exist.
    ///
    /// A message replacement deletes every existing message and inserts the new
    /// list inside the same transaction as the field update.
    pub async fn update_conversation(
        &self,
        conversation_id: &str,
        patch: ConversationPatch,
    ) -> Result<Option<Conversation>, anyhow::Error> {
        log::info!("Updating conversation {}", conversation_id);
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        if !conversation_exists(&mut tx, conversation_id).await? {
            log::warn!("Attempted to update non-existent conversation: {}", conversation_id);
            return Ok(None);
        }

        if let Some(messages) = patch.messages {
            sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
                .bind(conversation_id)
                .execute(&mut *tx)
                .await
                .context("Failed to clear messages for replacement")?;
            let now = Utc::now().timestamp_millis();
            for (position, message) in messages.into_iter().enumerate() {
                insert_message(
                    &mut tx,
                    conversation_id,
                    position as i64,
                    message.id.unwrap_or_else(new_id),
                    message.role,
                    &message.content,
                    now,
                )
                .await?;
            }
        }

        sqlx::query(
            r#"
            UPDATE conversations
            SET title = COALESCE(?, title),
                provider = COALESCE(?, provider),
                model = COALESCE(?, model)
            WHERE id = ?
            "#,
        )
        .bind(patch.title)
        .bind(patch.provider)
        .bind(patch.model)
        .bind(conversation_id)
        .execute(&mut *tx)
        .await
        .context("Failed to update conversation in database")?;
        touch(&mut tx, conversation_id).await?;

        let updated = load_conversation(&mut tx, conversation_id).await?;
        tx.commit().await.context("Failed to commit conversation update")?;

        log::info!("Successfully updated conversation {}", conversation_id);
        Ok(updated)
    }

    /// Deletes a conversation and, through the cascade, its messages.
    /// Returns false when nothing was deleted.
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<bool, anyhow::Error> {
        log::warn!("Deleting conversation with ID: {}", conversation_id);
        let result = sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(conversation_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete conversation from database")?;

        if result.rows_affected() == 0 {
            log::warn!("Attempted to delete non-existent conversation: {}", conversation_id);
            return Ok(false);
        }
        Ok(true)
    }

    /// Appends one completed exchange and bumps `updated_at`, as one unit.
    ///
    /// Returns false without writing when the conversation no longer exists,
    /// e.g. it was deleted while the answer was streaming.
    pub async fn record_exchange(
        &self,
        conversation_id: &str,
        messages: &[ChatMessage],
    ) -> Result<bool, anyhow::Error> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        if !conversation_exists(&mut tx, conversation_id).await? {
            return Ok(false);
        }

        let next_position: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(position) + 1, 0) FROM messages WHERE conversation_id = ?",
        )
        .bind(conversation_id)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to read next message position")?;

        let now = Utc::now().timestamp_millis();
        for (offset, message) in messages.iter().enumerate() {
            insert_message(
                &mut tx,
                conversation_id,
                next_position + offset as i64,
                new_id(),
                message.role,
                &message.content,
                now,
            )
            .await?;
        }
        touch(&mut tx, conversation_id).await?;
        tx.commit().await.context("Failed to commit exchange")?;

        log::debug!("Recorded {} messages for conversation {}", messages.len(), conversation_id);
        Ok(true)
    }
}

async fn conversation_exists(conn: &mut SqliteConnection, conversation_id: &str) -> Result<bool, anyhow::Error> {
    let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM conversations WHERE id = ?")
        .bind(conversation_id)
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to check conversation existence")?;
    Ok(found.is_some())
}

/// Moves `updated_at` forward by at least one millisecond.
async fn touch(conn: &mut SqliteConnection, conversation_id: &str) -> Result<(), anyhow::Error> {
    sqlx::query("UPDATE conversations SET updated_at = MAX(updated_at + 1, ?) WHERE id = ?")
        .bind(Utc::now().timestamp_millis())
        .bind(conversation_id)
        .execute(&mut *conn)
        .await
        .context("Failed to update conversation updated_at timestamp")?;
    Ok(())
}

async fn insert_message(
    conn: &mut SqliteConnection,
    conversation_id: &str,
    position: i64,
    id: String,
    role: Role,
    content: &str,
    created_at: i64,
) -> Result<(), anyhow::Error> {
    sqlx::query(
        r#"
        INSERT INTO messages (id, conversation_id, position, role, content, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(id)
    .bind(conversation_id)
    .bind(position)
    .bind(role.as_str())
    .bind(content)
    .bind(created_at)
    .execute(&mut *conn)
    .await
    .context("Failed to insert message into database")?;
    Ok(())
}

async fn load_conversation(
    conn: &mut SqliteConnection,
    conversation_id: &str,
) -> Result<Option<Conversation>, anyhow::Error> {
    let row: Option<ConversationRow> = sqlx::query_as(
        r#"
        SELECT id, title, provider, model, created_at, updated_at
        FROM conversations
        WHERE id = ?
        "#,
    )
    .bind(conversation_id)
    .fetch_optional(&mut *conn)
    .await
    .context("Failed to fetch conversation from database")?;

    let Some(row) = row else {
        return Ok(None);
    };

    let messages: Vec<MessageRow> = sqlx::query_as(
        r#"
        SELECT id, role, content, created_at
        FROM messages
        WHERE conversation_id = ?
        ORDER BY position ASC
        "#,
    )
    .bind(conversation_id)
    .fetch_all(&mut *conn)
    .await
    .context("Failed to fetch messages from database")?;

    let messages = messages
        .into_iter()
        .map(MessageRow::into_message)
        .collect::<Result<Vec<_>, _>>()?;
    row.into_conversation(messages).map(Some)
}
