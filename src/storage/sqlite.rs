use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::info;

use super::{
    ConversationState, ExecutionState, Invocation, Message, RunRecord, RunResult, RunState,
    StateStatus, Storage,
};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// SQLite-backed storage implementation
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage instance
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Create an in-memory database.
    ///
    /// Uses a single long-lived connection so every query sees the same database.
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options =
            SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| {
                StorageError::Connection {
                    message: format!("Invalid database URL: {}", e),
                }
            })?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to open in-memory database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Run database migrations using embedded sqlx migrations
    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Format a timestamp with fixed precision so stored values sort lexically.
pub(crate) fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp, falling back to now for malformed values.
pub(crate) fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn create_conversation_state(&self, state: &ConversationState) -> StorageResult<()> {
        let data = serde_json::to_string(state)?;

        sqlx::query(
            r#"
            INSERT INTO conversation_states (id, conversation_id, data, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&state.id)
        .bind(&state.conversation_id)
        .bind(&data)
        .bind(format_timestamp(&state.created_at))
        .bind(format_timestamp(&state.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_conversation_state(&self, id: &str) -> StorageResult<Option<ConversationState>> {
        let data: Option<String> =
            sqlx::query_scalar("SELECT data FROM conversation_states WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        data.map(|d| serde_json::from_str(&d).map_err(StorageError::from))
            .transpose()
    }

    async fn get_conversation_state_by_conversation(
        &self,
        conversation_id: &str,
    ) -> StorageResult<Option<ConversationState>> {
        let data: Option<String> =
            sqlx::query_scalar("SELECT data FROM conversation_states WHERE conversation_id = ?")
                .bind(conversation_id)
                .fetch_optional(&self.pool)
                .await?;

        data.map(|d| serde_json::from_str(&d).map_err(StorageError::from))
            .transpose()
    }

    async fn update_conversation_state(&self, state: &ConversationState) -> StorageResult<()> {
        let data = serde_json::to_string(state)?;

        let result = sqlx::query(
            r#"
            UPDATE conversation_states
            SET data = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&data)
        .bind(format_timestamp(&state.updated_at))
        .bind(&state.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "ConversationState",
                id: state.id.clone(),
            });
        }

        Ok(())
    }

    async fn create_message(&self, message: &Message) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, source, question, content, summary,
                                  response_time, state_id, papers, files, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(message.source.to_string())
        .bind(&message.question)
        .bind(&message.content)
        .bind(&message.summary)
        .bind(message.response_time)
        .bind(&message.state_id)
        .bind(serde_json::to_string(&message.papers)?)
        .bind(serde_json::to_string(&message.files)?)
        .bind(format_timestamp(&message.created_at))
        .bind(format_timestamp(&message.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_message(&self, id: &str) -> StorageResult<Option<Message>> {
        let row: Option<MessageRow> = sqlx::query_as(
            r#"
            SELECT id, conversation_id, source, question, content, summary, response_time,
                   state_id, papers, files, created_at, updated_at
            FROM messages
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn update_message(&self, message: &Message) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET content = ?, summary = ?, response_time = ?, papers = ?, files = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&message.content)
        .bind(&message.summary)
        .bind(message.response_time)
        .bind(serde_json::to_string(&message.papers)?)
        .bind(serde_json::to_string(&message.files)?)
        .bind(format_timestamp(&message.updated_at))
        .bind(&message.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "Message",
                id: message.id.clone(),
            });
        }

        Ok(())
    }

    async fn delete_message(&self, id: &str) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_conversation_messages(
        &self,
        conversation_id: &str,
    ) -> StorageResult<Vec<Message>> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            r#"
            SELECT id, conversation_id, source, question, content, summary, response_time,
                   state_id, papers, files, created_at, updated_at
            FROM messages
            WHERE conversation_id = ?
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn count_conversation_messages(&self, conversation_id: &str) -> StorageResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE conversation_id = ?")
            .bind(conversation_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(count.max(0) as usize)
    }

    async fn create_state(&self, state: &ExecutionState) -> StorageResult<()> {
        let last_decision = state
            .last_decision
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO states (id, conversation_state_id, status, error, current_message_id,
                                iteration, last_decision, planned_level, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&state.id)
        .bind(&state.conversation_state_id)
        .bind(state.status.to_string())
        .bind(&state.error)
        .bind(&state.current_message_id)
        .bind(state.iteration as i64)
        .bind(&last_decision)
        .bind(state.planned_level)
        .bind(format_timestamp(&state.created_at))
        .bind(format_timestamp(&state.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_state(&self, id: &str) -> StorageResult<Option<ExecutionState>> {
        let row: Option<StateRow> = sqlx::query_as(
            r#"
            SELECT id, conversation_state_id, status, error, current_message_id, iteration,
                   last_decision, planned_level, created_at, updated_at
            FROM states
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn update_state(&self, state: &ExecutionState) -> StorageResult<()> {
        let last_decision = state
            .last_decision
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE states
            SET status = ?, error = ?, current_message_id = ?, iteration = ?,
                last_decision = ?, planned_level = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(state.status.to_string())
        .bind(&state.error)
        .bind(&state.current_message_id)
        .bind(state.iteration as i64)
        .bind(&last_decision)
        .bind(state.planned_level)
        .bind(format_timestamp(&state.updated_at))
        .bind(&state.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "State",
                id: state.id.clone(),
            });
        }

        Ok(())
    }

    async fn delete_state(&self, id: &str) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM states WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn try_mark_run_started(&self, record: &RunRecord) -> StorageResult<bool> {
        // A finished record is replaced; a running one is left untouched.
        let result = sqlx::query(
            r#"
            INSERT INTO run_guards (conversation_state_id, job_id, message_id, state_id,
                                    status, result, error, started_at, updated_at)
            VALUES (?, ?, ?, ?, 'running', NULL, NULL, ?, ?)
            ON CONFLICT(conversation_state_id) DO UPDATE SET
                job_id = excluded.job_id,
                message_id = excluded.message_id,
                state_id = excluded.state_id,
                status = 'running',
                result = NULL,
                error = NULL,
                started_at = excluded.started_at,
                updated_at = excluded.updated_at
            WHERE run_guards.status <> 'running'
            "#,
        )
        .bind(&record.conversation_state_id)
        .bind(&record.job_id)
        .bind(&record.message_id)
        .bind(&record.state_id)
        .bind(format_timestamp(&record.started_at))
        .bind(format_timestamp(&record.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_run(&self, conversation_state_id: &str) -> StorageResult<Option<RunRecord>> {
        let row: Option<RunRow> = sqlx::query_as(
            r#"
            SELECT conversation_state_id, job_id, message_id, state_id, status, result, error,
                   started_at, updated_at
            FROM run_guards
            WHERE conversation_state_id = ?
            "#,
        )
        .bind(conversation_state_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn advance_run(
        &self,
        conversation_state_id: &str,
        job_id: &str,
        message_id: &str,
    ) -> StorageResult<()> {
        sqlx::query(
            r#"
            UPDATE run_guards
            SET job_id = ?, message_id = ?, updated_at = ?
            WHERE conversation_state_id = ? AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(message_id)
        .bind(format_timestamp(&Utc::now()))
        .bind(conversation_state_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn finish_run(
        &self,
        conversation_state_id: &str,
        state_id: &str,
        result: RunResult,
        error: Option<&str>,
    ) -> StorageResult<bool> {
        let outcome = sqlx::query(
            r#"
            UPDATE run_guards
            SET status = 'finished', result = ?, error = ?, updated_at = ?
            WHERE conversation_state_id = ? AND state_id = ? AND status = 'running'
            "#,
        )
        .bind(result.to_string())
        .bind(error)
        .bind(format_timestamp(&Utc::now()))
        .bind(conversation_state_id)
        .bind(state_id)
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected() > 0)
    }

    async fn list_running_runs(&self) -> StorageResult<Vec<RunRecord>> {
        let rows: Vec<RunRow> = sqlx::query_as(
            r#"
            SELECT conversation_state_id, job_id, message_id, state_id, status, result, error,
                   started_at, updated_at
            FROM run_guards
            WHERE status = 'running'
            ORDER BY started_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn try_acquire_lock(
        &self,
        key: &str,
        owner: &str,
        expires_at_ms: i64,
        now_ms: i64,
    ) -> StorageResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO start_locks (lock_key, owner, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(lock_key) DO UPDATE SET
                owner = excluded.owner,
                expires_at = excluded.expires_at
            WHERE start_locks.expires_at <= ?
            "#,
        )
        .bind(key)
        .bind(owner)
        .bind(expires_at_ms)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_lock(&self, key: &str, owner: &str) -> StorageResult<()> {
        sqlx::query("DELETE FROM start_locks WHERE lock_key = ? AND owner = ?")
            .bind(key)
            .bind(owner)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn log_invocation(&self, invocation: &Invocation) -> StorageResult<()> {
        let input = serde_json::to_string(&invocation.input)?;
        let output = invocation
            .output
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO invocations (id, session_id, tool_name, input, output, pipe_name, latency_ms, success, error, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&invocation.id)
        .bind(&invocation.session_id)
        .bind(&invocation.tool_name)
        .bind(&input)
        .bind(&output)
        .bind(&invocation.pipe_name)
        .bind(invocation.latency_ms)
        .bind(invocation.success)
        .bind(&invocation.error)
        .bind(format_timestamp(&invocation.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// Internal row types for SQLx mapping
#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    conversation_id: String,
    source: String,
    question: String,
    content: String,
    summary: String,
    response_time: Option<i64>,
    state_id: String,
    papers: String,
    files: String,
    created_at: String,
    updated_at: String,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            conversation_id: row.conversation_id,
            source: row.source.parse().unwrap_or_default(),
            question: row.question,
            content: row.content,
            summary: row.summary,
            response_time: row.response_time,
            state_id: row.state_id,
            papers: serde_json::from_str(&row.papers).unwrap_or_default(),
            files: serde_json::from_str(&row.files).unwrap_or_default(),
            created_at: parse_timestamp(&row.created_at),
            updated_at: parse_timestamp(&row.updated_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct StateRow {
    id: String,
    conversation_state_id: String,
    status: String,
    error: Option<String>,
    current_message_id: String,
    iteration: i64,
    last_decision: Option<String>,
    planned_level: Option<i64>,
    created_at: String,
    updated_at: String,
}

impl From<StateRow> for ExecutionState {
    fn from(row: StateRow) -> Self {
        Self {
            id: row.id,
            conversation_state_id: row.conversation_state_id,
            status: row.status.parse().unwrap_or(StateStatus::Processing),
            error: row.error,
            current_message_id: row.current_message_id,
            iteration: row.iteration.max(0) as u32,
            last_decision: row.last_decision.and_then(|s| serde_json::from_str(&s).ok()),
            planned_level: row.planned_level.map(|l| l as i32),
            created_at: parse_timestamp(&row.created_at),
            updated_at: parse_timestamp(&row.updated_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    conversation_state_id: String,
    job_id: String,
    message_id: String,
    state_id: String,
    status: String,
    result: Option<String>,
    error: Option<String>,
    started_at: String,
    updated_at: String,
}

impl From<RunRow> for RunRecord {
    fn from(row: RunRow) -> Self {
        Self {
            conversation_state_id: row.conversation_state_id,
            job_id: row.job_id,
            message_id: row.message_id,
            state_id: row.state_id,
            status: row.status.parse().unwrap_or(RunState::Finished),
            result: row.result.and_then(|r| r.parse().ok()),
            error: row.error,
            started_at: parse_timestamp(&row.started_at),
            updated_at: parse_timestamp(&row.updated_at),
        }
    }
}
