//! Error taxonomy.
//!
//! One enum per layer, folded into [`AppError`] with `#[from]`. Agent contract
//! violations are [`ResearchError::Contract`] and fail the iteration; backend
//! failures never reach this far because the executor records them on the task.

use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Langbase error: {0}")]
    Langbase(#[from] LangbaseError),

    #[error("MCP protocol error: {0}")]
    Mcp(#[from] McpError),

    #[error("Research error: {0}")]
    Research(#[from] ResearchError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Langbase API errors
#[derive(Debug, Error)]
pub enum LangbaseError {
    #[error("Langbase unavailable: {message} (retries: {retries})")]
    Unavailable { message: String, retries: u32 },

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// MCP protocol errors
#[derive(Debug, Error)]
pub enum McpError {
    #[error("Unknown tool: {tool_name}")]
    UnknownTool { tool_name: String },

    #[error("Invalid parameters for {tool_name}: {message}")]
    InvalidParameters { tool_name: String, message: String },

    #[error("Tool execution failed: {message}")]
    ExecutionFailed { message: String },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Research engine errors
#[derive(Debug, Error)]
pub enum ResearchError {
    #[error("Validation failed: {field} - {reason}")]
    Validation { field: String, reason: String },

    /// An agent answered with something that does not satisfy its contract.
    #[error("{agent} agent contract violated: {message}")]
    Contract { agent: String, message: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Job {job_id} cannot be retried from status '{status}'")]
    InvalidJobState { job_id: String, status: String },

    #[error("Unsupported operation: {message}")]
    Unsupported { message: String },
}

/// Job queue errors
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Job not found: {job_id}")]
    NotFound { job_id: String },

    #[error("Enqueue failed: {message}")]
    Enqueue { message: String },

    #[error("Payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

impl ResearchError {
    /// Build a contract violation for the named agent.
    pub fn contract(agent: impl Into<String>, message: impl Into<String>) -> Self {
        ResearchError::Contract {
            agent: agent.into(),
            message: message.into(),
        }
    }
}

impl From<AppError> for McpError {
    fn from(err: AppError) -> Self {
        McpError::ExecutionFailed {
            message: err.to_string(),
        }
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for Langbase operations
pub type LangbaseResult<T> = Result<T, LangbaseError>;

/// Result type alias for MCP operations
pub type McpResult<T> = Result<T, McpError>;

/// Result type alias for queue operations
pub type QueueResult<T> = Result<T, QueueError>;
