//! Server module for MCP protocol handling.
//!
//! This module provides:
//! - MCP server implementation over stdio
//! - Tool call handlers and routing
//! - Shared application state management

mod handlers;
mod mcp;

pub use handlers::*;
pub use mcp::*;

use std::sync::Arc;

use crate::config::Config;
use crate::research::ResearchService;
use crate::storage::SqliteStorage;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Config,
    /// SQLite storage backend.
    pub storage: SqliteStorage,
    /// Research run lifecycle.
    pub research: Arc<ResearchService>,
}

impl AppState {
    /// Create new application state
    pub fn new(config: Config, storage: SqliteStorage, research: Arc<ResearchService>) -> Self {
        tracing::info!(
            execution_mode = %config.research.execution_mode,
            default_research_mode = %config.research.default_research_mode,
            literature_sources = config.pipes.literature.len(),
            "AppState initializing"
        );

        Self {
            config,
            storage,
            research,
        }
    }
}

/// Shared application state handle
pub type SharedState = Arc<AppState>;
