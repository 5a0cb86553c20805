//! # MCP Deep Research Server
//!
//! A Model Context Protocol (MCP) server that runs an autonomous deep-research
//! loop for each conversation, delegating every agent step to Langbase Pipes.
//!
//! ## Features
//!
//! - **Leveled planning**: task batches promoted level by level into a conversation plan
//! - **Concurrent execution**: literature fan-out across sources and data analysis, with per-task failure isolation
//! - **Evaluation**: hypothesis, reflection and cost-gated discovery after every batch
//! - **Autonomy control**: steering, semi-autonomous and fully autonomous research modes
//! - **Run guarding**: at most one active run per conversation
//! - **Execution modes**: inline in the server process, or one durable queue job per iteration
//!
//! ## Architecture
//!
//! ```text
//! MCP Client → MCP Server (Rust) → ResearchService → RunExecutor (inline | queue)
//!                                        ↓                 ↓
//!                                  SQLite (State)   ResearchEngine → Langbase Pipes (HTTP)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use mcp_deep_research::research::{
//!     BackendRegistry, InlineExecutor, PipeAgents, ResearchEngine, ResearchService, RunGuard,
//! };
//! use mcp_deep_research::{langbase::LangbaseClient, storage::SqliteStorage, Config};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let storage = Arc::new(SqliteStorage::new(&config.database).await?);
//!     let langbase = LangbaseClient::new(&config.langbase, config.request.clone())?;
//!     let agents = PipeAgents::new(langbase.clone(), storage.clone(), config.pipes.clone());
//!     let backends = BackendRegistry::from_pipes(&config.pipes, langbase, storage.clone());
//!     let engine = Arc::new(ResearchEngine::new(
//!         storage.clone(), Arc::new(agents), backends, config.research.clone(),
//!     ));
//!     let guard = RunGuard::from_config(storage.clone(), &config.research);
//!     let executor = Arc::new(InlineExecutor::new(engine, guard.clone()));
//!     let service = ResearchService::new(storage, guard, executor, config.research.clone());
//!     service.start_run("conv-1", "What is telomerase?", None).await?;
//!     Ok(())
//! }
//! ```

/// Configuration management for the MCP server.
pub mod config;
/// Error types and result aliases for the application.
pub mod error;
/// Langbase API client and types for pipe communication.
pub mod langbase;
/// System prompts for Langbase pipes.
pub mod prompts;
/// Durable job queue and workers for queued execution.
pub mod queue;
/// The deep-research iteration engine.
pub mod research;
/// MCP server implementation and request handling.
pub mod server;
/// SQLite storage layer for persistence.
pub mod storage;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use research::ResearchService;
pub use server::{AppState, McpServer, SharedState};
