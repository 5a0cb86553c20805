//! Research run lifecycle used by the MCP tools.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::execution::{Launch, RunExecutor};
use super::iteration::IterationContext;
use super::run_guard::RunGuard;
use super::{ExecutionMode, ResearchMode};
use crate::config::ResearchConfig;
use crate::error::{AppResult, ResearchError};
use crate::storage::{
    Artifact, ConversationState, ExecutionState, Message, Paper, RunResult, StateStatus, Storage,
};

const RESTART_INTERRUPTED: &str = "Research run interrupted by a server restart";

/// Outcome of [`ResearchService::start_run`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StartOutcome {
    /// A new run was started for the message.
    Accepted {
        job_id: String,
        message_id: String,
        state_id: String,
        conversation_state_id: String,
    },
    /// The conversation already has an active run; nothing new was started.
    AlreadyRunning {
        job_id: String,
        message_id: String,
        state_id: String,
    },
}

/// Externally visible status of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MessageStatus {
    Processing,
    Completed {
        text: String,
        papers: Vec<Paper>,
        files: Vec<Artifact>,
    },
    Failed {
        error: String,
    },
}

/// Starts, inspects and retries research runs.
pub struct ResearchService {
    storage: Arc<dyn Storage>,
    guard: RunGuard,
    executor: Arc<dyn RunExecutor>,
    config: ResearchConfig,
}

impl ResearchService {
    /// Create a service.
    pub fn new(
        storage: Arc<dyn Storage>,
        guard: RunGuard,
        executor: Arc<dyn RunExecutor>,
        config: ResearchConfig,
    ) -> Self {
        Self {
            storage,
            guard,
            executor,
            config,
        }
    }

    /// Execution strategy in use.
    pub fn execution_mode(&self) -> ExecutionMode {
        self.executor.mode()
    }

    /// Start a research run for a new user message.
    ///
    /// At most one run is active per conversation; a second request while
    /// one is running gets the existing run's identifiers back.
    pub async fn start_run(
        &self,
        conversation_id: &str,
        question: &str,
        research_mode: Option<ResearchMode>,
    ) -> AppResult<StartOutcome> {
        if conversation_id.trim().is_empty() {
            return Err(ResearchError::Validation {
                field: "conversation_id".to_string(),
                reason: "cannot be empty".to_string(),
            }
            .into());
        }
        if question.trim().is_empty() {
            return Err(ResearchError::Validation {
                field: "message".to_string(),
                reason: "cannot be empty".to_string(),
            }
            .into());
        }

        let lock = self.guard.acquire_start_mutex(conversation_id).await;
        let outcome = self
            .start_locked(conversation_id, question.trim(), research_mode)
            .await;
        if let Some(lock) = lock {
            self.guard.release_start_mutex(lock).await;
        }
        outcome
    }

    async fn start_locked(
        &self,
        conversation_id: &str,
        question: &str,
        research_mode: Option<ResearchMode>,
    ) -> AppResult<StartOutcome> {
        let mut conversation = self.load_or_create_conversation(conversation_id).await?;

        if let Some(run) = self.guard.active_run_for_dedup(&conversation.id).await? {
            info!(
                conversation_id = %conversation_id,
                job_id = %run.job_id,
                "Research run already active"
            );
            return Ok(StartOutcome::AlreadyRunning {
                job_id: run.job_id,
                message_id: run.message_id,
                state_id: run.state_id,
            });
        }

        // The mode sticks to the conversation until overridden.
        let mode = research_mode
            .or(conversation.research_mode)
            .unwrap_or(self.config.default_research_mode);
        if conversation.research_mode != Some(mode) {
            conversation.research_mode = Some(mode);
            conversation.updated_at = Utc::now();
            self.storage.update_conversation_state(&conversation).await?;
        }

        let mut state = ExecutionState::new(&conversation.id, "");
        let message = Message::from_user(conversation_id, question, &state.id);
        state.current_message_id = message.id.clone();
        self.storage.create_state(&state).await?;
        self.storage.create_message(&message).await?;

        let ctx = IterationContext {
            conversation_state_id: conversation.id.clone(),
            conversation_id: conversation_id.to_string(),
            state_id: state.id.clone(),
            message_id: message.id.clone(),
            question: question.to_string(),
            research_mode: mode,
            iteration: 1,
            session_start_level: conversation.current_level + 1,
            skip_planning: false,
        };

        match self.executor.launch(ctx).await? {
            Launch::Started { job_id } => {
                info!(
                    conversation_id = %conversation_id,
                    message_id = %message.id,
                    research_mode = %mode,
                    execution_mode = ?self.executor.mode(),
                    "Research run accepted"
                );
                Ok(StartOutcome::Accepted {
                    job_id,
                    message_id: message.id,
                    state_id: state.id,
                    conversation_state_id: conversation.id,
                })
            }
            Launch::AlreadyRunning(run) => {
                // Lost the race without the start lock; drop the turn that will never run.
                warn!(
                    conversation_id = %conversation_id,
                    message_id = %message.id,
                    job_id = %run.job_id,
                    "Research run refused as duplicate"
                );
                self.storage.delete_message(&message.id).await?;
                self.storage.delete_state(&state.id).await?;
                Ok(StartOutcome::AlreadyRunning {
                    job_id: run.job_id,
                    message_id: run.message_id,
                    state_id: run.state_id,
                })
            }
        }
    }

    async fn load_or_create_conversation(
        &self,
        conversation_id: &str,
    ) -> AppResult<ConversationState> {
        if let Some(existing) = self
            .storage
            .get_conversation_state_by_conversation(conversation_id)
            .await?
        {
            return Ok(existing);
        }

        let created = ConversationState::new(conversation_id);
        match self.storage.create_conversation_state(&created).await {
            Ok(()) => Ok(created),
            Err(e) => {
                // A concurrent start may have created it first.
                match self
                    .storage
                    .get_conversation_state_by_conversation(conversation_id)
                    .await?
                {
                    Some(existing) => Ok(existing),
                    None => Err(e.into()),
                }
            }
        }
    }

    /// Status of a message, read from persisted records only.
    pub async fn get_status(&self, message_id: &str) -> AppResult<MessageStatus> {
        let message = self
            .storage
            .get_message(message_id)
            .await?
            .ok_or_else(|| ResearchError::NotFound {
                kind: "Message",
                id: message_id.to_string(),
            })?;

        if message.is_complete() {
            return Ok(MessageStatus::Completed {
                text: message.content,
                papers: message.papers,
                files: message.files,
            });
        }

        let state = self.storage.get_state(&message.state_id).await?;
        match state {
            Some(state) if state.status == StateStatus::Failed => Ok(MessageStatus::Failed {
                error: state
                    .error
                    .unwrap_or_else(|| "Research run failed".to_string()),
            }),
            _ => Ok(MessageStatus::Processing),
        }
    }

    /// Retry a failed iteration job.
    pub async fn retry(&self, job_id: &str) -> AppResult<StartOutcome> {
        let lock = match self.storage.get_message(job_id).await? {
            Some(message) => self.guard.acquire_start_mutex(&message.conversation_id).await,
            None => None,
        };
        let launched = self.executor.retry(job_id).await;
        if let Some(lock) = lock {
            self.guard.release_start_mutex(lock).await;
        }

        match launched? {
            Launch::Started { job_id } => {
                let message = self.storage.get_message(&job_id).await?.ok_or_else(|| {
                    ResearchError::NotFound {
                        kind: "Message",
                        id: job_id.clone(),
                    }
                })?;
                let state = self.storage.get_state(&message.state_id).await?;
                Ok(StartOutcome::Accepted {
                    job_id,
                    message_id: message.id,
                    state_id: message.state_id,
                    conversation_state_id: state
                        .map(|s| s.conversation_state_id)
                        .unwrap_or_default(),
                })
            }
            Launch::AlreadyRunning(run) => Ok(StartOutcome::AlreadyRunning {
                job_id: run.job_id,
                message_id: run.message_id,
                state_id: run.state_id,
            }),
        }
    }

    /// Research state of a conversation.
    pub async fn get_conversation_state(
        &self,
        conversation_id: &str,
    ) -> AppResult<ConversationState> {
        Ok(self
            .storage
            .get_conversation_state_by_conversation(conversation_id)
            .await?
            .ok_or_else(|| ResearchError::NotFound {
                kind: "ConversationState",
                id: conversation_id.to_string(),
            })?)
    }

    /// Close runs left running by a previous inline process.
    ///
    /// Inline runs live only in process memory, so any run still marked
    /// running at startup cannot make progress. Queue mode leaves them to the
    /// workers. Returns the number of runs closed.
    pub async fn recover_orphaned_runs(&self) -> AppResult<usize> {
        if self.executor.mode() != ExecutionMode::Inline {
            return Ok(0);
        }

        let orphaned = self.guard.running_runs().await?;
        for run in &orphaned {
            if let Some(mut state) = self.storage.get_state(&run.state_id).await? {
                state.status = StateStatus::Failed;
                state.error = Some(RESTART_INTERRUPTED.to_string());
                state.updated_at = Utc::now();
                self.storage.update_state(&state).await?;
            }
            self.guard
                .mark_run_finished(
                    &run.conversation_state_id,
                    &run.state_id,
                    RunResult::Failed,
                    Some(RESTART_INTERRUPTED),
                )
                .await?;
            warn!(
                conversation_state_id = %run.conversation_state_id,
                message_id = %run.message_id,
                "Closed research run orphaned by restart"
            );
        }
        Ok(orphaned.len())
    }
}
