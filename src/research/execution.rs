//! Execution strategies for research runs.
//!
//! Both strategies drive the same [`ResearchEngine`]; they differ only in
//! where iterations run and how a run is closed.
//!
//! - [`InlineExecutor`]: fire-and-forget task in the serving process. Not
//!   resumable; runs interrupted by a restart are marked failed on startup.
//! - [`QueuedExecutor`]: one durable queue job per iteration, processed by
//!   [`IterationJobProcessor`]. Failed jobs can be retried.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::iteration::{IterationContext, IterationOutcome, ResearchEngine};
use super::run_guard::RunGuard;
use super::{ExecutionMode, ITERATION_JOB};
use crate::error::{AppError, AppResult, QueueError, ResearchError};
use crate::queue::{Job, JobProcessor, JobQueue, JobStatus};
use crate::storage::{RunRecord, RunResult, StateStatus, Storage};

/// Result of handing a run to an executor.
#[derive(Debug, Clone, PartialEq)]
pub enum Launch {
    /// The run was registered and its first iteration scheduled.
    Started { job_id: String },
    /// Another run for the conversation is active.
    AlreadyRunning(RunRecord),
}

/// Runs the iteration loop for a newly started (or retried) run.
#[async_trait]
pub trait RunExecutor: Send + Sync {
    /// Strategy in use.
    fn mode(&self) -> ExecutionMode;

    /// Register the run with the run guard and schedule its first iteration.
    async fn launch(&self, ctx: IterationContext) -> AppResult<Launch>;

    /// Re-run a failed iteration job.
    async fn retry(&self, job_id: &str) -> AppResult<Launch>;
}

fn run_record(ctx: &IterationContext) -> RunRecord {
    RunRecord::running(
        &ctx.conversation_state_id,
        &ctx.message_id,
        &ctx.message_id,
        &ctx.state_id,
    )
}

async fn already_running(guard: &RunGuard, ctx: &IterationContext) -> AppResult<Launch> {
    let existing = guard
        .active_run_for_dedup(&ctx.conversation_state_id)
        .await?
        .ok_or_else(|| AppError::Internal {
            message: format!(
                "run for {} refused as duplicate but no active run found",
                ctx.conversation_state_id
            ),
        })?;
    Ok(Launch::AlreadyRunning(existing))
}

/// Runs every iteration on a spawned task in this process.
pub struct InlineExecutor {
    engine: Arc<ResearchEngine>,
    guard: RunGuard,
}

impl InlineExecutor {
    /// Create an inline executor.
    pub fn new(engine: Arc<ResearchEngine>, guard: RunGuard) -> Self {
        Self { engine, guard }
    }
}

#[async_trait]
impl RunExecutor for InlineExecutor {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Inline
    }

    async fn launch(&self, ctx: IterationContext) -> AppResult<Launch> {
        if !self.guard.mark_run_started(&run_record(&ctx)).await? {
            return already_running(&self.guard, &ctx).await;
        }

        let job_id = ctx.message_id.clone();
        let engine = Arc::clone(&self.engine);
        let guard = self.guard.clone();

        tokio::spawn(async move {
            let run = {
                let engine = Arc::clone(&engine);
                let ctx = ctx.clone();
                tokio::spawn(async move { engine.run_to_completion(ctx).await })
            };

            // A panic inside the loop surfaces as a join error.
            let failure = match run.await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(join_error) => Some(format!("research task aborted: {}", join_error)),
            };

            if let Some(message) = &failure {
                if let Err(e) = engine.record_failure(&ctx.state_id, message).await {
                    error!(state_id = %ctx.state_id, error = %e, "Failed to record run failure");
                }
            }

            let result = if failure.is_some() {
                RunResult::Failed
            } else {
                RunResult::Success
            };
            if let Err(e) = guard
                .mark_run_finished(
                    &ctx.conversation_state_id,
                    &ctx.state_id,
                    result,
                    failure.as_deref(),
                )
                .await
            {
                error!(
                    conversation_state_id = %ctx.conversation_state_id,
                    error = %e,
                    "Failed to close run"
                );
            }
        });

        info!(job_id = %job_id, "Research run started inline");
        Ok(Launch::Started { job_id })
    }

    async fn retry(&self, _job_id: &str) -> AppResult<Launch> {
        Err(ResearchError::Unsupported {
            message: "retry requires queue execution mode".to_string(),
        }
        .into())
    }
}

/// Schedules each iteration as a durable queue job.
pub struct QueuedExecutor {
    queue: Arc<dyn JobQueue>,
    guard: RunGuard,
    storage: Arc<dyn Storage>,
}

impl QueuedExecutor {
    /// Create a queued executor.
    pub fn new(queue: Arc<dyn JobQueue>, guard: RunGuard, storage: Arc<dyn Storage>) -> Self {
        Self {
            queue,
            guard,
            storage,
        }
    }
}

#[async_trait]
impl RunExecutor for QueuedExecutor {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Queue
    }

    async fn launch(&self, ctx: IterationContext) -> AppResult<Launch> {
        let payload = serde_json::to_value(&ctx).map_err(QueueError::from)?;

        // Registered before enqueueing so a worker never sees an unknown run.
        // A failed enqueue finishes the run as failed before returning.
        if !self.guard.mark_run_started(&run_record(&ctx)).await? {
            return already_running(&self.guard, &ctx).await;
        }

        match self
            .queue
            .enqueue(ITERATION_JOB, payload, &ctx.message_id)
            .await
        {
            Ok(handle) => {
                info!(
                    job_id = %handle.job_id,
                    deduplicated = handle.deduplicated,
                    "Research iteration enqueued"
                );
                Ok(Launch::Started {
                    job_id: handle.job_id,
                })
            }
            Err(e) => {
                let message = format!("failed to enqueue research iteration: {}", e);
                self.guard
                    .mark_run_finished(
                        &ctx.conversation_state_id,
                        &ctx.state_id,
                        RunResult::Failed,
                        Some(&message),
                    )
                    .await?;
                mark_state_failed(self.storage.as_ref(), &ctx.state_id, &message).await?;
                Err(e.into())
            }
        }
    }

    async fn retry(&self, job_id: &str) -> AppResult<Launch> {
        let job = self
            .queue
            .get_job(job_id)
            .await?
            .ok_or_else(|| ResearchError::NotFound {
                kind: "Job",
                id: job_id.to_string(),
            })?;
        if job.status != JobStatus::Failed {
            return Err(ResearchError::InvalidJobState {
                job_id: job_id.to_string(),
                status: job.status.to_string(),
            }
            .into());
        }

        let ctx: IterationContext =
            serde_json::from_value(job.payload.clone()).map_err(QueueError::from)?;
        let record = run_record(&ctx);
        if !self.guard.mark_run_started(&record).await? {
            return already_running(&self.guard, &ctx).await;
        }

        // Must precede the requeue: a worker may finish the job right away.
        let previous_error = match self.storage.get_state(&ctx.state_id).await? {
            Some(mut state) => {
                let previous = state.error.take();
                state.status = StateStatus::Processing;
                state.updated_at = Utc::now();
                self.storage.update_state(&state).await?;
                previous
            }
            None => None,
        };

        match self.queue.retry(job_id).await {
            Ok(true) => {}
            Ok(false) => {
                // Someone else retried it first.
                mark_state_failed(
                    self.storage.as_ref(),
                    &ctx.state_id,
                    previous_error.as_deref().unwrap_or("job no longer failed"),
                )
                .await?;
                self.guard
                    .mark_run_finished(
                        &ctx.conversation_state_id,
                        &ctx.state_id,
                        RunResult::Failed,
                        Some("job no longer failed"),
                    )
                    .await?;
                return Err(ResearchError::InvalidJobState {
                    job_id: job_id.to_string(),
                    status: "queued".to_string(),
                }
                .into());
            }
            Err(e) => {
                let message = format!("failed to requeue research iteration: {}", e);
                mark_state_failed(self.storage.as_ref(), &ctx.state_id, &message).await?;
                self.guard
                    .mark_run_finished(
                        &ctx.conversation_state_id,
                        &ctx.state_id,
                        RunResult::Failed,
                        Some(&message),
                    )
                    .await?;
                return Err(e.into());
            }
        }

        info!(job_id = %job_id, attempt = job.attempts + 1, "Research iteration retried");
        Ok(Launch::Started {
            job_id: job_id.to_string(),
        })
    }
}

async fn mark_state_failed(storage: &dyn Storage, state_id: &str, message: &str) -> AppResult<()> {
    if let Some(mut state) = storage.get_state(state_id).await? {
        state.status = StateStatus::Failed;
        state.error = Some(message.to_string());
        state.updated_at = Utc::now();
        storage.update_state(&state).await?;
    }
    Ok(())
}

/// Runs one iteration per claimed queue job and chains the next one.
pub struct IterationJobProcessor {
    engine: Arc<ResearchEngine>,
    guard: RunGuard,
    queue: Arc<dyn JobQueue>,
}

impl IterationJobProcessor {
    /// Create a processor.
    pub fn new(engine: Arc<ResearchEngine>, guard: RunGuard, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            engine,
            guard,
            queue,
        }
    }

    async fn fail_run(&self, ctx: &IterationContext, message: &str) -> AppResult<()> {
        self.engine.record_failure(&ctx.state_id, message).await?;
        self.guard
            .mark_run_finished(
                &ctx.conversation_state_id,
                &ctx.state_id,
                RunResult::Failed,
                Some(message),
            )
            .await
    }
}

#[async_trait]
impl JobProcessor for IterationJobProcessor {
    async fn process(&self, job: &Job) -> AppResult<()> {
        let ctx: IterationContext =
            serde_json::from_value(job.payload.clone()).map_err(QueueError::from)?;

        // Redelivered or superseded jobs are acknowledged without running.
        let current = self
            .guard
            .active_run_for_dedup(&ctx.conversation_state_id)
            .await?;
        match current {
            Some(run) if run.job_id == job.id => {}
            _ => {
                debug!(job_id = %job.id, "Skipping stale research iteration job");
                return Ok(());
            }
        }

        match self.engine.run_iteration(&ctx).await {
            Ok(IterationOutcome::Continue(next)) => {
                self.guard
                    .advance(&next.conversation_state_id, &next.message_id, &next.message_id)
                    .await?;
                let payload = serde_json::to_value(&next).map_err(QueueError::from)?;
                if let Err(e) = self
                    .queue
                    .enqueue(ITERATION_JOB, payload, &next.message_id)
                    .await
                {
                    let message = format!("failed to enqueue next iteration: {}", e);
                    self.fail_run(&next, &message).await?;
                    return Err(e.into());
                }
                debug!(job_id = %job.id, next_job_id = %next.message_id, "Next iteration enqueued");
                Ok(())
            }
            Ok(IterationOutcome::Finished) => {
                self.guard
                    .mark_run_finished(
                        &ctx.conversation_state_id,
                        &ctx.state_id,
                        RunResult::Success,
                        None,
                    )
                    .await
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(record_err) = self.fail_run(&ctx, &message).await {
                    warn!(job_id = %job.id, error = %record_err, "Failed to record run failure");
                }
                Err(e)
            }
        }
    }
}
