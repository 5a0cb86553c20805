//! The per-conversation iteration loop.
//!
//! [`ResearchEngine::run_iteration`] performs exactly one iteration and tells
//! the caller whether to continue. Inline execution loops over it in-process;
//! queued execution runs one iteration per job.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::agents::{PlannedTask, ReplyRequest, ResearchAgents, TaskSummary};
use super::backends::BackendRegistry;
use super::state::StateHandle;
use super::{decision, evaluation, executor, max_auto_iterations, planner, ResearchMode};
use crate::config::ResearchConfig;
use crate::error::{AppResult, ResearchError};
use crate::storage::{ExecutionState, Message, StateStatus, Storage};

/// Everything needed to run one iteration. Also the queue job payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationContext {
    pub conversation_state_id: String,
    pub conversation_id: String,
    /// Execution state shared by the run's message chain.
    pub state_id: String,
    /// Message this iteration replies to.
    pub message_id: String,
    /// The user question that started the run.
    pub question: String,
    pub research_mode: ResearchMode,
    /// 1-based iteration number within the run.
    pub iteration: u32,
    /// Plan level that was next when the user's message arrived.
    pub session_start_level: i32,
    /// Tasks for this iteration were already promoted by the previous one.
    pub skip_planning: bool,
}

impl IterationContext {
    /// Context for the next iteration, driving a chained message.
    pub fn next(&self, message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            iteration: self.iteration + 1,
            skip_planning: true,
            ..self.clone()
        }
    }
}

/// Result of one iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum IterationOutcome {
    /// Another iteration was chained; run it with this context.
    Continue(IterationContext),
    /// The run is complete and control is back with the user.
    Finished,
}

/// Orchestrates planning, execution, evaluation, decision and reply.
pub struct ResearchEngine {
    storage: Arc<dyn Storage>,
    agents: Arc<dyn ResearchAgents>,
    backends: BackendRegistry,
    config: ResearchConfig,
}

impl ResearchEngine {
    /// Create an engine.
    pub fn new(
        storage: Arc<dyn Storage>,
        agents: Arc<dyn ResearchAgents>,
        backends: BackendRegistry,
        config: ResearchConfig,
    ) -> Self {
        Self {
            storage,
            agents,
            backends,
            config,
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &ResearchConfig {
        &self.config
    }

    /// Run iterations until the loop stops.
    pub async fn run_to_completion(&self, ctx: IterationContext) -> AppResult<()> {
        let mut ctx = ctx;
        loop {
            match self.run_iteration(&ctx).await? {
                IterationOutcome::Continue(next) => ctx = next,
                IterationOutcome::Finished => return Ok(()),
            }
        }
    }

    /// Run a single iteration.
    pub async fn run_iteration(&self, ctx: &IterationContext) -> AppResult<IterationOutcome> {
        let conversation_state = self
            .storage
            .get_conversation_state(&ctx.conversation_state_id)
            .await?
            .ok_or_else(|| ResearchError::NotFound {
                kind: "ConversationState",
                id: ctx.conversation_state_id.clone(),
            })?;
        let mut message = self
            .storage
            .get_message(&ctx.message_id)
            .await?
            .ok_or_else(|| ResearchError::NotFound {
                kind: "Message",
                id: ctx.message_id.clone(),
            })?;

        let handle = StateHandle::new(self.storage.clone(), conversation_state);
        let agents = self.agents.as_ref();

        info!(
            conversation_state_id = %ctx.conversation_state_id,
            message_id = %ctx.message_id,
            iteration = ctx.iteration,
            research_mode = %ctx.research_mode,
            skip_planning = ctx.skip_planning,
            "Starting research iteration"
        );

        if !ctx.skip_planning {
            self.plan_first_level(ctx, &handle).await?;
        }

        executor::execute_level(&handle, &self.backends).await?;

        let message_count = self
            .storage
            .count_conversation_messages(&ctx.conversation_id)
            .await?;
        evaluation::evaluate(
            agents,
            &handle,
            &ctx.question,
            message_count,
            &self.config.discovery,
        )
        .await?;

        planner::plan_next(agents, &handle, &ctx.question, ctx.research_mode).await?;

        let max_iterations =
            max_auto_iterations(ctx.research_mode, self.config.semi_autonomous_max_iterations);
        let snapshot = handle.snapshot().await;
        let decision = decision::decide(
            agents,
            &snapshot,
            &ctx.question,
            ctx.iteration,
            max_iterations,
            ctx.research_mode,
        )
        .await;

        // Reply for the message currently being driven.
        let window = snapshot.tasks_in_window(ctx.session_start_level, snapshot.current_level);
        let reply = agents
            .reply(ReplyRequest {
                conversation_state_id: snapshot.id.clone(),
                question: ctx.question.clone(),
                objective: snapshot.objective.clone(),
                current_objective: snapshot.current_objective.clone(),
                hypothesis: snapshot.current_hypothesis.clone(),
                key_insights: snapshot.key_insights.clone(),
                discoveries: snapshot.discoveries.clone(),
                tasks: TaskSummary::from_tasks(&window),
                suggested_next_steps: snapshot
                    .suggested_next_steps
                    .iter()
                    .map(PlannedTask::from_task)
                    .collect(),
                is_final: !decision.should_continue,
                research_mode: ctx.research_mode,
            })
            .await?;

        let now = Utc::now();
        message.summary = if reply.summary.trim().is_empty() {
            reply.reply.chars().take(280).collect()
        } else {
            reply.summary
        };
        message.content = reply.reply;
        message.papers = reply.papers;
        message.files = window.iter().flat_map(|t| t.artifacts.clone()).collect();
        message.response_time = Some((now - message.created_at).num_milliseconds().max(0));
        message.updated_at = now;
        self.storage.update_message(&message).await?;

        let mut state = self.load_state(&ctx.state_id).await?;
        state.iteration = ctx.iteration;
        state.last_decision = Some(decision.clone());
        state.updated_at = Utc::now();

        if !decision.should_continue {
            state.status = StateStatus::Completed;
            self.storage.update_state(&state).await?;
            info!(
                conversation_state_id = %ctx.conversation_state_id,
                message_id = %ctx.message_id,
                iteration = ctx.iteration,
                trigger_reason = ?decision.trigger_reason,
                "Research run finished"
            );
            return Ok(IterationOutcome::Finished);
        }

        // Continuation chaining: promote staged steps, then a new agent message.
        let level = handle.update(planner::promote_suggestions).await?;
        let next_message = Message::continuation(&ctx.conversation_id, &ctx.state_id);
        self.storage.create_message(&next_message).await?;

        state.current_message_id = next_message.id.clone();
        self.storage.update_state(&state).await?;

        info!(
            conversation_state_id = %ctx.conversation_state_id,
            message_id = %ctx.message_id,
            next_message_id = %next_message.id,
            next_level = ?level,
            iteration = ctx.iteration,
            "Auto-continuing research"
        );
        Ok(IterationOutcome::Continue(ctx.next(next_message.id)))
    }

    /// Plan the run's first level once.
    ///
    /// A retried or redelivered first iteration resumes the level it already
    /// planned; only tasks that never finished are executed again.
    async fn plan_first_level(
        &self,
        ctx: &IterationContext,
        handle: &StateHandle,
    ) -> AppResult<()> {
        let mut state = self.load_state(&ctx.state_id).await?;
        if let Some(level) = state.planned_level {
            info!(
                state_id = %ctx.state_id,
                level,
                "Resuming previously planned level"
            );
            return Ok(());
        }

        let level = planner::plan_initial(
            self.agents.as_ref(),
            handle,
            &ctx.question,
            ctx.research_mode,
        )
        .await?;
        state.planned_level = Some(level);
        state.updated_at = Utc::now();
        self.storage.update_state(&state).await?;
        Ok(())
    }

    async fn load_state(&self, state_id: &str) -> AppResult<ExecutionState> {
        self.storage.get_state(state_id).await?.ok_or_else(|| {
            ResearchError::NotFound {
                kind: "State",
                id: state_id.to_string(),
            }
            .into()
        })
    }

    /// Mark the run's execution state failed.
    pub async fn record_failure(&self, state_id: &str, error_message: &str) -> AppResult<()> {
        error!(state_id = %state_id, error = %error_message, "Research run failed");

        match self.storage.get_state(state_id).await? {
            Some(mut state) => {
                state.status = StateStatus::Failed;
                state.error = Some(error_message.to_string());
                state.updated_at = Utc::now();
                self.storage.update_state(&state).await?;
            }
            None => warn!(state_id = %state_id, "No execution state to mark failed"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::research::agents::*;
    use crate::research::backends::{AnalysisBackend, BackendOutput, LiteratureBackend};
    use crate::research::LiteratureSource;
    use crate::storage::{
        ConversationState, Dataset, ExecutionState, MessageSource, SqliteStorage, TaskType,
    };
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl LiteratureBackend for Echo {
        fn source(&self) -> LiteratureSource {
            LiteratureSource::Knowledge
        }

        async fn search(&self, objective: &str) -> AppResult<BackendOutput> {
            Ok(BackendOutput {
                output: format!("found: {}", objective),
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl AnalysisBackend for Echo {
        async fn analyze(&self, objective: &str, _datasets: &[Dataset]) -> AppResult<BackendOutput> {
            Ok(BackendOutput {
                output: format!("analyzed: {}", objective),
                ..Default::default()
            })
        }
    }

    fn planned(objective: &str) -> PlannedTask {
        PlannedTask {
            objective: objective.to_string(),
            task_type: TaskType::Literature,
            datasets: vec![],
        }
    }

    /// Agents that plan one task per level and propose `next_steps` follow-ups.
    fn scripted_agents(next_steps: usize, continue_decision: bool) -> MockResearchAgents {
        flaky_agents(next_steps, continue_decision, 0)
    }

    /// Like [`scripted_agents`], but the first `hypothesis_failures` hypothesis
    /// calls break their output contract.
    fn flaky_agents(
        next_steps: usize,
        continue_decision: bool,
        hypothesis_failures: usize,
    ) -> MockResearchAgents {
        let mut agents = MockResearchAgents::new();
        let mut remaining_failures = hypothesis_failures;
        agents.expect_plan().returning(move |r| {
            Ok(match r.mode {
                PlanMode::Initial => PlanOutput {
                    objective: "Explain telomerase".to_string(),
                    tasks: vec![planned("telomerase overview")],
                },
                PlanMode::Next => PlanOutput {
                    objective: String::new(),
                    tasks: (0..next_steps).map(|i| planned(&format!("follow-up {}", i))).collect(),
                },
            })
        });
        agents.expect_hypothesize().returning(move |_| {
            if remaining_failures > 0 {
                remaining_failures -= 1;
                return Err(ResearchError::contract("hypothesis", "not JSON").into());
            }
            Ok(HypothesisOutput {
                hypothesis: "Telomerase counteracts telomere shortening".to_string(),
                mode: HypothesisMode::Update,
            })
        });
        agents.expect_reflect().returning(|_| {
            Ok(ReflectionOutput {
                current_objective: "Explain telomerase".to_string(),
                key_insights: vec!["RNA template".to_string()],
                methodology: "review".to_string(),
                conversation_title: None,
                objective: None,
            })
        });
        agents
            .expect_discover()
            .returning(|_| Ok(DiscoveryOutput { discoveries: vec![] }));
        agents.expect_decide_continuation().returning(move |_| {
            Ok(ContinuationDecision {
                should_continue: continue_decision,
                confidence: 0.9,
                reasoning: "scripted".to_string(),
                trigger_reason: TriggerReason::AgentDecision,
            })
        });
        agents.expect_reply().returning(|r| {
            Ok(ReplyOutput {
                reply: format!("reply final={} tasks={}", r.is_final, r.tasks.len()),
                summary: String::new(),
                papers: vec![],
            })
        });
        agents
    }

    async fn setup(
        agents: MockResearchAgents,
        mode: ResearchMode,
    ) -> (Arc<SqliteStorage>, ResearchEngine, IterationContext) {
        let storage = Arc::new(SqliteStorage::new_in_memory().await.unwrap());
        let conversation = ConversationState::new("conv-1");
        storage.create_conversation_state(&conversation).await.unwrap();

        let mut state = ExecutionState::new(&conversation.id, "");
        let message = Message::from_user("conv-1", "What is telomerase?", &state.id);
        state.current_message_id = message.id.clone();
        storage.create_state(&state).await.unwrap();
        storage.create_message(&message).await.unwrap();

        let backends = BackendRegistry::new(vec![Arc::new(Echo)], Arc::new(Echo));
        let engine = ResearchEngine::new(
            storage.clone(),
            Arc::new(agents),
            backends,
            ResearchConfig::default(),
        );
        let ctx = IterationContext {
            conversation_state_id: conversation.id.clone(),
            conversation_id: "conv-1".to_string(),
            state_id: state.id.clone(),
            message_id: message.id.clone(),
            question: "What is telomerase?".to_string(),
            research_mode: mode,
            iteration: 1,
            session_start_level: 0,
            skip_planning: false,
        };
        (storage, engine, ctx)
    }

    #[tokio::test]
    async fn test_steering_runs_exactly_one_iteration() {
        let (storage, engine, ctx) = setup(scripted_agents(3, true), ResearchMode::Steering).await;

        let outcome = engine.run_iteration(&ctx).await.unwrap();
        assert_eq!(outcome, IterationOutcome::Finished);

        let message = storage.get_message(&ctx.message_id).await.unwrap().unwrap();
        assert!(message.is_complete());
        assert_eq!(message.content, "reply final=true tasks=1");
        assert!(!message.summary.is_empty());

        let state = storage.get_state(&ctx.state_id).await.unwrap().unwrap();
        assert_eq!(state.status, StateStatus::Completed);
        assert_eq!(
            state.last_decision.unwrap().trigger_reason,
            TriggerReason::IterationLimit
        );
        assert_eq!(storage.count_conversation_messages("conv-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_no_next_steps_finishes_with_final_reply() {
        let (storage, engine, ctx) =
            setup(scripted_agents(0, true), ResearchMode::FullyAutonomous).await;

        let outcome = engine.run_iteration(&ctx).await.unwrap();
        assert_eq!(outcome, IterationOutcome::Finished);

        let message = storage.get_message(&ctx.message_id).await.unwrap().unwrap();
        assert_eq!(message.content, "reply final=true tasks=1");
        let state = storage.get_state(&ctx.state_id).await.unwrap().unwrap();
        assert_eq!(
            state.last_decision.unwrap().trigger_reason,
            TriggerReason::NoNextSteps
        );
    }

    #[tokio::test]
    async fn test_continue_chains_agent_message() {
        let (storage, engine, ctx) =
            setup(scripted_agents(2, true), ResearchMode::SemiAutonomous).await;

        let next = match engine.run_iteration(&ctx).await.unwrap() {
            IterationOutcome::Continue(next) => next,
            IterationOutcome::Finished => panic!("expected continuation"),
        };
        assert_eq!(next.iteration, 2);
        assert!(next.skip_planning);
        assert_eq!(next.state_id, ctx.state_id);
        assert_ne!(next.message_id, ctx.message_id);

        let previous = storage.get_message(&ctx.message_id).await.unwrap().unwrap();
        assert!(previous.is_complete());
        assert_eq!(previous.content, "reply final=false tasks=1");

        let chained = storage.get_message(&next.message_id).await.unwrap().unwrap();
        assert_eq!(chained.source, MessageSource::Agent);
        assert!(chained.question.is_empty());
        assert_eq!(chained.state_id, ctx.state_id);
        assert!(!chained.is_complete());
        assert!(previous.updated_at <= chained.created_at);

        let conversation = storage
            .get_conversation_state(&ctx.conversation_state_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conversation.current_level, 1);
        assert_eq!(conversation.plan.len(), 3);
        assert!(conversation.suggested_next_steps.is_empty());

        let state = storage.get_state(&ctx.state_id).await.unwrap().unwrap();
        assert_eq!(state.current_message_id, next.message_id);
        assert_eq!(state.status, StateStatus::Processing);
    }

    #[tokio::test]
    async fn test_run_to_completion_respects_semi_autonomous_cap() {
        let (storage, engine, ctx) =
            setup(scripted_agents(1, true), ResearchMode::SemiAutonomous).await;

        engine.run_to_completion(ctx.clone()).await.unwrap();

        let messages = storage.get_conversation_messages("conv-1").await.unwrap();
        assert_eq!(messages.len(), 5);
        assert!(messages.iter().all(|m| m.is_complete()));
        assert!(messages.last().unwrap().content.starts_with("reply final=true"));
        // Reply windows cover every level since the user's message.
        assert!(messages.last().unwrap().content.ends_with("tasks=5"));

        let state = storage.get_state(&ctx.state_id).await.unwrap().unwrap();
        assert_eq!(state.iteration, 5);
        assert_eq!(state.status, StateStatus::Completed);
    }

    #[tokio::test]
    async fn test_hypothesis_failure_leaves_message_without_reply() {
        let mut agents = MockResearchAgents::new();
        agents.expect_plan().returning(|_| {
            Ok(PlanOutput {
                objective: "x".to_string(),
                tasks: vec![planned("t")],
            })
        });
        agents
            .expect_hypothesize()
            .returning(|_| Err(ResearchError::contract("hypothesis", "not JSON").into()));
        agents.expect_reply().never();

        let (storage, engine, ctx) = setup(agents, ResearchMode::Steering).await;
        let err = engine.run_iteration(&ctx).await.unwrap_err();
        assert!(matches!(err, AppError::Research(_)));

        engine.record_failure(&ctx.state_id, &err.to_string()).await.unwrap();
        let state = storage.get_state(&ctx.state_id).await.unwrap().unwrap();
        assert_eq!(state.status, StateStatus::Failed);
        assert!(state.error.unwrap().contains("hypothesis agent"));
        let message = storage.get_message(&ctx.message_id).await.unwrap().unwrap();
        assert!(!message.is_complete());
        assert!(message.content.is_empty());
    }

    #[tokio::test]
    async fn test_rerun_after_failure_resumes_planned_level() {
        let (storage, engine, ctx) =
            setup(flaky_agents(0, false, 1), ResearchMode::Steering).await;

        engine.run_iteration(&ctx).await.unwrap_err();
        let planned = storage
            .get_conversation_state(&ctx.conversation_state_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(planned.current_level, 0);
        assert_eq!(planned.plan.len(), 1);
        let state = storage.get_state(&ctx.state_id).await.unwrap().unwrap();
        assert_eq!(state.planned_level, Some(0));

        // Same payload, as a queued retry would replay it.
        let outcome = engine.run_iteration(&ctx).await.unwrap();
        assert_eq!(outcome, IterationOutcome::Finished);

        let resumed = storage
            .get_conversation_state(&ctx.conversation_state_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resumed.current_level, 0);
        assert_eq!(resumed.plan.len(), 1);
        assert_eq!(resumed.plan[0].objective, "telomerase overview");
        let message = storage.get_message(&ctx.message_id).await.unwrap().unwrap();
        assert_eq!(message.content, "reply final=true tasks=1");
    }
}
