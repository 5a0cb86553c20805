//! Shared fixtures for integration tests.
//!
//! `ScriptedAgents` answers every agent call with fixed, valid outputs so the
//! iteration engine can be driven end to end without Langbase.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use mcp_deep_research::config::ResearchConfig;
use mcp_deep_research::error::{AppResult, ResearchError};
use mcp_deep_research::research::{
    AnalysisBackend, BackendOutput, BackendRegistry, ContinuationDecision, ContinuationRequest,
    DiscoveryOutput, DiscoveryRequest, HypothesisMode, HypothesisOutput, HypothesisRequest,
    InlineExecutor, LiteratureBackend, LiteratureSource, MessageStatus, PlanMode, PlanOutput,
    PlanRequest, PlannedTask, ReflectionOutput, ReflectionRequest, ReplyOutput, ReplyRequest,
    ResearchAgents, ResearchEngine, ResearchService, RunGuard,
};
use mcp_deep_research::storage::{Dataset, SqliteStorage, Storage, TaskType};

/// Agents with canned answers.
pub struct ScriptedAgents {
    /// Tasks proposed by each `next` planning call.
    pub next_steps: usize,
    /// What the continuation agent answers.
    pub keep_going: bool,
    /// Fail every initial planning call.
    pub fail_planning: AtomicBool,
    /// When set, initial planning waits for a permit.
    pub gate: Option<Arc<Semaphore>>,
    pub plan_calls: AtomicUsize,
    pub reply_calls: AtomicUsize,
}

impl ScriptedAgents {
    pub fn new() -> Self {
        Self {
            next_steps: 1,
            keep_going: false,
            fail_planning: AtomicBool::new(false),
            gate: None,
            plan_calls: AtomicUsize::new(0),
            reply_calls: AtomicUsize::new(0),
        }
    }

    pub fn continuing(mut self) -> Self {
        self.keep_going = true;
        self
    }

    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn failing(self) -> Self {
        self.fail_planning.store(true, Ordering::SeqCst);
        self
    }
}

impl Default for ScriptedAgents {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResearchAgents for ScriptedAgents {
    async fn plan(&self, request: PlanRequest) -> AppResult<PlanOutput> {
        self.plan_calls.fetch_add(1, Ordering::SeqCst);
        match request.mode {
            PlanMode::Initial => {
                if let Some(gate) = &self.gate {
                    if let Ok(permit) = gate.acquire().await {
                        permit.forget();
                    }
                }
                if self.fail_planning.load(Ordering::SeqCst) {
                    return Err(ResearchError::contract("planner", "planner is offline").into());
                }
                Ok(PlanOutput {
                    objective: format!("Answer: {}", request.question),
                    tasks: vec![
                        PlannedTask {
                            objective: "Survey telomerase structure".to_string(),
                            task_type: TaskType::Literature,
                            datasets: vec![],
                        },
                        PlannedTask {
                            objective: "Survey telomerase regulation".to_string(),
                            task_type: TaskType::Literature,
                            datasets: vec![],
                        },
                    ],
                })
            }
            PlanMode::Next => Ok(PlanOutput {
                objective: String::new(),
                tasks: (0..self.next_steps)
                    .map(|n| PlannedTask {
                        objective: format!("Follow-up literature search {}", n + 1),
                        task_type: TaskType::Literature,
                        datasets: vec![],
                    })
                    .collect(),
            }),
        }
    }

    async fn hypothesize(&self, _request: HypothesisRequest) -> AppResult<HypothesisOutput> {
        Ok(HypothesisOutput {
            hypothesis: "Telomerase extends telomeres in dividing cells".to_string(),
            mode: HypothesisMode::Create,
        })
    }

    async fn reflect(&self, request: ReflectionRequest) -> AppResult<ReflectionOutput> {
        Ok(ReflectionOutput {
            current_objective: format!("Refine: {}", request.objective),
            key_insights: vec!["TERT is the catalytic subunit".to_string()],
            methodology: "Literature review".to_string(),
            conversation_title: Some("Telomerase".to_string()),
            objective: None,
        })
    }

    async fn discover(&self, _request: DiscoveryRequest) -> AppResult<DiscoveryOutput> {
        Ok(DiscoveryOutput {
            discoveries: vec![],
        })
    }

    async fn decide_continuation(
        &self,
        _request: ContinuationRequest,
    ) -> AppResult<ContinuationDecision> {
        Ok(ContinuationDecision {
            should_continue: self.keep_going,
            confidence: 0.8,
            reasoning: "scripted".to_string(),
            trigger_reason: mcp_deep_research::research::TriggerReason::AgentDecision,
        })
    }

    async fn reply(&self, request: ReplyRequest) -> AppResult<ReplyOutput> {
        let n = self.reply_calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ReplyOutput {
            reply: format!(
                "Reply {} on '{}' covering {} tasks",
                n,
                request.question,
                request.tasks.len()
            ),
            summary: String::new(),
            papers: vec![],
        })
    }
}

/// Literature backend that echoes the objective.
pub struct EchoLiterature(pub LiteratureSource);

#[async_trait]
impl LiteratureBackend for EchoLiterature {
    fn source(&self) -> LiteratureSource {
        self.0
    }

    async fn search(&self, objective: &str) -> AppResult<BackendOutput> {
        Ok(BackendOutput {
            output: format!("{} findings for {}", self.0, objective),
            job_id: None,
            artifacts: vec![],
        })
    }
}

/// Analysis backend that never finds anything.
pub struct NoAnalysis;

#[async_trait]
impl AnalysisBackend for NoAnalysis {
    async fn analyze(&self, _objective: &str, _datasets: &[Dataset]) -> AppResult<BackendOutput> {
        Ok(BackendOutput::default())
    }
}

pub fn echo_backends() -> BackendRegistry {
    BackendRegistry::new(
        vec![
            Arc::new(EchoLiterature(LiteratureSource::OpenScholar)),
            Arc::new(EchoLiterature(LiteratureSource::Knowledge)),
        ],
        Arc::new(NoAnalysis),
    )
}

/// Engine over `storage` with echo backends.
pub fn engine(
    storage: Arc<dyn Storage>,
    agents: Arc<dyn ResearchAgents>,
    config: &ResearchConfig,
) -> Arc<ResearchEngine> {
    Arc::new(ResearchEngine::new(
        storage,
        agents,
        echo_backends(),
        config.clone(),
    ))
}

/// Inline service over an in-memory database.
pub async fn inline_service(
    agents: Arc<dyn ResearchAgents>,
    config: ResearchConfig,
) -> (Arc<SqliteStorage>, Arc<ResearchService>) {
    let storage = Arc::new(
        SqliteStorage::new_in_memory()
            .await
            .expect("Failed to create in-memory storage"),
    );
    let shared: Arc<dyn Storage> = storage.clone();
    let guard = RunGuard::from_config(shared.clone(), &config);
    let executor = Arc::new(InlineExecutor::new(
        engine(shared.clone(), agents, &config),
        guard.clone(),
    ));
    let service = Arc::new(ResearchService::new(shared, guard, executor, config));
    (storage, service)
}

/// Poll a message until it leaves `Processing`.
pub async fn wait_for_terminal(service: &ResearchService, message_id: &str) -> MessageStatus {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let status = service
            .get_status(message_id)
            .await
            .expect("status lookup failed");
        if status != MessageStatus::Processing {
            return status;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "message {} still processing",
            message_id
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll until the conversation has no running run.
pub async fn wait_for_idle(storage: &dyn Storage, conversation_state_id: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let run = storage
            .get_run(conversation_state_id)
            .await
            .expect("run lookup failed");
        if !run.map(|r| r.is_running()).unwrap_or(false) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "run for {} never finished",
            conversation_state_id
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
