//! Request/response contracts for the research agents.
//!
//! The engine only depends on these shapes. Every output type implements
//! [`AgentOutput`], and its `validate` runs as soon as a response is received
//! so malformed answers fail fast instead of surfacing deep in the loop.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use super::ResearchMode;
use crate::error::AppResult;
use crate::storage::{Artifact, Dataset, Discovery, Paper, PlanTask, TaskType};

/// Structured agent output that can check its own contract.
pub trait AgentOutput: DeserializeOwned {
    /// Return a description of the first contract violation, if any.
    fn validate(&self) -> Result<(), String>;
}

/// Planner invocation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanMode {
    /// Plan a new level to execute immediately.
    Initial,
    /// Propose the following level without committing it.
    Next,
}

impl PlanMode {
    /// Get the mode name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanMode::Initial => "initial",
            PlanMode::Next => "next",
        }
    }
}

/// Compact view of a task handed to agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub level: i32,
    pub objective: String,
    pub output: String,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

impl TaskSummary {
    /// Summarize promoted tasks, skipping any without an id or level.
    pub fn from_tasks(tasks: &[PlanTask]) -> Vec<Self> {
        tasks
            .iter()
            .filter_map(|t| {
                Some(Self {
                    id: t.id.clone()?,
                    task_type: t.task_type,
                    level: t.level?,
                    objective: t.objective.clone(),
                    output: t.output.clone(),
                    job_id: t.job_id.clone(),
                    artifacts: t.artifacts.clone(),
                })
            })
            .collect()
    }
}

/// Input to the planner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanRequest {
    pub conversation_state_id: String,
    pub mode: PlanMode,
    pub research_mode: ResearchMode,
    /// The user question driving this run.
    pub question: String,
    pub objective: String,
    pub current_objective: String,
    pub current_hypothesis: String,
    pub key_insights: Vec<String>,
    /// Every task already in the plan.
    pub plan: Vec<TaskSummary>,
}

/// A task as proposed by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedTask {
    pub objective: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(default)]
    pub datasets: Vec<Dataset>,
}

impl PlannedTask {
    /// Describe a staged or promoted task for an agent.
    pub fn from_task(task: &PlanTask) -> Self {
        Self {
            objective: task.objective.clone(),
            task_type: task.task_type,
            datasets: task.datasets.clone(),
        }
    }

    /// Convert into a suggested plan task (no id, no level).
    pub fn into_plan_task(self) -> PlanTask {
        match self.task_type {
            TaskType::Literature => PlanTask::literature(self.objective),
            TaskType::Analysis => PlanTask::analysis(self.objective, self.datasets),
        }
    }
}

/// Planner output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanOutput {
    /// Objective of the planned batch.
    #[serde(default)]
    pub objective: String,
    #[serde(default)]
    pub tasks: Vec<PlannedTask>,
}

impl AgentOutput for PlanOutput {
    fn validate(&self) -> Result<(), String> {
        if let Some(i) = self.tasks.iter().position(|t| t.objective.trim().is_empty()) {
            return Err(format!("task {} has an empty objective", i));
        }
        Ok(())
    }
}

/// Input to the hypothesis agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HypothesisRequest {
    pub conversation_state_id: String,
    pub objective: String,
    pub question: String,
    pub completed_tasks: Vec<TaskSummary>,
    pub current_hypothesis: String,
    pub key_insights: Vec<String>,
}

/// Whether the hypothesis was created from scratch or refined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HypothesisMode {
    Create,
    Update,
}

/// Hypothesis agent output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypothesisOutput {
    pub hypothesis: String,
    pub mode: HypothesisMode,
}

impl AgentOutput for HypothesisOutput {
    fn validate(&self) -> Result<(), String> {
        if self.hypothesis.trim().is_empty() {
            return Err("hypothesis is empty".to_string());
        }
        Ok(())
    }
}

/// Input to the reflection agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReflectionRequest {
    pub conversation_state_id: String,
    pub objective: String,
    pub current_objective: String,
    pub hypothesis: String,
    pub completed_tasks: Vec<TaskSummary>,
    pub key_insights: Vec<String>,
    pub methodology: String,
    pub conversation_title: Option<String>,
}

/// Reflection agent output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionOutput {
    pub current_objective: String,
    #[serde(default)]
    pub key_insights: Vec<String>,
    #[serde(default)]
    pub methodology: String,
    #[serde(default)]
    pub conversation_title: Option<String>,
    /// Proposed overall objective; applied only while none is set.
    #[serde(default)]
    pub objective: Option<String>,
}

impl AgentOutput for ReflectionOutput {
    fn validate(&self) -> Result<(), String> {
        if self.current_objective.trim().is_empty() {
            return Err("current_objective is empty".to_string());
        }
        Ok(())
    }
}

/// Input to the discovery agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryRequest {
    pub conversation_state_id: String,
    pub objective: String,
    pub hypothesis: String,
    pub completed_tasks: Vec<TaskSummary>,
    pub discoveries: Vec<Discovery>,
}

/// Discovery agent output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryOutput {
    #[serde(default)]
    pub discoveries: Vec<Discovery>,
}

impl AgentOutput for DiscoveryOutput {
    fn validate(&self) -> Result<(), String> {
        for (i, d) in self.discoveries.iter().enumerate() {
            if d.title.trim().is_empty() || d.claim.trim().is_empty() {
                return Err(format!("discovery {} is missing a title or claim", i));
            }
        }
        Ok(())
    }
}

/// Why the loop continued or stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    /// The planner proposed no further work.
    NoNextSteps,
    /// The research mode's iteration cap was reached.
    IterationLimit,
    /// The continuation agent decided.
    AgentDecision,
    /// The continuation agent failed; stopped conservatively.
    DecisionFallback,
}

/// Input to the continuation agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContinuationRequest {
    pub conversation_state_id: String,
    pub objective: String,
    pub question: String,
    pub hypothesis: String,
    pub completed_tasks: Vec<TaskSummary>,
    pub suggested_next_steps: Vec<PlannedTask>,
    pub iteration: u32,
    pub max_iterations: u32,
    pub research_mode: ResearchMode,
}

/// Continue-vs-stop decision recorded for every iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuationDecision {
    pub should_continue: bool,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default = "agent_trigger")]
    pub trigger_reason: TriggerReason,
}

fn agent_trigger() -> TriggerReason {
    TriggerReason::AgentDecision
}

impl ContinuationDecision {
    /// A stop decision taken without consulting the agent.
    pub fn stop(trigger_reason: TriggerReason, reasoning: impl Into<String>) -> Self {
        Self {
            should_continue: false,
            confidence: 1.0,
            reasoning: reasoning.into(),
            trigger_reason,
        }
    }
}

impl AgentOutput for ContinuationDecision {
    fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!("confidence {} outside 0..=1", self.confidence));
        }
        Ok(())
    }
}

/// Input to the reply composer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplyRequest {
    pub conversation_state_id: String,
    /// The user question that opened this session.
    pub question: String,
    pub objective: String,
    pub current_objective: String,
    pub hypothesis: String,
    pub key_insights: Vec<String>,
    pub discoveries: Vec<Discovery>,
    /// Tasks from the session's first level through the current one.
    pub tasks: Vec<TaskSummary>,
    pub suggested_next_steps: Vec<PlannedTask>,
    /// `false` while auto-continuing.
    pub is_final: bool,
    pub research_mode: ResearchMode,
}

/// Reply composer output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyOutput {
    pub reply: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub papers: Vec<Paper>,
}

impl AgentOutput for ReplyOutput {
    fn validate(&self) -> Result<(), String> {
        if self.reply.trim().is_empty() {
            return Err("reply is empty".to_string());
        }
        Ok(())
    }
}

/// The research agents the iteration engine consumes.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResearchAgents: Send + Sync {
    /// Plan a batch of tasks.
    async fn plan(&self, request: PlanRequest) -> AppResult<PlanOutput>;
    /// Create or refine the working hypothesis.
    async fn hypothesize(&self, request: HypothesisRequest) -> AppResult<HypothesisOutput>;
    /// Reflect on the latest batch.
    async fn reflect(&self, request: ReflectionRequest) -> AppResult<ReflectionOutput>;
    /// Extract discoveries from the latest batch.
    async fn discover(&self, request: DiscoveryRequest) -> AppResult<DiscoveryOutput>;
    /// Decide whether to keep iterating without the user.
    async fn decide_continuation(
        &self,
        request: ContinuationRequest,
    ) -> AppResult<ContinuationDecision>;
    /// Compose the user-visible reply.
    async fn reply(&self, request: ReplyRequest) -> AppResult<ReplyOutput>;
}
