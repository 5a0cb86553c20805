//! Storage layer for research state persistence.
//!
//! This module holds the persisted data model (conversation research state,
//! plan tasks, messages, per-run execution states, run guard records) and the
//! [`Storage`] trait the engine is written against. [`SqliteStorage`] is the
//! production implementation.

pub(crate) mod sqlite;

pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageResult;
use crate::research::{ContinuationDecision, ResearchMode};

/// Kind of work a plan task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    /// Literature search across every configured literature source.
    Literature,
    /// Data analysis over the task's datasets.
    Analysis,
}

impl TaskType {
    /// Get the task type as its wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Literature => "LITERATURE",
            TaskType::Analysis => "ANALYSIS",
        }
    }

    /// Prefix used when deriving task ids.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            TaskType::Literature => "lit",
            TaskType::Analysis => "ana",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "LITERATURE" => Ok(TaskType::Literature),
            "ANALYSIS" => Ok(TaskType::Analysis),
            _ => Err(format!("Unknown task type: {}", s)),
        }
    }
}

/// A dataset handed to an analysis task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// Dataset identifier.
    pub id: String,
    /// Original file name.
    pub filename: String,
    /// Short description of the contents.
    #[serde(default)]
    pub description: String,
}

/// A file or figure produced by a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Artifact identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// What the artifact shows.
    #[serde(default)]
    pub description: String,
    /// Location of the artifact, when the backend exposes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// One unit of planned work within a conversation's plan.
///
/// Tasks start life as suggestions (no id, no level), are promoted into the
/// plan with an id and level, and are then executed exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanTask {
    /// Derived id (`lit-<level>`, `ana-<level>`), unset while suggested.
    #[serde(default)]
    pub id: Option<String>,
    /// What the task should find out.
    pub objective: String,
    /// Kind of work.
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Plan level, assigned at promotion time.
    #[serde(default)]
    pub level: Option<i32>,
    /// Datasets for analysis tasks.
    #[serde(default)]
    pub datasets: Vec<Dataset>,
    /// When execution began.
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    /// When execution finished (successfully or not).
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    /// Accumulated backend output, including recorded failures.
    #[serde(default)]
    pub output: String,
    /// Artifacts produced while executing.
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    /// External reference to the backend run.
    #[serde(default)]
    pub job_id: Option<String>,
}

impl PlanTask {
    /// Create a suggested literature task.
    pub fn literature(objective: impl Into<String>) -> Self {
        Self::suggested(objective, TaskType::Literature)
    }

    /// Create a suggested analysis task over the given datasets.
    pub fn analysis(objective: impl Into<String>, datasets: Vec<Dataset>) -> Self {
        let mut task = Self::suggested(objective, TaskType::Analysis);
        task.datasets = datasets;
        task
    }

    fn suggested(objective: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            id: None,
            objective: objective.into(),
            task_type,
            level: None,
            datasets: Vec::new(),
            start: None,
            end: None,
            output: String::new(),
            artifacts: Vec::new(),
            job_id: None,
        }
    }

    /// Whether the task has finished executing.
    pub fn is_complete(&self) -> bool {
        self.end.is_some()
    }

    /// Whether the task is currently executing.
    pub fn is_running(&self) -> bool {
        self.start.is_some() && self.end.is_none()
    }
}

/// Reference from a discovery to the work that supports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRef {
    /// Supporting task id.
    pub task_id: String,
    /// Backend job id, when the evidence came from a backend run.
    #[serde(default)]
    pub job_id: Option<String>,
    /// How the task supports the claim.
    #[serde(default)]
    pub explanation: String,
}

/// A research discovery extracted from completed work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discovery {
    pub title: String,
    pub claim: String,
    pub summary: String,
    #[serde(default)]
    pub evidence_array: Vec<EvidenceRef>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    /// Free-form novelty assessment.
    #[serde(default)]
    pub novelty: String,
}

/// Persisted research state of one conversation.
///
/// Written only by the active iteration loop for the conversation, one
/// read-modify-persist per discrete step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    /// Unique state identifier.
    pub id: String,
    /// Conversation this state belongs to.
    pub conversation_id: String,
    /// Objective from the first user message; never overwritten automatically.
    #[serde(default)]
    pub objective: String,
    /// Objective of the current iteration.
    #[serde(default)]
    pub current_objective: String,
    /// Every promoted task, in level order. Append-only.
    #[serde(default)]
    pub plan: Vec<PlanTask>,
    /// Proposed tasks awaiting promotion.
    #[serde(default)]
    pub suggested_next_steps: Vec<PlanTask>,
    /// Highest level in `plan`, -1 while the plan is empty.
    #[serde(default = "empty_level")]
    pub current_level: i32,
    #[serde(default)]
    pub current_hypothesis: String,
    #[serde(default)]
    pub key_insights: Vec<String>,
    #[serde(default)]
    pub discoveries: Vec<Discovery>,
    #[serde(default)]
    pub methodology: String,
    /// Sticky research mode, overridable per request.
    #[serde(default)]
    pub research_mode: Option<ResearchMode>,
    #[serde(default)]
    pub conversation_title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn empty_level() -> i32 {
    -1
}

impl ConversationState {
    /// Create an empty state for a conversation.
    pub fn new(conversation_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            objective: String::new(),
            current_objective: String::new(),
            plan: Vec::new(),
            suggested_next_steps: Vec::new(),
            current_level: empty_level(),
            current_hypothesis: String::new(),
            key_insights: Vec::new(),
            discoveries: Vec::new(),
            methodology: String::new(),
            research_mode: None,
            conversation_title: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Highest level present in the plan, -1 when empty.
    pub fn max_level(&self) -> i32 {
        self.plan
            .iter()
            .filter_map(|t| t.level)
            .max()
            .unwrap_or_else(empty_level)
    }

    /// Tasks promoted at the given level.
    pub fn tasks_at_level(&self, level: i32) -> Vec<PlanTask> {
        self.plan
            .iter()
            .filter(|t| t.level == Some(level))
            .cloned()
            .collect()
    }

    /// Tasks whose level lies within `[from, to]`.
    pub fn tasks_in_window(&self, from: i32, to: i32) -> Vec<PlanTask> {
        self.plan
            .iter()
            .filter(|t| t.level.is_some_and(|l| l >= from && l <= to))
            .cloned()
            .collect()
    }

    /// Find a promoted task by id.
    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut PlanTask> {
        self.plan
            .iter_mut()
            .find(|t| t.id.as_deref() == Some(task_id))
    }
}

/// Who authored a message row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageSource {
    /// Sent by the user.
    #[default]
    User,
    /// Created by auto-continuation.
    Agent,
}

impl std::fmt::Display for MessageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageSource::User => write!(f, "user"),
            MessageSource::Agent => write!(f, "agent"),
        }
    }
}

impl std::str::FromStr for MessageSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(MessageSource::User),
            "agent" => Ok(MessageSource::Agent),
            _ => Err(format!("Unknown message source: {}", s)),
        }
    }
}

/// A paper cited by a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paper {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// One user-visible conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub source: MessageSource,
    /// The user's question; empty for agent-authored continuations.
    pub question: String,
    /// Final reply text.
    pub content: String,
    /// Short extract for history.
    pub summary: String,
    /// Milliseconds from creation to reply. Set only once the reply is ready.
    pub response_time: Option<i64>,
    /// Execution state shared by every message in one run's lineage.
    pub state_id: String,
    pub papers: Vec<Paper>,
    pub files: Vec<Artifact>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// Create a user-authored message.
    pub fn from_user(
        conversation_id: impl Into<String>,
        question: impl Into<String>,
        state_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            source: MessageSource::User,
            question: question.into(),
            content: String::new(),
            summary: String::new(),
            response_time: None,
            state_id: state_id.into(),
            papers: Vec::new(),
            files: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Create an agent-authored continuation in the same lineage.
    pub fn continuation(conversation_id: impl Into<String>, state_id: impl Into<String>) -> Self {
        let mut message = Self::from_user(conversation_id, String::new(), state_id);
        message.source = MessageSource::Agent;
        message
    }

    /// Whether the reply for this message is ready.
    pub fn is_complete(&self) -> bool {
        self.response_time.is_some()
    }
}

/// Status of a run's execution state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateStatus {
    #[default]
    Processing,
    Completed,
    Failed,
}

impl std::fmt::Display for StateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateStatus::Processing => write!(f, "processing"),
            StateStatus::Completed => write!(f, "completed"),
            StateStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for StateStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "processing" => Ok(StateStatus::Processing),
            "completed" => Ok(StateStatus::Completed),
            "failed" => Ok(StateStatus::Failed),
            _ => Err(format!("Unknown state status: {}", s)),
        }
    }
}

/// Per-run execution state shared by every message in a continuation chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub id: String,
    pub conversation_state_id: String,
    pub status: StateStatus,
    pub error: Option<String>,
    /// Message the run is currently driving.
    pub current_message_id: String,
    /// Iterations completed so far.
    pub iteration: u32,
    /// Decision taken at the end of the latest iteration.
    pub last_decision: Option<ContinuationDecision>,
    /// Level the run's first iteration planned, once planning succeeded.
    pub planned_level: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionState {
    /// Create a processing state for a run starting at `message_id`.
    pub fn new(conversation_state_id: impl Into<String>, message_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_state_id: conversation_state_id.into(),
            status: StateStatus::Processing,
            error: None,
            current_message_id: message_id.into(),
            iteration: 0,
            last_decision: None,
            planned_level: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Run guard lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Finished,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Running => write!(f, "running"),
            RunState::Finished => write!(f, "finished"),
        }
    }
}

impl std::str::FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "running" => Ok(RunState::Running),
            "finished" => Ok(RunState::Finished),
            _ => Err(format!("Unknown run state: {}", s)),
        }
    }
}

/// How a finished run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunResult {
    Success,
    Failed,
}

impl std::fmt::Display for RunResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunResult::Success => write!(f, "success"),
            RunResult::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for RunResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "success" => Ok(RunResult::Success),
            "failed" => Ok(RunResult::Failed),
            _ => Err(format!("Unknown run result: {}", s)),
        }
    }
}

/// Run guard record, one per conversation state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub conversation_state_id: String,
    /// Job driving the current iteration (the current message id).
    pub job_id: String,
    pub message_id: String,
    pub state_id: String,
    pub status: RunState,
    pub result: Option<RunResult>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    /// Create a running record.
    pub fn running(
        conversation_state_id: impl Into<String>,
        job_id: impl Into<String>,
        message_id: impl Into<String>,
        state_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            conversation_state_id: conversation_state_id.into(),
            job_id: job_id.into(),
            message_id: message_id.into(),
            state_id: state_id.into(),
            status: RunState::Running,
            result: None,
            error: None,
            started_at: now,
            updated_at: now,
        }
    }

    /// Whether the run is still active.
    pub fn is_running(&self) -> bool {
        self.status == RunState::Running
    }
}

/// Agent pipe invocation log entry for debugging and metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    pub id: String,
    /// Conversation state the call was made for.
    pub session_id: Option<String>,
    /// Agent or backend name.
    pub tool_name: String,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub pipe_name: Option<String>,
    pub latency_ms: Option<i64>,
    pub success: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Invocation {
    /// Create a new invocation log entry.
    pub fn new(tool_name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: None,
            tool_name: tool_name.into(),
            input,
            output: None,
            pipe_name: None,
            latency_ms: None,
            success: true,
            error: None,
            created_at: Utc::now(),
        }
    }

    /// Attach the conversation state id.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Attach the pipe name.
    pub fn with_pipe(mut self, pipe_name: impl Into<String>) -> Self {
        self.pipe_name = Some(pipe_name.into());
        self
    }

    /// Mark as successful.
    pub fn success(mut self, output: serde_json::Value, latency_ms: i64) -> Self {
        self.output = Some(output);
        self.latency_ms = Some(latency_ms);
        self.success = true;
        self
    }

    /// Mark as failed.
    pub fn failure(mut self, error: impl Into<String>, latency_ms: i64) -> Self {
        self.error = Some(error.into());
        self.latency_ms = Some(latency_ms);
        self.success = false;
        self
    }
}

/// Storage trait for research persistence.
///
/// Read-modify-write without multi-row transactions; the run guard operations
/// are the only ones that must be atomic.
#[async_trait]
pub trait Storage: Send + Sync {
    // Conversation state operations

    /// Create a new conversation state.
    async fn create_conversation_state(&self, state: &ConversationState) -> StorageResult<()>;
    /// Get a conversation state by ID.
    async fn get_conversation_state(&self, id: &str) -> StorageResult<Option<ConversationState>>;
    /// Get the conversation state belonging to a conversation.
    async fn get_conversation_state_by_conversation(
        &self,
        conversation_id: &str,
    ) -> StorageResult<Option<ConversationState>>;
    /// Persist an updated conversation state.
    async fn update_conversation_state(&self, state: &ConversationState) -> StorageResult<()>;

    // Message operations

    /// Create a message.
    async fn create_message(&self, message: &Message) -> StorageResult<()>;
    /// Get a message by ID.
    async fn get_message(&self, id: &str) -> StorageResult<Option<Message>>;
    /// Persist an updated message.
    async fn update_message(&self, message: &Message) -> StorageResult<()>;
    /// Delete a message. Returns `false` if it did not exist.
    async fn delete_message(&self, id: &str) -> StorageResult<bool>;
    /// Get every message of a conversation, oldest first.
    async fn get_conversation_messages(&self, conversation_id: &str)
        -> StorageResult<Vec<Message>>;
    /// Count the messages of a conversation.
    async fn count_conversation_messages(&self, conversation_id: &str) -> StorageResult<usize>;

    // Execution state operations

    /// Create an execution state.
    async fn create_state(&self, state: &ExecutionState) -> StorageResult<()>;
    /// Get an execution state by ID.
    async fn get_state(&self, id: &str) -> StorageResult<Option<ExecutionState>>;
    /// Persist an updated execution state.
    async fn update_state(&self, state: &ExecutionState) -> StorageResult<()>;
    /// Delete an execution state. Returns `false` if it did not exist.
    async fn delete_state(&self, id: &str) -> StorageResult<bool>;

    // Run guard operations

    /// Atomically record a run as started.
    ///
    /// Returns `false` without writing when the conversation already has a
    /// running record.
    async fn try_mark_run_started(&self, record: &RunRecord) -> StorageResult<bool>;
    /// Get the run record of a conversation state.
    async fn get_run(&self, conversation_state_id: &str) -> StorageResult<Option<RunRecord>>;
    /// Point a running record at the job/message driving the next iteration.
    async fn advance_run(
        &self,
        conversation_state_id: &str,
        job_id: &str,
        message_id: &str,
    ) -> StorageResult<()>;
    /// Close the running record for `state_id`. Returns whether a record was closed.
    async fn finish_run(
        &self,
        conversation_state_id: &str,
        state_id: &str,
        result: RunResult,
        error: Option<&str>,
    ) -> StorageResult<bool>;
    /// List every record still marked running.
    async fn list_running_runs(&self) -> StorageResult<Vec<RunRecord>>;

    // Start lock operations

    /// Try to take a named lock until `expires_at_ms`; expired locks are taken over.
    async fn try_acquire_lock(
        &self,
        key: &str,
        owner: &str,
        expires_at_ms: i64,
        now_ms: i64,
    ) -> StorageResult<bool>;
    /// Release a lock held by `owner`.
    async fn release_lock(&self, key: &str, owner: &str) -> StorageResult<()>;

    // Invocation logging

    /// Log an agent or backend invocation.
    async fn log_invocation(&self, invocation: &Invocation) -> StorageResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_type_round_trip_strings() {
        assert_eq!(TaskType::Literature.as_str(), "LITERATURE");
        assert_eq!("analysis".parse::<TaskType>().unwrap(), TaskType::Analysis);
        assert!("REVIEW".parse::<TaskType>().is_err());
    }

    #[test]
    fn test_plan_task_deserializes_type_field() {
        let task: PlanTask = serde_json::from_value(serde_json::json!({
            "objective": "Survey telomerase structure",
            "type": "LITERATURE"
        }))
        .unwrap();
        assert_eq!(task.task_type, TaskType::Literature);
        assert!(task.id.is_none());
        assert!(task.level.is_none());
        assert!(task.output.is_empty());
    }

    #[test]
    fn test_plan_task_lifecycle_flags() {
        let mut task = PlanTask::literature("x");
        assert!(!task.is_running());
        task.start = Some(Utc::now());
        assert!(task.is_running());
        task.end = Some(Utc::now());
        assert!(task.is_complete());
        assert!(!task.is_running());
    }

    #[test]
    fn test_conversation_state_levels() {
        let mut state = ConversationState::new("conv-1");
        assert_eq!(state.current_level, -1);
        assert_eq!(state.max_level(), -1);

        let mut a = PlanTask::literature("a");
        a.level = Some(0);
        a.id = Some("lit-0".to_string());
        let mut b = PlanTask::analysis("b", vec![]);
        b.level = Some(1);
        b.id = Some("ana-1".to_string());
        state.plan.push(a);
        state.plan.push(b);

        assert_eq!(state.max_level(), 1);
        assert_eq!(state.tasks_at_level(1).len(), 1);
        assert_eq!(state.tasks_in_window(0, 1).len(), 2);
        assert_eq!(state.tasks_in_window(1, 1).len(), 1);
        assert!(state.task_mut("ana-1").is_some());
        assert!(state.task_mut("lit-7").is_none());
    }

    #[test]
    fn test_conversation_state_defaults_when_deserializing_sparse_json() {
        let state: ConversationState = serde_json::from_value(serde_json::json!({
            "id": "s-1",
            "conversation_id": "c-1",
            "created_at": "2025-01-01T00:00:00Z",
            "updated_at": "2025-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(state.current_level, -1);
        assert!(state.plan.is_empty());
        assert!(state.research_mode.is_none());
    }

    #[test]
    fn test_continuation_message_is_agent_authored() {
        let message = Message::continuation("conv-1", "state-1");
        assert_eq!(message.source, MessageSource::Agent);
        assert!(message.question.is_empty());
        assert_eq!(message.state_id, "state-1");
        assert!(!message.is_complete());
    }

    #[test]
    fn test_status_enums_parse() {
        assert_eq!("failed".parse::<StateStatus>().unwrap(), StateStatus::Failed);
        assert_eq!("running".parse::<RunState>().unwrap(), RunState::Running);
        assert_eq!("success".parse::<RunResult>().unwrap(), RunResult::Success);
        assert_eq!("agent".parse::<MessageSource>().unwrap(), MessageSource::Agent);
        assert!("paused".parse::<RunState>().is_err());
    }

    #[test]
    fn test_invocation_builder() {
        let inv = Invocation::new("planner", serde_json::json!({"mode": "initial"}))
            .with_session("state-1")
            .with_pipe("research-planner-v1")
            .failure("timeout", 120);
        assert!(!inv.success);
        assert_eq!(inv.error.as_deref(), Some("timeout"));
        assert_eq!(inv.latency_ms, Some(120));
        assert_eq!(inv.pipe_name.as_deref(), Some("research-planner-v1"));
    }
}
