//! Leveled task planning.
//!
//! `initial` planning appends a new level to the plan immediately; `next`
//! planning only stages suggestions, which [`promote_suggestions`] commits
//! when the loop decides to continue.

use tracing::{debug, info};

use super::agents::{PlanMode, PlanRequest, ResearchAgents, TaskSummary};
use super::state::StateHandle;
use super::ResearchMode;
use crate::error::{AppResult, ResearchError};
use crate::storage::{ConversationState, PlanTask, TaskType};

/// Derive a unique id for a task of `task_type` promoted at `level`.
///
/// The first task of a type at a level gets `<prefix>-<level>`; later ones
/// get `-2`, `-3`, ... suffixes.
pub fn assign_task_id(plan: &[PlanTask], task_type: TaskType, level: i32) -> String {
    let base = format!("{}-{}", task_type.id_prefix(), level);
    let taken = plan
        .iter()
        .filter(|t| t.task_type == task_type && t.level == Some(level))
        .count();
    if taken == 0 {
        base
    } else {
        format!("{}-{}", base, taken + 1)
    }
}

/// Append tasks to the plan at a new level and return that level.
pub fn promote_tasks(state: &mut ConversationState, tasks: Vec<PlanTask>) -> i32 {
    let level = state.max_level() + 1;
    for mut task in tasks {
        task.id = Some(assign_task_id(&state.plan, task.task_type, level));
        task.level = Some(level);
        task.start = None;
        task.end = None;
        task.output.clear();
        state.plan.push(task);
    }
    state.current_level = state.max_level();
    level
}

/// Promote the staged suggestions into the plan and clear them.
///
/// Returns the new level, or `None` when nothing was staged.
pub fn promote_suggestions(state: &mut ConversationState) -> Option<i32> {
    if state.suggested_next_steps.is_empty() {
        return None;
    }
    let tasks = std::mem::take(&mut state.suggested_next_steps);
    Some(promote_tasks(state, tasks))
}

fn plan_request(
    state: &ConversationState,
    mode: PlanMode,
    question: &str,
    research_mode: ResearchMode,
) -> PlanRequest {
    PlanRequest {
        conversation_state_id: state.id.clone(),
        mode,
        research_mode,
        question: question.to_string(),
        objective: state.objective.clone(),
        current_objective: state.current_objective.clone(),
        current_hypothesis: state.current_hypothesis.clone(),
        key_insights: state.key_insights.clone(),
        plan: TaskSummary::from_tasks(&state.plan),
    }
}

/// Plan and append a new level. Returns the level that was created.
///
/// An empty objective or task list is a planner contract failure.
pub async fn plan_initial(
    agents: &dyn ResearchAgents,
    handle: &StateHandle,
    question: &str,
    research_mode: ResearchMode,
) -> AppResult<i32> {
    handle.update(|s| s.suggested_next_steps.clear()).await?;
    let snapshot = handle.snapshot().await;

    let output = agents
        .plan(plan_request(&snapshot, PlanMode::Initial, question, research_mode))
        .await?;

    if output.objective.trim().is_empty() {
        return Err(ResearchError::contract("planner", "initial plan has no objective").into());
    }
    if output.tasks.is_empty() {
        return Err(ResearchError::contract("planner", "initial plan has no tasks").into());
    }

    let task_count = output.tasks.len();
    let level = handle
        .update(|s| {
            s.current_objective = output.objective.clone();
            if s.objective.trim().is_empty() {
                s.objective = output.objective.clone();
            }
            let tasks = output
                .tasks
                .into_iter()
                .map(|t| t.into_plan_task())
                .collect();
            promote_tasks(s, tasks)
        })
        .await?;

    info!(
        conversation_state_id = %snapshot.id,
        level,
        tasks = task_count,
        "Planned new level"
    );
    Ok(level)
}

/// Stage the next level as suggestions. Returns how many tasks were proposed.
///
/// Zero proposed tasks means the research is naturally complete.
pub async fn plan_next(
    agents: &dyn ResearchAgents,
    handle: &StateHandle,
    question: &str,
    research_mode: ResearchMode,
) -> AppResult<usize> {
    let snapshot = handle.snapshot().await;

    let output = agents
        .plan(plan_request(&snapshot, PlanMode::Next, question, research_mode))
        .await?;

    let suggestions: Vec<PlanTask> = output
        .tasks
        .into_iter()
        .map(|t| t.into_plan_task())
        .collect();
    let count = suggestions.len();

    handle.update(|s| s.suggested_next_steps = suggestions).await?;

    debug!(
        conversation_state_id = %snapshot.id,
        suggestions = count,
        "Staged next steps"
    );
    Ok(count)
}
