//! Hypothesis, reflection and discovery steps.

use tracing::{debug, info};

use super::agents::{DiscoveryRequest, HypothesisRequest, ReflectionRequest, ResearchAgents, TaskSummary};
use super::state::StateHandle;
use crate::config::DiscoveryConfig;
use crate::error::AppResult;
use crate::storage::{PlanTask, TaskType};

/// Decide whether discovery extraction is worth running for this batch.
///
/// Batches with completed analysis always qualify. Literature-only batches
/// qualify once the conversation has enough messages and the batch has
/// enough completed literature tasks.
pub fn should_run_discovery(
    completed: &[PlanTask],
    message_count: usize,
    config: &DiscoveryConfig,
) -> bool {
    if completed.is_empty() {
        return false;
    }
    if completed.iter().any(|t| t.task_type == TaskType::Analysis) {
        return true;
    }
    if message_count < config.min_messages {
        return false;
    }
    let literature = completed
        .iter()
        .filter(|t| t.task_type == TaskType::Literature)
        .count();
    literature >= config.min_tasks
}

/// Run hypothesis, then reflection and (optionally) discovery concurrently.
///
/// Any agent failure aborts the iteration. When discovery is skipped the
/// existing discoveries are left untouched.
pub async fn evaluate(
    agents: &dyn ResearchAgents,
    handle: &StateHandle,
    question: &str,
    message_count: usize,
    discovery: &DiscoveryConfig,
) -> AppResult<()> {
    let snapshot = handle.snapshot().await;
    let completed: Vec<PlanTask> = snapshot
        .tasks_at_level(snapshot.current_level)
        .into_iter()
        .filter(|t| t.is_complete())
        .collect();
    let summaries = TaskSummary::from_tasks(&completed);

    let hypothesis = agents
        .hypothesize(HypothesisRequest {
            conversation_state_id: snapshot.id.clone(),
            objective: snapshot.objective.clone(),
            question: question.to_string(),
            completed_tasks: summaries.clone(),
            current_hypothesis: snapshot.current_hypothesis.clone(),
            key_insights: snapshot.key_insights.clone(),
        })
        .await?;

    debug!(
        conversation_state_id = %snapshot.id,
        mode = ?hypothesis.mode,
        "Hypothesis updated"
    );
    handle
        .update(|s| s.current_hypothesis = hypothesis.hypothesis.clone())
        .await?;

    let run_discovery = should_run_discovery(&completed, message_count, discovery);

    let reflection_fut = agents.reflect(ReflectionRequest {
        conversation_state_id: snapshot.id.clone(),
        objective: snapshot.objective.clone(),
        current_objective: snapshot.current_objective.clone(),
        hypothesis: hypothesis.hypothesis.clone(),
        completed_tasks: summaries.clone(),
        key_insights: snapshot.key_insights.clone(),
        methodology: snapshot.methodology.clone(),
        conversation_title: snapshot.conversation_title.clone(),
    });
    let discovery_fut = async {
        if !run_discovery {
            return Ok(None);
        }
        agents
            .discover(DiscoveryRequest {
                conversation_state_id: snapshot.id.clone(),
                objective: snapshot.objective.clone(),
                hypothesis: hypothesis.hypothesis.clone(),
                completed_tasks: summaries.clone(),
                discoveries: snapshot.discoveries.clone(),
            })
            .await
            .map(Some)
    };

    let (reflection, discoveries) = tokio::join!(reflection_fut, discovery_fut);
    let reflection = reflection?;
    let discoveries = discoveries?;

    let discovery_count = discoveries.as_ref().map(|d| d.discoveries.len());
    handle
        .update(|s| {
            s.current_objective = reflection.current_objective;
            s.key_insights = reflection.key_insights;
            s.methodology = reflection.methodology;
            if reflection.conversation_title.is_some() {
                s.conversation_title = reflection.conversation_title;
            }
            if let Some(objective) = reflection.objective {
                if s.objective.trim().is_empty() && !objective.trim().is_empty() {
                    s.objective = objective;
                }
            }
            if let Some(output) = discoveries {
                s.discoveries = output.discoveries;
            }
        })
        .await?;

    info!(
        conversation_state_id = %snapshot.id,
        completed_tasks = completed.len(),
        discovery_ran = run_discovery,
        discoveries = ?discovery_count,
        "Evaluation finished"
    );
    Ok(())
}
