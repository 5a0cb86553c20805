use tracing::{info, warn};

use super::agents::{
    ContinuationDecision, ContinuationRequest, PlannedTask, ResearchAgents, TaskSummary,
    TriggerReason,
};
use super::ResearchMode;
use crate::storage::{ConversationState, PlanTask};

/// Decide whether the loop continues without the user.
///
/// The agent is consulted only while there are staged next steps and the
/// iteration cap has not been reached. An agent failure stops the loop.
pub async fn decide(
    agents: &dyn ResearchAgents,
    state: &ConversationState,
    question: &str,
    iteration: u32,
    max_iterations: u32,
    research_mode: ResearchMode,
) -> ContinuationDecision {
    if state.suggested_next_steps.is_empty() {
        return ContinuationDecision::stop(
            TriggerReason::NoNextSteps,
            "No further steps were proposed",
        );
    }
    if iteration >= max_iterations {
        return ContinuationDecision::stop(
            TriggerReason::IterationLimit,
            format!(
                "Reached {} of {} iterations for {} research",
                iteration, max_iterations, research_mode
            ),
        );
    }

    let completed: Vec<PlanTask> = state
        .tasks_at_level(state.current_level)
        .into_iter()
        .filter(|t| t.is_complete())
        .collect();

    let request = ContinuationRequest {
        conversation_state_id: state.id.clone(),
        objective: state.objective.clone(),
        question: question.to_string(),
        hypothesis: state.current_hypothesis.clone(),
        completed_tasks: TaskSummary::from_tasks(&completed),
        suggested_next_steps: state
            .suggested_next_steps
            .iter()
            .map(PlannedTask::from_task)
            .collect(),
        iteration,
        max_iterations,
        research_mode,
    };

    match agents.decide_continuation(request).await {
        Ok(mut decision) => {
            decision.trigger_reason = TriggerReason::AgentDecision;
            info!(
                conversation_state_id = %state.id,
                iteration,
                should_continue = decision.should_continue,
                confidence = decision.confidence,
                "Continuation decided"
            );
            decision
        }
        Err(e) => {
            warn!(
                conversation_state_id = %state.id,
                iteration,
                error = %e,
                "Continuation agent failed, stopping"
            );
            ContinuationDecision {
                should_continue: false,
                confidence: 0.0,
                reasoning: format!("Continuation decision unavailable: {}", e),
                trigger_reason: TriggerReason::DecisionFallback,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LangbaseError;
    use crate::research::agents::MockResearchAgents;

    fn state_with_suggestions(n: usize) -> ConversationState {
        let mut state = ConversationState::new("conv-1");
        state.suggested_next_steps = (0..n)
            .map(|i| PlanTask::literature(format!("next {}", i)))
            .collect();
        state
    }

    #[tokio::test]
    async fn test_no_suggestions_stops_without_agent() {
        let mut agents = MockResearchAgents::new();
        agents.expect_decide_continuation().never();

        let decision = decide(
            &agents,
            &state_with_suggestions(0),
            "q",
            1,
            20,
            ResearchMode::FullyAutonomous,
        )
        .await;
        assert!(!decision.should_continue);
        assert_eq!(decision.trigger_reason, TriggerReason::NoNextSteps);
    }

    #[tokio::test]
    async fn test_iteration_cap_stops_without_agent() {
        let mut agents = MockResearchAgents::new();
        agents.expect_decide_continuation().never();

        let decision = decide(
            &agents,
            &state_with_suggestions(2),
            "q",
            1,
            1,
            ResearchMode::Steering,
        )
        .await;
        assert!(!decision.should_continue);
        assert_eq!(decision.trigger_reason, TriggerReason::IterationLimit);
    }

    #[tokio::test]
    async fn test_agent_decision_is_used() {
        let mut agents = MockResearchAgents::new();
        agents
            .expect_decide_continuation()
            .withf(|r| r.iteration == 2 && r.max_iterations == 5 && r.suggested_next_steps.len() == 3)
            .returning(|_| {
                Ok(ContinuationDecision {
                    should_continue: true,
                    confidence: 0.8,
                    reasoning: "gaps remain".to_string(),
                    trigger_reason: TriggerReason::NoNextSteps,
                })
            });

        let decision = decide(
            &agents,
            &state_with_suggestions(3),
            "q",
            2,
            5,
            ResearchMode::SemiAutonomous,
        )
        .await;
        assert!(decision.should_continue);
        assert_eq!(decision.trigger_reason, TriggerReason::AgentDecision);
    }

    #[tokio::test]
    async fn test_agent_failure_falls_back_to_stop() {
        let mut agents = MockResearchAgents::new();
        agents.expect_decide_continuation().returning(|_| {
            Err(LangbaseError::Timeout { timeout_ms: 100 }.into())
        });

        let decision = decide(
            &agents,
            &state_with_suggestions(1),
            "q",
            1,
            5,
            ResearchMode::SemiAutonomous,
        )
        .await;
        assert!(!decision.should_continue);
        assert_eq!(decision.trigger_reason, TriggerReason::DecisionFallback);
        assert!(decision.reasoning.contains("timeout"));
    }
}
