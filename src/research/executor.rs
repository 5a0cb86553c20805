//! Concurrent execution of the current plan level.
//!
//! Every task at the current level runs concurrently. LITERATURE tasks fan
//! out to every literature backend and append each backend's output as it
//! resolves; ANALYSIS tasks call the single analysis backend. Backend errors
//! are written into the task output, and every task gets both `start` and
//! `end` regardless of outcome. Each mutation is persisted immediately.

use std::sync::Arc;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::future::join_all;
use tracing::{debug, info, warn};

use super::backends::{BackendOutput, BackendRegistry, LiteratureBackend};
use super::state::StateHandle;
use crate::error::AppResult;
use crate::storage::{PlanTask, TaskType};

/// Outcome counts for one executed level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LevelReport {
    pub level: i32,
    pub executed: usize,
    /// Backend calls that failed and were recorded into task output.
    pub backend_failures: usize,
}

/// Execute every unfinished task at the current level.
pub async fn execute_level(handle: &StateHandle, backends: &BackendRegistry) -> AppResult<LevelReport> {
    let snapshot = handle.snapshot().await;
    let level = snapshot.current_level;
    let pending: Vec<PlanTask> = snapshot
        .tasks_at_level(level)
        .into_iter()
        .filter(|t| t.end.is_none())
        .collect();

    info!(
        conversation_state_id = %snapshot.id,
        level,
        tasks = pending.len(),
        "Executing level"
    );

    let results = join_all(
        pending
            .iter()
            .filter_map(|t| t.id.clone().map(|id| (id, t.clone())))
            .map(|(id, task)| execute_task(handle, backends, id, task)),
    )
    .await;

    let mut report = LevelReport {
        level,
        ..Default::default()
    };
    for result in results {
        report.backend_failures += result?;
        report.executed += 1;
    }

    info!(
        conversation_state_id = %snapshot.id,
        level,
        executed = report.executed,
        backend_failures = report.backend_failures,
        "Level execution finished"
    );
    Ok(report)
}

/// Run one task; returns how many backend calls failed.
async fn execute_task(
    handle: &StateHandle,
    backends: &BackendRegistry,
    task_id: String,
    task: PlanTask,
) -> AppResult<usize> {
    handle
        .update(|s| {
            if let Some(t) = s.task_mut(&task_id) {
                t.start = Some(Utc::now());
                t.end = None;
                t.output.clear();
                t.artifacts.clear();
            }
        })
        .await?;

    debug!(task_id = %task_id, task_type = %task.task_type, "Task started");

    let failures = match task.task_type {
        TaskType::Literature => {
            run_literature(handle, backends.literature(), &task_id, &task.objective).await?
        }
        TaskType::Analysis => {
            let result = backends
                .analysis()
                .analyze(&task.objective, &task.datasets)
                .await;
            record_result(handle, &task_id, "analysis", result).await?
        }
    };

    handle
        .update(|s| {
            if let Some(t) = s.task_mut(&task_id) {
                t.end = Some(Utc::now());
            }
        })
        .await?;

    debug!(task_id = %task_id, failures, "Task finished");
    Ok(failures)
}

/// Query every literature backend concurrently, appending in completion order.
async fn run_literature(
    handle: &StateHandle,
    backends: &[Arc<dyn LiteratureBackend>],
    task_id: &str,
    objective: &str,
) -> AppResult<usize> {
    let mut pending: FuturesUnordered<_> = backends
        .iter()
        .map(|backend| async move { (backend.source(), backend.search(objective).await) })
        .collect();

    let mut failures = 0;
    while let Some((source, result)) = pending.next().await {
        failures += record_result(handle, task_id, source.as_str(), result).await?;
    }
    Ok(failures)
}

/// Append one backend result to the task. Returns 1 when the call failed.
async fn record_result(
    handle: &StateHandle,
    task_id: &str,
    source: &str,
    result: AppResult<BackendOutput>,
) -> AppResult<usize> {
    let failed = result.is_err();
    if let Err(e) = &result {
        warn!(task_id = %task_id, source = %source, error = %e, "Backend call failed");
    }

    handle
        .update(|s| {
            let Some(task) = s.task_mut(task_id) else {
                return;
            };
            let text = match result {
                Ok(out) => {
                    if out.job_id.is_some() {
                        task.job_id = out.job_id;
                    }
                    task.artifacts.extend(out.artifacts);
                    out.output
                }
                Err(e) => format!("Error from {}: {}", source, e),
            };
            if !task.output.is_empty() {
                task.output.push_str("\n\n");
            }
            task.output.push_str(&text);
        })
        .await?;

    Ok(usize::from(failed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppError, ResearchError};
    use crate::research::backends::AnalysisBackend;
    use crate::research::planner::promote_tasks;
    use crate::research::LiteratureSource;
    use crate::storage::{ConversationState, Dataset, SqliteStorage, Storage};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Delayed {
        source: LiteratureSource,
        delay_ms: u64,
        fail: bool,
    }

    #[async_trait]
    impl LiteratureBackend for Delayed {
        fn source(&self) -> LiteratureSource {
            self.source
        }

        async fn search(&self, objective: &str) -> AppResult<BackendOutput> {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            if self.fail {
                return Err(AppError::Internal {
                    message: "backend offline".to_string(),
                });
            }
            Ok(BackendOutput {
                output: format!("{} on {}", self.source, objective),
                job_id: None,
                artifacts: vec![],
            })
        }
    }

    struct Analysis {
        fail: bool,
    }

    #[async_trait]
    impl AnalysisBackend for Analysis {
        async fn analyze(&self, objective: &str, datasets: &[Dataset]) -> AppResult<BackendOutput> {
            if self.fail {
                return Err(ResearchError::Unsupported {
                    message: "no compute".to_string(),
                }
                .into());
            }
            Ok(BackendOutput {
                output: format!("analyzed {} datasets for {}", datasets.len(), objective),
                job_id: Some("analysis-run-1".to_string()),
                artifacts: vec![],
            })
        }
    }

    async fn handle_with(tasks: Vec<PlanTask>) -> (Arc<SqliteStorage>, StateHandle) {
        let storage = Arc::new(SqliteStorage::new_in_memory().await.unwrap());
        let mut state = ConversationState::new("conv-1");
        promote_tasks(&mut state, tasks);
        storage.create_conversation_state(&state).await.unwrap();
        let handle = StateHandle::new(storage.clone(), state);
        (storage, handle)
    }

    #[tokio::test]
    async fn test_literature_output_in_completion_order() {
        let registry = BackendRegistry::new(
            vec![
                Arc::new(Delayed {
                    source: LiteratureSource::OpenScholar,
                    delay_ms: 60,
                    fail: false,
                }),
                Arc::new(Delayed {
                    source: LiteratureSource::Knowledge,
                    delay_ms: 0,
                    fail: false,
                }),
            ],
            Arc::new(Analysis { fail: false }),
        );
        let (_storage, handle) = handle_with(vec![PlanTask::literature("telomerase")]).await;

        let report = execute_level(&handle, &registry).await.unwrap();
        assert_eq!(report.executed, 1);
        assert_eq!(report.backend_failures, 0);

        let task = handle.snapshot().await.plan[0].clone();
        assert_eq!(
            task.output,
            "knowledge on telomerase\n\nopenscholar on telomerase"
        );
        assert!(task.start.is_some());
        assert!(task.end.is_some());
    }

    #[tokio::test]
    async fn test_failure_isolated_to_its_task() {
        let registry = BackendRegistry::new(
            vec![Arc::new(Delayed {
                source: LiteratureSource::OpenScholar,
                delay_ms: 5,
                fail: false,
            })],
            Arc::new(Analysis { fail: true }),
        );
        let (storage, handle) = handle_with(vec![
            PlanTask::literature("survey"),
            PlanTask::analysis("crunch", vec![]),
            PlanTask::literature("second survey"),
        ])
        .await;

        let report = execute_level(&handle, &registry).await.unwrap();
        assert_eq!(report.executed, 3);
        assert_eq!(report.backend_failures, 1);

        let state = handle.snapshot().await;
        for task in &state.plan {
            assert!(task.start.is_some(), "{:?} never started", task.id);
            assert!(task.end.is_some(), "{:?} never finished", task.id);
            assert!(!task.output.is_empty());
        }
        let analysis = state.plan.iter().find(|t| t.task_type == TaskType::Analysis).unwrap();
        assert!(analysis.output.starts_with("Error from analysis:"));

        let stored = storage.get_conversation_state(&state.id).await.unwrap().unwrap();
        assert!(stored.plan.iter().all(|t| t.is_complete()));
    }

    #[tokio::test]
    async fn test_partial_literature_failure_keeps_other_sources() {
        let registry = BackendRegistry::new(
            vec![
                Arc::new(Delayed {
                    source: LiteratureSource::Edison,
                    delay_ms: 0,
                    fail: true,
                }),
                Arc::new(Delayed {
                    source: LiteratureSource::Knowledge,
                    delay_ms: 20,
                    fail: false,
                }),
            ],
            Arc::new(Analysis { fail: false }),
        );
        let (_storage, handle) = handle_with(vec![PlanTask::literature("aging")]).await;

        execute_level(&handle, &registry).await.unwrap();
        let task = handle.snapshot().await.plan[0].clone();
        assert!(task.output.starts_with("Error from edison:"));
        assert!(task.output.ends_with("knowledge on aging"));
    }

    #[tokio::test]
    async fn test_analysis_records_job_id() {
        let registry = BackendRegistry::new(vec![], Arc::new(Analysis { fail: false }));
        let dataset = Dataset {
            id: "d1".to_string(),
            filename: "expr.csv".to_string(),
            description: String::new(),
        };
        let (_storage, handle) =
            handle_with(vec![PlanTask::analysis("expression", vec![dataset])]).await;

        execute_level(&handle, &registry).await.unwrap();
        let task = handle.snapshot().await.plan[0].clone();
        assert_eq!(task.job_id.as_deref(), Some("analysis-run-1"));
        assert_eq!(task.output, "analyzed 1 datasets for expression");
    }

    #[tokio::test]
    async fn test_only_current_level_and_unfinished_tasks_run() {
        let registry = BackendRegistry::new(
            vec![Arc::new(Delayed {
                source: LiteratureSource::Knowledge,
                delay_ms: 0,
                fail: false,
            })],
            Arc::new(Analysis { fail: false }),
        );
        let (_storage, handle) = handle_with(vec![PlanTask::literature("old")]).await;
        handle
            .update(|s| {
                s.plan[0].end = Some(Utc::now());
                promote_tasks(s, vec![PlanTask::literature("new"), PlanTask::literature("done")]);
                s.plan[2].end = Some(Utc::now());
            })
            .await
            .unwrap();

        let report = execute_level(&handle, &registry).await.unwrap();
        assert_eq!(report.level, 1);
        assert_eq!(report.executed, 1);

        let state = handle.snapshot().await;
        assert!(state.plan[0].output.is_empty());
        assert_eq!(state.plan[1].output, "knowledge on new");
        assert!(state.plan[2].output.is_empty());
    }
}
