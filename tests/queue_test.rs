//! Integration tests for queued execution.
//!
//! Uses a file-backed SQLite database so the queue, the workers and the
//! service share state through separate pool connections, as they do when
//! `serve` and `worker` run as separate processes.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use common::{engine, wait_for_idle, wait_for_terminal, ScriptedAgents};
use mcp_deep_research::config::{DatabaseConfig, QueueConfig, ResearchConfig};
use mcp_deep_research::queue::{JobQueue, JobStatus, QueueWorker, SqliteJobQueue};
use mcp_deep_research::research::{
    ExecutionMode, IterationJobProcessor, MessageStatus, QueuedExecutor, ResearchMode,
    ResearchService, RunGuard, StartOutcome, ITERATION_JOB,
};
use mcp_deep_research::storage::{SqliteStorage, Storage};

struct Harness {
    _dir: TempDir,
    storage: Arc<SqliteStorage>,
    queue: Arc<dyn JobQueue>,
    service: Arc<ResearchService>,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl Harness {
    async fn start(agents: Arc<ScriptedAgents>, config: ResearchConfig) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let storage = Arc::new(
            SqliteStorage::new(&DatabaseConfig {
                path: dir.path().join("research.db"),
                max_connections: 5,
            })
            .await
            .expect("Failed to open file-backed storage"),
        );
        let shared: Arc<dyn Storage> = storage.clone();
        let queue: Arc<dyn JobQueue> = Arc::new(SqliteJobQueue::new(storage.pool().clone()));
        let guard = RunGuard::from_config(shared.clone(), &config);

        let executor = Arc::new(QueuedExecutor::new(
            queue.clone(),
            guard.clone(),
            shared.clone(),
        ));
        let service = Arc::new(ResearchService::new(
            shared.clone(),
            guard.clone(),
            executor,
            config.clone(),
        ));

        let processor = Arc::new(IterationJobProcessor::new(
            engine(shared, agents, &config),
            guard,
            queue.clone(),
        ));
        let queue_config = QueueConfig {
            worker_concurrency: 1,
            poll_interval_ms: 20,
            stalled_after_secs: 900,
            embedded_workers: false,
        };
        let (shutdown, shutdown_rx) = watch::channel(false);
        let workers = QueueWorker::new(queue.clone(), processor, ITERATION_JOB, &queue_config)
            .spawn(shutdown_rx)
            .await;

        Self {
            _dir: dir,
            storage,
            queue,
            service,
            shutdown,
            workers,
        }
    }

    async fn wait_for_job(&self, job_id: &str, status: JobStatus) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let job = self.queue.get_job(job_id).await.unwrap();
            if job.as_ref().map(|j| j.status) == Some(status) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {} never reached {:?}",
                job_id,
                status
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn stop(self) {
        let _ = self.shutdown.send(true);
        for handle in self.workers {
            handle.await.expect("worker panicked");
        }
    }
}

fn accepted(outcome: StartOutcome) -> (String, String, String) {
    match outcome {
        StartOutcome::Accepted {
            job_id,
            message_id,
            conversation_state_id,
            ..
        } => (job_id, message_id, conversation_state_id),
        other => panic!("expected Accepted, got {:?}", other),
    }
}

fn queue_config() -> ResearchConfig {
    ResearchConfig {
        execution_mode: ExecutionMode::Queue,
        semi_autonomous_max_iterations: 2,
        ..ResearchConfig::default()
    }
}

#[tokio::test]
async fn test_queued_run_processes_one_job_per_iteration() {
    let agents = Arc::new(ScriptedAgents::new().continuing());
    let harness = Harness::start(agents.clone(), queue_config()).await;
    assert_eq!(harness.service.execution_mode(), ExecutionMode::Queue);

    let (job_id, message_id, conversation_state_id) = accepted(
        harness
            .service
            .start_run(
                "conv-1",
                "What is telomerase?",
                Some(ResearchMode::SemiAutonomous),
            )
            .await
            .unwrap(),
    );
    assert_eq!(job_id, message_id);

    assert!(matches!(
        wait_for_terminal(&harness.service, &message_id).await,
        MessageStatus::Completed { .. }
    ));
    wait_for_idle(harness.storage.as_ref(), &conversation_state_id).await;

    let messages = harness
        .storage
        .get_conversation_messages("conv-1")
        .await
        .unwrap();
    assert_eq!(messages.len(), 2);
    for message in &messages {
        harness.wait_for_job(&message.id, JobStatus::Completed).await;
    }
    assert_eq!(agents.reply_calls.load(Ordering::SeqCst), 2);

    harness.stop().await;
}

#[tokio::test]
async fn test_failed_job_can_be_retried() {
    let agents = Arc::new(ScriptedAgents::new().failing());
    let harness = Harness::start(agents.clone(), queue_config()).await;

    let (job_id, message_id, conversation_state_id) = accepted(
        harness
            .service
            .start_run("conv-1", "What is telomerase?", Some(ResearchMode::Steering))
            .await
            .unwrap(),
    );

    assert!(matches!(
        wait_for_terminal(&harness.service, &message_id).await,
        MessageStatus::Failed { .. }
    ));
    harness.wait_for_job(&job_id, JobStatus::Failed).await;
    wait_for_idle(harness.storage.as_ref(), &conversation_state_id).await;

    agents.fail_planning.store(false, Ordering::SeqCst);
    let outcome = harness.service.retry(&job_id).await.unwrap();
    let (retried_job, retried_message, _) = accepted(outcome);
    assert_eq!(retried_job, job_id);
    assert_eq!(retried_message, message_id);

    assert!(matches!(
        wait_for_terminal(&harness.service, &message_id).await,
        MessageStatus::Completed { .. }
    ));
    harness.wait_for_job(&job_id, JobStatus::Completed).await;
    let job = harness.queue.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 2);

    harness.stop().await;
}

#[tokio::test]
async fn test_retry_rejects_jobs_that_did_not_fail() {
    let harness = Harness::start(Arc::new(ScriptedAgents::new()), queue_config()).await;

    let (job_id, message_id, conversation_state_id) = accepted(
        harness
            .service
            .start_run("conv-1", "What is telomerase?", Some(ResearchMode::Steering))
            .await
            .unwrap(),
    );
    wait_for_terminal(&harness.service, &message_id).await;
    harness.wait_for_job(&job_id, JobStatus::Completed).await;
    wait_for_idle(harness.storage.as_ref(), &conversation_state_id).await;

    let err = harness.service.retry(&job_id).await.unwrap_err();
    assert!(err.to_string().contains("cannot be retried"));

    let err = harness.service.retry("no-such-job").await.unwrap_err();
    assert!(err.to_string().contains("not found"));

    harness.stop().await;
}
