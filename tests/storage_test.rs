//! Integration tests for SQLite storage layer
//!
//! Tests a file-backed database: persistence across reopen and atomicity of
//! the run guard and start locks across pool connections.

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use mcp_deep_research::config::DatabaseConfig;
use mcp_deep_research::storage::{
    ConversationState, ExecutionState, Invocation, Message, PlanTask, RunRecord, RunResult,
    SqliteStorage, StateStatus, Storage,
};

async fn open(dir: &TempDir) -> SqliteStorage {
    SqliteStorage::new(&DatabaseConfig {
        path: dir.path().join("nested").join("research.db"),
        max_connections: 5,
    })
    .await
    .expect("Failed to open file-backed storage")
}

#[cfg(test)]
mod persistence_tests {
    use super::*;

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();

        let (state_id, message_id) = {
            let storage = open(&dir).await;

            let mut conversation = ConversationState::new("conv-1");
            conversation.objective = "Explain telomerase".to_string();
            let mut task = PlanTask::literature("Survey telomerase biology");
            task.id = Some("lit-0".to_string());
            task.level = Some(0);
            conversation.plan.push(task);
            conversation.current_level = 0;
            storage.create_conversation_state(&conversation).await.unwrap();

            let state = ExecutionState::new(&conversation.id, "");
            let mut message = Message::from_user("conv-1", "What is telomerase?", &state.id);
            storage.create_state(&state).await.unwrap();
            storage.create_message(&message).await.unwrap();

            message.content = "Telomerase extends telomeres.".to_string();
            message.response_time = Some(1200);
            storage.update_message(&message).await.unwrap();

            storage.pool().close().await;
            (state.id, message.id)
        };

        // Reopening runs the embedded migrations again.
        let storage = open(&dir).await;

        let conversation = storage
            .get_conversation_state_by_conversation("conv-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conversation.objective, "Explain telomerase");
        assert_eq!(conversation.current_level, 0);
        assert_eq!(conversation.plan[0].id.as_deref(), Some("lit-0"));

        let message = storage.get_message(&message_id).await.unwrap().unwrap();
        assert!(message.is_complete());
        assert_eq!(message.content, "Telomerase extends telomeres.");
        assert_eq!(message.state_id, state_id);

        let state = storage.get_state(&state_id).await.unwrap().unwrap();
        assert_eq!(state.status, StateStatus::Processing);
    }

    #[tokio::test]
    async fn test_one_conversation_state_per_conversation() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir).await;

        storage
            .create_conversation_state(&ConversationState::new("conv-1"))
            .await
            .unwrap();
        let duplicate = storage
            .create_conversation_state(&ConversationState::new("conv-1"))
            .await;
        assert!(duplicate.is_err());
    }

    #[tokio::test]
    async fn test_invocations_are_logged() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir).await;

        let invocation = Invocation::new("agent.planner", json!({"mode": "initial"}))
            .with_session("cs-1")
            .with_pipe("research-planner-v1")
            .success(json!({"tasks": []}), 42);
        storage.log_invocation(&invocation).await.unwrap();
    }
}

#[cfg(test)]
mod concurrency_tests {
    use super::*;

    #[tokio::test]
    async fn test_only_one_concurrent_run_is_marked_started() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(open(&dir).await);

        let attempts = (0..8).map(|n| {
            let storage = storage.clone();
            tokio::spawn(async move {
                let record = RunRecord::running(
                    "cs-1",
                    format!("job-{}", n),
                    format!("msg-{}", n),
                    format!("state-{}", n),
                );
                storage.try_mark_run_started(&record).await.unwrap()
            })
        });
        let results = futures::future::join_all(attempts).await;
        let started = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(started, 1);

        let running = storage.list_running_runs().await.unwrap();
        assert_eq!(running.len(), 1);
        let run = &running[0];

        assert!(storage
            .finish_run("cs-1", &run.state_id, RunResult::Success, None)
            .await
            .unwrap());
        assert!(storage.list_running_runs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_only_one_concurrent_lock_holder() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(open(&dir).await);

        let attempts = (0..8).map(|n| {
            let storage = storage.clone();
            tokio::spawn(async move {
                storage
                    .try_acquire_lock("start:conv-1", &format!("owner-{}", n), 60_000, 0)
                    .await
                    .unwrap()
            })
        });
        let results = futures::future::join_all(attempts).await;
        let holders = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(holders, 1);

        // Expired locks are taken over.
        assert!(storage
            .try_acquire_lock("start:conv-1", "late-owner", 120_000, 60_001)
            .await
            .unwrap());
    }
}
