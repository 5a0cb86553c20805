//! One active research run per conversation.
//!
//! A persisted, expiring start lock brackets the check-and-set performed when
//! a run starts. If the lock cannot be obtained in time the start proceeds
//! with a warning; the conditional upsert behind
//! [`RunGuard::mark_run_started`] still refuses a second running record, so
//! the degraded path cannot produce duplicate runs.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ResearchConfig;
use crate::error::AppResult;
use crate::storage::{RunRecord, RunResult, Storage};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// A held start lock. Release it with [`RunGuard::release_start_mutex`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartLock {
    key: String,
    owner: String,
}

/// Mutex and dedup registry for research runs.
#[derive(Clone)]
pub struct RunGuard {
    storage: Arc<dyn Storage>,
    lock_ttl_ms: u64,
    lock_wait_ms: u64,
}

impl RunGuard {
    /// Create a guard with explicit lock timings.
    pub fn new(storage: Arc<dyn Storage>, lock_ttl_ms: u64, lock_wait_ms: u64) -> Self {
        Self {
            storage,
            lock_ttl_ms,
            lock_wait_ms,
        }
    }

    /// Create a guard using the configured lock timings.
    pub fn from_config(storage: Arc<dyn Storage>, config: &ResearchConfig) -> Self {
        Self::new(storage, config.run_lock_ttl_ms, config.run_lock_wait_ms)
    }

    /// Acquire the start lock for a conversation.
    ///
    /// Returns `None` when the lock could not be taken within the wait budget
    /// or the lock store failed; callers proceed without it.
    pub async fn acquire_start_mutex(&self, conversation_id: &str) -> Option<StartLock> {
        let key = format!("run-start:{}", conversation_id);
        let owner = Uuid::new_v4().to_string();
        let deadline = tokio::time::Instant::now() + Duration::from_millis(self.lock_wait_ms);

        loop {
            let now_ms = Utc::now().timestamp_millis();
            let expires_at = now_ms + self.lock_ttl_ms as i64;

            match self
                .storage
                .try_acquire_lock(&key, &owner, expires_at, now_ms)
                .await
            {
                Ok(true) => {
                    debug!(lock = %key, "Start lock acquired");
                    return Some(StartLock { key, owner });
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(lock = %key, error = %e, "Start lock unavailable, proceeding without it");
                    return None;
                }
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(
                    lock = %key,
                    wait_ms = self.lock_wait_ms,
                    "Timed out waiting for start lock, proceeding without it"
                );
                return None;
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    /// Release a start lock. Failures are logged; the lock expires on its own.
    pub async fn release_start_mutex(&self, lock: StartLock) {
        if let Err(e) = self.storage.release_lock(&lock.key, &lock.owner).await {
            warn!(lock = %lock.key, error = %e, "Failed to release start lock");
        }
    }

    /// The running record for a conversation state, if any.
    pub async fn active_run_for_dedup(
        &self,
        conversation_state_id: &str,
    ) -> AppResult<Option<RunRecord>> {
        Ok(self
            .storage
            .get_run(conversation_state_id)
            .await?
            .filter(|r| r.is_running()))
    }

    /// Record a run as started.
    ///
    /// Returns `false` when another run is already active.
    pub async fn mark_run_started(&self, record: &RunRecord) -> AppResult<bool> {
        Ok(self.storage.try_mark_run_started(record).await?)
    }

    /// Point the active run at the job driving its next iteration.
    pub async fn advance(
        &self,
        conversation_state_id: &str,
        job_id: &str,
        message_id: &str,
    ) -> AppResult<()> {
        Ok(self
            .storage
            .advance_run(conversation_state_id, job_id, message_id)
            .await?)
    }

    /// Close the run for `state_id`.
    pub async fn mark_run_finished(
        &self,
        conversation_state_id: &str,
        state_id: &str,
        result: RunResult,
        error: Option<&str>,
    ) -> AppResult<()> {
        let closed = self
            .storage
            .finish_run(conversation_state_id, state_id, result, error)
            .await?;
        if !closed {
            debug!(
                conversation_state_id = %conversation_state_id,
                state_id = %state_id,
                "No running record to close"
            );
        }
        Ok(())
    }

    /// Every run still marked running.
    pub async fn running_runs(&self) -> AppResult<Vec<RunRecord>> {
        Ok(self.storage.list_running_runs().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;

    async fn guard(wait_ms: u64) -> RunGuard {
        let storage = Arc::new(SqliteStorage::new_in_memory().await.unwrap());
        RunGuard::new(storage, 30_000, wait_ms)
    }

    #[tokio::test]
    async fn test_second_acquire_times_out_while_held() {
        let guard = guard(60).await;
        let first = guard.acquire_start_mutex("conv-1").await;
        assert!(first.is_some());

        assert!(guard.acquire_start_mutex("conv-1").await.is_none());
        // Other conversations are unaffected.
        assert!(guard.acquire_start_mutex("conv-2").await.is_some());

        guard.release_start_mutex(first.unwrap()).await;
        assert!(guard.acquire_start_mutex("conv-1").await.is_some());
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let guard = guard(2_000).await;
        let held = guard.acquire_start_mutex("conv-1").await.unwrap();

        let waiter = {
            let guard = guard.clone();
            tokio::spawn(async move { guard.acquire_start_mutex("conv-1").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        guard.release_start_mutex(held).await;

        assert!(waiter.await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_dedup_reports_active_run_only() {
        let guard = guard(10).await;
        assert!(guard.active_run_for_dedup("cs-1").await.unwrap().is_none());

        let record = RunRecord::running("cs-1", "job-1", "msg-1", "state-1");
        assert!(guard.mark_run_started(&record).await.unwrap());
        let active = guard.active_run_for_dedup("cs-1").await.unwrap().unwrap();
        assert_eq!(active.job_id, "job-1");

        let duplicate = RunRecord::running("cs-1", "job-2", "msg-2", "state-2");
        assert!(!guard.mark_run_started(&duplicate).await.unwrap());

        guard
            .mark_run_finished("cs-1", "state-1", RunResult::Success, None)
            .await
            .unwrap();
        assert!(guard.active_run_for_dedup("cs-1").await.unwrap().is_none());
        assert!(guard.running_runs().await.unwrap().is_empty());
    }
}
