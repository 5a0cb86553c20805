//! Durable job queue.
//!
//! Jobs are identified by caller-chosen ids so enqueueing the same logical
//! work twice is detected instead of duplicated. Delivery is at-least-once:
//! jobs left `active` by a crashed worker are requeued.

mod sqlite;
mod worker;

pub use sqlite::SqliteJobQueue;
pub use worker::QueueWorker;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, QueueResult};

/// Lifecycle of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Get the status as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(JobStatus::Queued),
            "active" => Ok(JobStatus::Active),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// A persisted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Returned by [`JobQueue::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: String,
    pub name: String,
    /// A job with this id already existed; nothing new was enqueued.
    pub deduplicated: bool,
}

/// Durable queue operations.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job under `job_id`. An existing job with that id is returned
    /// with `deduplicated` set.
    async fn enqueue(
        &self,
        name: &str,
        payload: serde_json::Value,
        job_id: &str,
    ) -> QueueResult<JobHandle>;
    /// Get a job by id.
    async fn get_job(&self, job_id: &str) -> QueueResult<Option<Job>>;
    /// Move a failed job back to queued. Returns `false` if it was not failed.
    async fn retry(&self, job_id: &str) -> QueueResult<bool>;
    /// Cancel a queued job. Returns `false` if it was not queued.
    async fn cancel(&self, job_id: &str) -> QueueResult<bool>;
    /// Claim the oldest queued job with the given name.
    async fn claim_next(&self, name: &str) -> QueueResult<Option<Job>>;
    /// Mark an active job completed.
    async fn complete(&self, job_id: &str) -> QueueResult<()>;
    /// Mark an active job failed.
    async fn fail(&self, job_id: &str, error: &str) -> QueueResult<()>;
    /// Record that an active job is still being worked on.
    async fn heartbeat(&self, job_id: &str) -> QueueResult<()>;
    /// Requeue active jobs with no claim or heartbeat within `older_than`.
    async fn requeue_stalled(&self, older_than: Duration) -> QueueResult<u64>;
}

/// Handles claimed jobs for a [`QueueWorker`].
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Process one job. An error marks the job failed.
    async fn process(&self, job: &Job) -> AppResult<()>;
}
