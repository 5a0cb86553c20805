use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use tracing::{debug, info};

use super::{Job, JobHandle, JobQueue, JobStatus};
use crate::error::{QueueError, QueueResult};
use crate::storage::sqlite::{format_timestamp, parse_timestamp};

/// [`JobQueue`] stored in the `jobs` table of the application database.
#[derive(Clone)]
pub struct SqliteJobQueue {
    pool: SqlitePool,
}

impl SqliteJobQueue {
    /// Create a queue on an already migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

const JOB_COLUMNS: &str =
    "id, name, payload, status, attempts, error, created_at, updated_at, started_at, finished_at";

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn enqueue(
        &self,
        name: &str,
        payload: serde_json::Value,
        job_id: &str,
    ) -> QueueResult<JobHandle> {
        let now = format_timestamp(&Utc::now());
        let payload = serde_json::to_string(&payload)?;

        let result = sqlx::query(
            r#"
            INSERT INTO jobs (id, name, payload, status, attempts, created_at, updated_at)
            VALUES (?, ?, ?, 'queued', 0, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(job_id)
        .bind(name)
        .bind(&payload)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let deduplicated = result.rows_affected() == 0;
        if deduplicated {
            let existing = self.get_job(job_id).await?.ok_or_else(|| QueueError::Enqueue {
                message: format!("job {} conflicted but could not be read", job_id),
            })?;
            debug!(job_id = %job_id, status = %existing.status, "Job already enqueued");
            return Ok(JobHandle {
                job_id: existing.id,
                name: existing.name,
                deduplicated: true,
            });
        }

        debug!(job_id = %job_id, name = %name, "Job enqueued");
        Ok(JobHandle {
            job_id: job_id.to_string(),
            name: name.to_string(),
            deduplicated: false,
        })
    }

    async fn get_job(&self, job_id: &str) -> QueueResult<Option<Job>> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(Job::try_from).transpose()
    }

    async fn retry(&self, job_id: &str) -> QueueResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued', error = NULL, started_at = NULL, finished_at = NULL, updated_at = ?
            WHERE id = ? AND status = 'failed'
            "#,
        )
        .bind(format_timestamp(&Utc::now()))
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn cancel(&self, job_id: &str) -> QueueResult<bool> {
        let now = format_timestamp(&Utc::now());
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled', finished_at = ?, updated_at = ?
            WHERE id = ? AND status = 'queued'
            "#,
        )
        .bind(&now)
        .bind(&now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn claim_next(&self, name: &str) -> QueueResult<Option<Job>> {
        let now = format_timestamp(&Utc::now());
        let row: Option<JobRow> = sqlx::query_as(&format!(
            r#"
            UPDATE jobs
            SET status = 'active', attempts = attempts + 1, started_at = ?, updated_at = ?
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'queued' AND name = ?
                ORDER BY created_at ASC, rowid ASC
                LIMIT 1
            ) AND status = 'queued'
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(&now)
        .bind(&now)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn complete(&self, job_id: &str) -> QueueResult<()> {
        let now = format_timestamp(&Utc::now());
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', error = NULL, finished_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&now)
        .bind(&now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound {
                job_id: job_id.to_string(),
            });
        }
        Ok(())
    }

    async fn fail(&self, job_id: &str, error: &str) -> QueueResult<()> {
        let now = format_timestamp(&Utc::now());
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', error = ?, finished_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(error)
        .bind(&now)
        .bind(&now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound {
                job_id: job_id.to_string(),
            });
        }
        Ok(())
    }

    async fn heartbeat(&self, job_id: &str) -> QueueResult<()> {
        sqlx::query("UPDATE jobs SET updated_at = ? WHERE id = ? AND status = 'active'")
            .bind(format_timestamp(&Utc::now()))
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn requeue_stalled(&self, older_than: Duration) -> QueueResult<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued', started_at = NULL, updated_at = ?
            WHERE status = 'active' AND updated_at <= ?
            "#,
        )
        .bind(format_timestamp(&Utc::now()))
        .bind(format_timestamp(&cutoff))
        .execute(&self.pool)
        .await?;

        let requeued = result.rows_affected();
        if requeued > 0 {
            info!(requeued, "Requeued stalled jobs");
        }
        Ok(requeued)
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    name: String,
    payload: String,
    status: String,
    attempts: i64,
    error: Option<String>,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
}

impl TryFrom<JobRow> for Job {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Self {
            payload: serde_json::from_str(&row.payload)?,
            status: row.status.parse().unwrap_or(JobStatus::Failed),
            id: row.id,
            name: row.name,
            attempts: row.attempts.max(0) as u32,
            error: row.error,
            created_at: parse_timestamp(&row.created_at),
            updated_at: parse_timestamp(&row.updated_at),
            started_at: row.started_at.as_deref().map(parse_timestamp),
            finished_at: row.finished_at.as_deref().map(parse_timestamp),
        })
    }
}
