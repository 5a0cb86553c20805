use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::{Job, JobProcessor, JobQueue};
use crate::config::QueueConfig;

/// Lower bound for the reaper and heartbeat period.
const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(100);

/// Polls a [`JobQueue`] for jobs of one name and hands them to a processor.
pub struct QueueWorker {
    queue: Arc<dyn JobQueue>,
    processor: Arc<dyn JobProcessor>,
    job_name: String,
    concurrency: usize,
    poll_interval: Duration,
    stalled_after: Duration,
}

impl QueueWorker {
    /// Create a worker for `job_name` using the queue configuration.
    pub fn new(
        queue: Arc<dyn JobQueue>,
        processor: Arc<dyn JobProcessor>,
        job_name: impl Into<String>,
        config: &QueueConfig,
    ) -> Self {
        Self {
            queue,
            processor,
            job_name: job_name.into(),
            concurrency: config.worker_concurrency.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            stalled_after: Duration::from_secs(config.stalled_after_secs),
        }
    }

    /// Override the number of concurrent job loops.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Requeue stalled jobs, then start the job loops and the stalled-job
    /// reaper.
    ///
    /// Everything exits once `shutdown` flips to `true`; a job in flight is
    /// finished first.
    pub async fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        if let Err(e) = self.queue.requeue_stalled(self.stalled_after).await {
            warn!(error = %e, "Failed to requeue stalled jobs");
        }

        info!(
            job_name = %self.job_name,
            concurrency = self.concurrency,
            "Starting queue workers"
        );

        let worker = Arc::new(self);
        let mut handles: Vec<JoinHandle<()>> = (0..worker.concurrency)
            .map(|slot| {
                let worker = Arc::clone(&worker);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { worker.run_loop(slot, shutdown).await })
            })
            .collect();

        let reaper = Arc::clone(&worker);
        handles.push(tokio::spawn(async move { reaper.reap_loop(shutdown).await }));
        handles
    }

    /// Jobs are requeued and heartbeats sent several times per
    /// `stalled_after`, so a live job is never mistaken for a stalled one.
    fn sweep_period(&self) -> Duration {
        (self.stalled_after / 3).max(MIN_SWEEP_PERIOD)
    }

    /// Requeue jobs whose worker died after this process started.
    async fn reap_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.sweep_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick is immediate and spawn has just swept.
        ticker.tick().await;

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.queue.requeue_stalled(self.stalled_after).await {
                        warn!(error = %e, "Failed to requeue stalled jobs");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Stalled job reaper stopped");
    }

    async fn run_loop(&self, slot: usize, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.queue.claim_next(&self.job_name).await {
                Ok(Some(job)) => {
                    self.handle(slot, job).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => warn!(slot, error = %e, "Failed to claim job"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(slot, "Queue worker stopped");
    }

    async fn handle(&self, slot: usize, job: Job) {
        debug!(slot, job_id = %job.id, attempt = job.attempts, "Processing job");

        let process = self.processor.process(&job);
        tokio::pin!(process);
        let mut heartbeat = tokio::time::interval(self.sweep_period());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        let result = loop {
            tokio::select! {
                result = &mut process => break result,
                _ = heartbeat.tick() => {
                    if let Err(e) = self.queue.heartbeat(&job.id).await {
                        warn!(job_id = %job.id, error = %e, "Failed to record job heartbeat");
                    }
                }
            }
        };

        match result {
            Ok(()) => {
                if let Err(e) = self.queue.complete(&job.id).await {
                    error!(job_id = %job.id, error = %e, "Failed to mark job completed");
                }
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Job failed");
                if let Err(e) = self.queue.fail(&job.id, &e.to_string()).await {
                    error!(job_id = %job.id, error = %e, "Failed to mark job failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppError, AppResult};
    use crate::queue::{JobStatus, SqliteJobQueue};
    use crate::storage::SqliteStorage;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    struct Recorder {
        seen: Mutex<Vec<String>>,
        delay: Duration,
    }

    impl Recorder {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                delay,
            })
        }
    }

    #[async_trait]
    impl JobProcessor for Recorder {
        async fn process(&self, job: &Job) -> AppResult<()> {
            self.seen.lock().await.push(job.id.clone());
            tokio::time::sleep(self.delay).await;
            if job.payload["fail"].as_bool().unwrap_or(false) {
                return Err(AppError::Internal {
                    message: "boom".to_string(),
                });
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_worker_completes_and_fails_jobs_then_stops() {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        let queue: Arc<dyn JobQueue> = Arc::new(SqliteJobQueue::new(storage.pool().clone()));
        queue.enqueue("work", serde_json::json!({}), "ok").await.unwrap();
        queue
            .enqueue("work", serde_json::json!({"fail": true}), "bad")
            .await
            .unwrap();

        let recorder = Recorder::new(Duration::ZERO);
        let config = QueueConfig {
            worker_concurrency: 1,
            poll_interval_ms: 10,
            stalled_after_secs: 900,
            embedded_workers: true,
        };
        let (tx, rx) = watch::channel(false);
        let handles = QueueWorker::new(queue.clone(), recorder.clone(), "work", &config)
            .spawn(rx)
            .await;

        for _ in 0..200 {
            if recorder.seen.lock().await.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Let the worker record the last outcome before shutting down.
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*recorder.seen.lock().await, vec!["ok", "bad"]);
        let ok = queue.get_job("ok").await.unwrap().unwrap();
        assert_eq!(ok.status, JobStatus::Completed);
        let bad = queue.get_job("bad").await.unwrap().unwrap();
        assert_eq!(bad.status, JobStatus::Failed);
        assert!(bad.error.unwrap().contains("boom"));
    }

    fn fast_config(stalled_after_secs: u64) -> QueueConfig {
        QueueConfig {
            worker_concurrency: 1,
            poll_interval_ms: 10,
            stalled_after_secs,
            embedded_workers: true,
        }
    }

    async fn wait_for_status(queue: &Arc<dyn JobQueue>, job_id: &str, status: JobStatus) -> bool {
        for _ in 0..500 {
            if queue.get_job(job_id).await.unwrap().map(|j| j.status) == Some(status) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_job_orphaned_by_crashed_worker_is_reclaimed_while_running() {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        let queue: Arc<dyn JobQueue> = Arc::new(SqliteJobQueue::new(storage.pool().clone()));
        queue.enqueue("work", serde_json::json!({}), "orphan").await.unwrap();
        // Claimed by a worker that died before finishing it.
        queue.claim_next("work").await.unwrap().unwrap();

        let recorder = Recorder::new(Duration::ZERO);
        let (tx, rx) = watch::channel(false);
        let handles = QueueWorker::new(queue.clone(), recorder.clone(), "work", &fast_config(1))
            .spawn(rx)
            .await;

        // Too fresh for the startup sweep; only the periodic reaper frees it.
        assert!(recorder.seen.lock().await.is_empty());
        assert!(wait_for_status(&queue, "orphan", JobStatus::Completed).await);

        tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*recorder.seen.lock().await, vec!["orphan"]);
        assert_eq!(queue.get_job("orphan").await.unwrap().unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn test_long_running_job_is_not_reaped() {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        let queue: Arc<dyn JobQueue> = Arc::new(SqliteJobQueue::new(storage.pool().clone()));
        queue.enqueue("work", serde_json::json!({}), "slow").await.unwrap();

        let recorder = Recorder::new(Duration::from_millis(2500));
        let (tx, rx) = watch::channel(false);
        let handles = QueueWorker::new(queue.clone(), recorder.clone(), "work", &fast_config(1))
            .spawn(rx)
            .await;

        assert!(wait_for_status(&queue, "slow", JobStatus::Completed).await);
        tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*recorder.seen.lock().await, vec!["slow"]);
        assert_eq!(queue.get_job("slow").await.unwrap().unwrap().attempts, 1);
    }
}
