//! Named job queues persisted as rows, drained by bounded worker pools.
//!
//! Jobs sharing a key run one at a time in enqueue order; the claim query
//! enforces it. A retryable failure is rescheduled with jittered exponential
//! backoff until the job runs out of attempts. Cancellation reaches a
//! running handler through [`JobContext::cancel_token`], both for explicit
//! cancel requests and for process shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use serde::de::DeserializeOwned;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ControlPlaneConfig;
use crate::db::{DbClient, JobRecord, JobStatus, NewJob};
use crate::telemetry;

#[cfg(test)]
mod tests;

pub const CREATE_DEPLOYMENT_QUEUE: &str = "create-deployment";
pub const LIVE_DEV_QUEUE: &str = "live-dev";
pub const EXTENSION_EXECUTION_QUEUE: &str = "extension-execution";
pub const HEALTHCHECK_PROBE_QUEUE: &str = "healthcheck-probe";

const STATS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum JobError {
    #[error("{0}")]
    Retryable(String),
    #[error("{0}")]
    Terminal(String),
    #[error("job cancelled")]
    Cancelled,
}

impl From<anyhow::Error> for JobError {
    fn from(error: anyhow::Error) -> Self {
        Self::Retryable(format!("{error:#}"))
    }
}

/// What a handler sees of the job it is running.
#[derive(Debug)]
pub struct JobContext {
    pub job: JobRecord,
    cancel: CancellationToken,
    cancelled_by_user: Arc<AtomicBool>,
}

impl JobContext {
    #[must_use]
    pub fn new(job: JobRecord, cancel: CancellationToken) -> Self {
        Self {
            job,
            cancel,
            cancelled_by_user: Arc::new(AtomicBool::new(false)),
        }
    }

    /// # Errors
    /// A payload that does not decode can never succeed, so it is terminal.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        serde_json::from_str(&self.job.payload)
            .map_err(|error| JobError::Terminal(format!("malformed {} payload: {error}", self.job.queue)))
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancelled by a cancel request rather than by shutdown.
    #[must_use]
    pub fn cancelled_by_user(&self) -> bool {
        self.cancelled_by_user.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_last_attempt(&self) -> bool {
        self.job.attempts >= self.job.max_attempts
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, context: &JobContext) -> Result<(), JobError>;
}

/// Enqueues jobs and wakes the workers of their queue.
#[derive(Clone, Debug)]
pub struct JobQueue {
    db: DbClient,
    wakeups: Arc<DashMap<String, Arc<Notify>>>,
    max_attempts: u32,
}

impl JobQueue {
    /// A failing job runs once plus up to `max_retries` more times.
    #[must_use]
    pub fn new(db: DbClient, max_retries: u32) -> Self {
        Self {
            db,
            wakeups: Arc::new(DashMap::new()),
            max_attempts: max_retries.saturating_add(1),
        }
    }

    #[must_use]
    pub fn db(&self) -> &DbClient {
        &self.db
    }

    fn wakeup(&self, queue: &str) -> Arc<Notify> {
        self.wakeups
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// # Errors
    /// Returns an error if the job row cannot be written.
    pub async fn enqueue(
        &self,
        queue: &str,
        job_key: &str,
        job_id: Option<String>,
        payload: serde_json::Value,
    ) -> Result<JobRecord> {
        let job = self
            .db
            .enqueue_job(&NewJob {
                id: job_id,
                queue: queue.to_string(),
                job_key: job_key.to_string(),
                payload,
                max_attempts: self.max_attempts,
            })
            .await?;
        debug!(queue, job_key, job_id = %job.id, "job enqueued");
        self.wakeup(queue).notify_one();
        Ok(job)
    }

    /// # Errors
    /// Returns an error if the cancel request cannot be written.
    pub async fn cancel(&self, job_id: &str) -> Result<Option<JobStatus>> {
        self.db.request_job_cancel(job_id).await
    }

    /// # Errors
    /// Returns an error if the cancel requests cannot be written.
    pub async fn cancel_key(&self, job_key: &str) -> Result<Vec<String>> {
        self.db.cancel_jobs_for_key(job_key).await
    }
}

#[derive(Clone, Debug)]
pub struct WorkerSettings {
    pub workers: usize,
    pub lease: Duration,
    pub poll_interval: Duration,
    pub cancel_poll_interval: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            lease: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            cancel_poll_interval: Duration::from_secs(1),
            base_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl WorkerSettings {
    #[must_use]
    pub fn from_config(config: &ControlPlaneConfig) -> Self {
        Self {
            workers: config.job_workers_per_queue(),
            ..Self::default()
        }
    }
}

/// `base * 2^(attempt-1)` capped at `max`, minus up to a quarter of jitter.
#[must_use]
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let delay = base.saturating_mul(1 << exponent).min(max);
    let jitter_ceiling = delay / 4;
    if jitter_ceiling.is_zero() {
        return delay;
    }
    let jitter = rand::thread_rng().gen_range(Duration::ZERO..=jitter_ceiling);
    delay - jitter
}

pub struct WorkerPool {
    queue: String,
    handler: Arc<dyn JobHandler>,
    jobs: JobQueue,
    settings: WorkerSettings,
}

impl WorkerPool {
    #[must_use]
    pub fn new(queue: &str, handler: Arc<dyn JobHandler>, jobs: JobQueue, settings: WorkerSettings) -> Self {
        Self {
            queue: queue.to_string(),
            handler,
            jobs,
            settings,
        }
    }

    /// Starts the workers and a queue statistics sampler. Every task stops
    /// once `shutdown` fires and in-flight jobs return.
    #[must_use]
    pub fn spawn(self: Arc<Self>, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.settings.workers + 1);
        for index in 0..self.settings.workers.max(1) {
            let worker_id = format!("{}-{}-{index}", self.queue, uuid::Uuid::new_v4().simple());
            handles.push(tokio::spawn(self.clone().work(worker_id, shutdown.clone())));
        }
        handles.push(tokio::spawn(self.sample_stats(shutdown.clone())));
        handles
    }

    async fn work(self: Arc<Self>, worker_id: String, shutdown: CancellationToken) {
        let wakeup = self.jobs.wakeup(&self.queue);
        debug!(queue = %self.queue, %worker_id, "worker started");

        while !shutdown.is_cancelled() {
            match self.run_next(&worker_id, &shutdown).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(error) => warn!(queue = %self.queue, error = %format!("{error:#}"), "job claim failed"),
            }

            tokio::select! {
                () = shutdown.cancelled() => break,
                () = wakeup.notified() => {}
                () = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }
        debug!(queue = %self.queue, %worker_id, "worker stopped");
    }

    /// Claims and runs one job. Returns whether a job was found.
    ///
    /// # Errors
    /// Returns an error if claiming or recording the outcome fails.
    pub async fn run_next(&self, worker_id: &str, shutdown: &CancellationToken) -> Result<bool> {
        let Some(job) = self
            .jobs
            .db
            .claim_next_job(&self.queue, worker_id, self.settings.lease)
            .await?
        else {
            return Ok(false);
        };

        self.run_job(job, worker_id, shutdown).await?;
        Ok(true)
    }

    async fn run_job(&self, job: JobRecord, worker_id: &str, shutdown: &CancellationToken) -> Result<()> {
        let started = Instant::now();
        let job_id = job.id.clone();
        let attempts = u32::try_from(job.attempts).unwrap_or(u32::MAX);
        let max_attempts = u32::try_from(job.max_attempts).unwrap_or(1);
        info!(queue = %self.queue, %job_id, key = %job.job_key, attempt = attempts, "job started");

        let context = JobContext::new(job, shutdown.child_token());
        let heartbeat_done = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat(
            self.jobs.db.clone(),
            job_id.clone(),
            worker_id.to_string(),
            self.settings.clone(),
            context.cancel.clone(),
            context.cancelled_by_user.clone(),
            heartbeat_done.clone(),
        ));

        let result = self.handler.handle(&context).await;
        heartbeat_done.cancel();
        let _ = heartbeat.await;

        let db = &self.jobs.db;
        let outcome = match result {
            Ok(()) => {
                db.finish_job(&job_id, JobStatus::Succeeded, None).await?;
                "succeeded"
            }
            Err(_) if context.cancelled_by_user() => {
                db.finish_job(&job_id, JobStatus::Cancelled, Some("cancelled")).await?;
                "cancelled"
            }
            Err(JobError::Cancelled) => {
                db.reschedule_job(&job_id, Utc::now(), "interrupted by shutdown").await?;
                "interrupted"
            }
            Err(JobError::Retryable(message)) if attempts < max_attempts => {
                let delay = backoff_delay(attempts, self.settings.base_backoff, self.settings.max_backoff);
                let run_at = Utc::now() + chrono::Duration::from_std(delay)?;
                db.reschedule_job(&job_id, run_at, &message).await?;
                telemetry::job_retried(&self.queue);
                warn!(queue = %self.queue, %job_id, attempt = attempts, ?delay, error = %message, "job will be retried");
                "retried"
            }
            Err(JobError::Retryable(message) | JobError::Terminal(message)) => {
                db.finish_job(&job_id, JobStatus::Failed, Some(&message)).await?;
                warn!(queue = %self.queue, %job_id, error = %message, "job failed");
                "failed"
            }
        };

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        telemetry::job_finished(&self.queue, outcome, elapsed_ms);
        info!(queue = %self.queue, %job_id, outcome, elapsed_ms, "job finished");
        Ok(())
    }

    async fn sample_stats(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            match self.jobs.db.queue_stats(&self.queue).await {
                Ok(stats) => {
                    telemetry::queue_depth(&self.queue, stats.depth);
                    let age = stats.oldest_created_at.map_or(0.0, |oldest| {
                        (Utc::now() - oldest).to_std().unwrap_or_default().as_secs_f64()
                    });
                    telemetry::queue_oldest_age(&self.queue, age);
                }
                Err(error) => debug!(queue = %self.queue, %error, "queue stats unavailable"),
            }
            match self.jobs.db.requeue_expired_leases().await {
                Ok(0) => {}
                Ok(requeued) => {
                    warn!(queue = %self.queue, requeued, "requeued jobs with expired leases");
                    self.jobs.wakeup(&self.queue).notify_one();
                }
                Err(error) => debug!(queue = %self.queue, %error, "lease sweep failed"),
            }

            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(STATS_INTERVAL) => {}
            }
        }
    }
}

/// Keeps the lease alive and turns a stored cancel request into a token
/// cancellation.
async fn heartbeat(
    db: DbClient,
    job_id: String,
    worker_id: String,
    settings: WorkerSettings,
    cancel: CancellationToken,
    cancelled_by_user: Arc<AtomicBool>,
    done: CancellationToken,
) {
    let extend_every = settings.lease / 3;
    let mut last_extended = Instant::now();

    loop {
        tokio::select! {
            () = done.cancelled() => return,
            () = tokio::time::sleep(settings.cancel_poll_interval) => {}
        }

        if !cancelled_by_user.load(Ordering::SeqCst) {
            match db.is_job_cancel_requested(&job_id).await {
                Ok(true) => {
                    info!(%job_id, "cancel requested");
                    cancelled_by_user.store(true, Ordering::SeqCst);
                    cancel.cancel();
                }
                Ok(false) => {}
                Err(error) => debug!(%job_id, %error, "cancel check failed"),
            }
        }

        if last_extended.elapsed() >= extend_every {
            match db.extend_job_lease(&job_id, &worker_id, settings.lease).await {
                Ok(true) => last_extended = Instant::now(),
                Ok(false) => warn!(%job_id, "job lease lost"),
                Err(error) => warn!(%job_id, %error, "failed to extend job lease"),
            }
        }
    }
}

/// Waits for every handle, giving up after `deadline`. Returns whether all
/// tasks finished in time.
pub async fn drain(handles: Vec<JoinHandle<()>>, deadline: Duration) -> bool {
    let all = futures_util::future::join_all(handles);
    if tokio::time::timeout(deadline, all).await.is_ok() {
        true
    } else {
        warn!(?deadline, "workers did not drain before the deadline");
        false
    }
}
