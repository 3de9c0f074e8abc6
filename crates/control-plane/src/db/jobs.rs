use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};

use super::{new_id, now, timestamp, DbClient, JobRecord, JobStatus};

const JOB_COLUMNS: &str = "seq, id, queue, job_key, payload, status, attempts, max_attempts, run_at, lease_owner, lease_expires_at, cancel_requested, last_error, created_at";

#[derive(Clone, Debug)]
pub struct NewJob {
    /// Explicit id, e.g. the deployment a job drives. Generated when absent.
    pub id: Option<String>,
    pub queue: String,
    pub job_key: String,
    pub payload: serde_json::Value,
    pub max_attempts: u32,
}

/// Pending-job statistics for one queue.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueueStats {
    pub depth: u64,
    pub oldest_created_at: Option<DateTime<Utc>>,
}

impl DbClient {
    /// # Errors
    /// Returns an error if the insert fails.
    pub async fn enqueue_job(&self, job: &NewJob) -> Result<JobRecord> {
        let job_id = job.id.clone().unwrap_or_else(new_id);
        let now = now();
        sqlx::query(
            "INSERT INTO jobs (id, queue, job_key, payload, status, max_attempts, run_at, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?6, ?6)",
        )
        .bind(&job_id)
        .bind(&job.queue)
        .bind(&job.job_key)
        .bind(job.payload.to_string())
        .bind(i64::from(job.max_attempts.max(1)))
        .bind(&now)
        .execute(&self.pool)
        .await?;

        match self.get_job(&job_id).await? {
            Some(record) => Ok(record),
            None => bail!("job {job_id} vanished after insert"),
        }
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
        let record = sqlx::query_as::<_, JobRecord>(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    /// Leases the oldest runnable job of a queue whose key has no running job
    /// and no earlier pending job. One statement, so two workers can never
    /// claim the same row.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn claim_next_job(
        &self,
        queue: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<JobRecord>> {
        let now = Utc::now();
        let lease_expires_at = now + chrono::Duration::from_std(lease)?;
        let sql = format!(
            "UPDATE jobs SET status = 'running', attempts = attempts + 1, lease_owner = ?2, lease_expires_at = ?3, updated_at = ?4
             WHERE id = (
               SELECT j.id FROM jobs j
               WHERE j.queue = ?1 AND j.status = 'pending' AND j.run_at <= ?4 AND j.cancel_requested = 0
                 AND NOT EXISTS (SELECT 1 FROM jobs r WHERE r.job_key = j.job_key AND r.status = 'running')
                 AND NOT EXISTS (SELECT 1 FROM jobs e WHERE e.job_key = j.job_key AND e.status = 'pending' AND e.seq < j.seq)
               ORDER BY j.seq LIMIT 1
             )
             RETURNING {JOB_COLUMNS}"
        );
        let record = sqlx::query_as::<_, JobRecord>(&sql)
            .bind(queue)
            .bind(worker_id)
            .bind(timestamp(lease_expires_at))
            .bind(timestamp(now))
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    /// # Errors
    /// Returns an error if the update fails.
    pub async fn extend_job_lease(&self, job_id: &str, worker_id: &str, lease: Duration) -> Result<bool> {
        let lease_expires_at = Utc::now() + chrono::Duration::from_std(lease)?;
        let result = sqlx::query(
            "UPDATE jobs SET lease_expires_at = ?3 WHERE id = ?1 AND lease_owner = ?2 AND status = 'running'",
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(timestamp(lease_expires_at))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// # Errors
    /// Returns an error if the update fails.
    pub async fn finish_job(&self, job_id: &str, status: JobStatus, error: Option<&str>) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET status = ?2, last_error = COALESCE(?3, last_error), lease_owner = NULL, lease_expires_at = NULL, updated_at = ?4 WHERE id = ?1",
        )
        .bind(job_id)
        .bind(status.as_str())
        .bind(error)
        .bind(now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Returns a running job to `pending` to run again at `run_at`.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn reschedule_job(&self, job_id: &str, run_at: DateTime<Utc>, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET status = 'pending', run_at = ?2, last_error = ?3, lease_owner = NULL, lease_expires_at = NULL, updated_at = ?4 WHERE id = ?1",
        )
        .bind(job_id)
        .bind(timestamp(run_at))
        .bind(error)
        .bind(now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Pending jobs are cancelled outright; running jobs get a cancellation
    /// request their worker observes. Returns the job's resulting status.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn request_job_cancel(&self, job_id: &str) -> Result<Option<JobStatus>> {
        let now = now();
        sqlx::query(
            "UPDATE jobs SET status = CASE WHEN status = 'pending' THEN 'cancelled' ELSE status END,
                             cancel_requested = 1, updated_at = ?2
             WHERE id = ?1 AND status IN ('pending', 'running')",
        )
        .bind(job_id)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(self.get_job(job_id).await?.map(|job| job.status))
    }

    /// Cancels every unfinished job sharing a serialization key.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn cancel_jobs_for_key(&self, job_key: &str) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT id FROM jobs WHERE job_key = ?1 AND status IN ('pending', 'running')",
        )
        .bind(job_key)
        .fetch_all(&self.pool)
        .await?;

        for job_id in &ids {
            self.request_job_cancel(job_id).await?;
        }

        Ok(ids)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn is_job_cancel_requested(&self, job_id: &str) -> Result<bool> {
        let requested = sqlx::query_scalar::<_, bool>("SELECT cancel_requested FROM jobs WHERE id = ?1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(requested.unwrap_or(false))
    }

    /// Returns running jobs whose lease expired to `pending`.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn requeue_expired_leases(&self) -> Result<u64> {
        let now = now();
        let result = sqlx::query(
            "UPDATE jobs SET status = 'pending', lease_owner = NULL, lease_expires_at = NULL, updated_at = ?1
             WHERE status = 'running' AND lease_expires_at IS NOT NULL AND lease_expires_at < ?1",
        )
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn has_unfinished_job(&self, job_id: &str) -> Result<bool> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM jobs WHERE id = ?1 AND status IN ('pending', 'running')",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn queue_stats(&self, queue: &str) -> Result<QueueStats> {
        let (depth, oldest) = sqlx::query_as::<_, (i64, Option<DateTime<Utc>>)>(
            "SELECT COUNT(*), MIN(created_at) FROM jobs WHERE queue = ?1 AND status = 'pending'",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            depth: u64::try_from(depth).unwrap_or_default(),
            oldest_created_at: oldest,
        })
    }
}
