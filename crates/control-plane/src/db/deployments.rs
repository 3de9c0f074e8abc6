use anyhow::{bail, Result};
use serde_json::json;

use super::{
    new_id, now, DbClient, DeploymentArtifacts, DeploymentLogRecord, DeploymentRecord,
    DeploymentStatus, DeploymentTrigger, LogLevel, Page,
};

const DEPLOYMENT_COLUMNS: &str = "id, application_id, commit_hash, container_id, container_name, container_image, status, trigger, rollback_of, started_at, ended_at, created_at, updated_at";

#[derive(Debug, thiserror::Error)]
#[error("deployment {deployment_id} cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub deployment_id: String,
    pub from: DeploymentStatus,
    pub to: DeploymentStatus,
}

impl DbClient {
    /// # Errors
    /// Returns an error if the insert fails.
    pub async fn create_deployment(
        &self,
        application_id: &str,
        trigger: DeploymentTrigger,
        rollback_of: Option<&str>,
    ) -> Result<DeploymentRecord> {
        let deployment_id = new_id();
        let now = now();
        sqlx::query(
            "INSERT INTO deployments (id, application_id, status, trigger, rollback_of, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        )
        .bind(&deployment_id)
        .bind(application_id)
        .bind(DeploymentStatus::Queued.as_str())
        .bind(trigger.as_str())
        .bind(rollback_of)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        sqlx::query("UPDATE applications SET status = 'deploying', updated_at = ?2 WHERE id = ?1 AND current_deployment_id IS NULL")
            .bind(application_id)
            .bind(&now)
            .execute(&self.pool)
            .await?;

        let record = self.require_deployment(&deployment_id).await?;
        self.notify_deployment("insert", &record);

        Ok(record)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn get_deployment(&self, deployment_id: &str) -> Result<Option<DeploymentRecord>> {
        let sql = format!("SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE id = ?1");
        let record = sqlx::query_as::<_, DeploymentRecord>(&sql)
            .bind(deployment_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    async fn require_deployment(&self, deployment_id: &str) -> Result<DeploymentRecord> {
        match self.get_deployment(deployment_id).await? {
            Some(record) => Ok(record),
            None => bail!("deployment {deployment_id} not found"),
        }
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn list_deployments(
        &self,
        application_id: &str,
        page: Page,
    ) -> Result<Vec<DeploymentRecord>> {
        let sql = format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE application_id = ?1 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
        );
        let records = sqlx::query_as::<_, DeploymentRecord>(&sql)
            .bind(application_id)
            .bind(page.limit())
            .bind(page.offset())
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    /// Deployments that never reached a terminal state.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn list_unfinished_deployments(&self) -> Result<Vec<DeploymentRecord>> {
        let sql = format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE status IN ('queued', 'cloning', 'building', 'starting', 'health_check', 'restarting') ORDER BY created_at"
        );
        let records = sqlx::query_as::<_, DeploymentRecord>(&sql)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    /// Most recent earlier deployment that served traffic and still has an image.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn find_rollback_target(
        &self,
        application_id: &str,
        exclude_deployment_id: Option<&str>,
    ) -> Result<Option<DeploymentRecord>> {
        let sql = format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments
             WHERE application_id = ?1 AND status IN ('superseded', 'rolled_back')
               AND container_image IS NOT NULL AND id <> COALESCE(?2, '')
             ORDER BY created_at DESC LIMIT 1"
        );
        let record = sqlx::query_as::<_, DeploymentRecord>(&sql)
            .bind(application_id)
            .bind(exclude_deployment_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    /// Moves a deployment forward. Backwards or skipped moves are rejected
    /// with [`InvalidTransition`].
    ///
    /// # Errors
    /// Returns an error if the transition is not allowed or the write fails.
    pub async fn transition_deployment(
        &self,
        deployment_id: &str,
        next: DeploymentStatus,
    ) -> Result<DeploymentRecord> {
        let mut tx = self.pool.begin().await?;
        let current = sqlx::query_scalar::<_, String>("SELECT status FROM deployments WHERE id = ?1")
            .bind(deployment_id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(current) = current else {
            bail!("deployment {deployment_id} not found");
        };
        let current: DeploymentStatus = current.parse()?;
        if !current.can_transition_to(next) {
            return Err(InvalidTransition {
                deployment_id: deployment_id.to_string(),
                from: current,
                to: next,
            }
            .into());
        }

        let now = now();
        sqlx::query(
            "UPDATE deployments SET
               status = ?2,
               started_at = CASE WHEN started_at IS NULL AND ?2 <> 'failed' THEN ?3 ELSE started_at END,
               ended_at = CASE WHEN ?4 THEN ?3 ELSE ended_at END,
               updated_at = ?3
             WHERE id = ?1",
        )
        .bind(deployment_id)
        .bind(next.as_str())
        .bind(&now)
        .bind(next.is_terminal() && next != DeploymentStatus::Superseded)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let record = self.require_deployment(deployment_id).await?;
        self.notify_deployment("update", &record);

        Ok(record)
    }

    /// # Errors
    /// Returns an error if the write fails.
    pub async fn record_deployment_artifacts(
        &self,
        deployment_id: &str,
        artifacts: &DeploymentArtifacts,
    ) -> Result<DeploymentRecord> {
        sqlx::query(
            "UPDATE deployments SET
               commit_hash = COALESCE(?2, commit_hash),
               container_id = COALESCE(?3, container_id),
               container_name = COALESCE(?4, container_name),
               container_image = COALESCE(?5, container_image),
               updated_at = ?6
             WHERE id = ?1",
        )
        .bind(deployment_id)
        .bind(artifacts.commit_hash.as_deref())
        .bind(artifacts.container_id.as_deref())
        .bind(artifacts.container_name.as_deref())
        .bind(artifacts.container_image.as_deref())
        .bind(now())
        .execute(&self.pool)
        .await?;

        let record = self.require_deployment(deployment_id).await?;
        self.notify_deployment("update", &record);

        Ok(record)
    }

    /// Atomically supersedes whatever is serving and makes `deployment_id`
    /// the application's serving deployment in state `status`
    /// (`live` or `rolled_back`). Returns the superseded deployment.
    ///
    /// # Errors
    /// Returns an error if the transition is not allowed or a write fails.
    pub async fn promote_deployment(
        &self,
        application_id: &str,
        deployment_id: &str,
        status: DeploymentStatus,
    ) -> Result<Option<DeploymentRecord>> {
        if !status.is_serving() {
            bail!("cannot promote a deployment into {status}");
        }

        let now = now();
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_scalar::<_, String>(
            "SELECT status FROM deployments WHERE id = ?1 AND application_id = ?2",
        )
        .bind(deployment_id)
        .bind(application_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(current) = current else {
            bail!("deployment {deployment_id} not found for application {application_id}");
        };
        let current: DeploymentStatus = current.parse()?;
        if !current.can_transition_to(status) {
            return Err(InvalidTransition {
                deployment_id: deployment_id.to_string(),
                from: current,
                to: status,
            }
            .into());
        }

        let sql = format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE application_id = ?1 AND id <> ?2 AND status IN ('live', 'rolled_back') ORDER BY created_at DESC LIMIT 1"
        );
        let previous = sqlx::query_as::<_, DeploymentRecord>(&sql)
            .bind(application_id)
            .bind(deployment_id)
            .fetch_optional(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE deployments SET status = 'superseded', updated_at = ?3 WHERE application_id = ?1 AND id <> ?2 AND status IN ('live', 'rolled_back')",
        )
        .bind(application_id)
        .bind(deployment_id)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE deployments SET status = ?2, ended_at = ?3, started_at = COALESCE(started_at, ?3), updated_at = ?3 WHERE id = ?1",
        )
        .bind(deployment_id)
        .bind(status.as_str())
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE applications SET current_deployment_id = ?2, status = 'running', last_deployment_failed = 0, updated_at = ?3 WHERE id = ?1",
        )
        .bind(application_id)
        .bind(deployment_id)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if let Some(previous) = &previous {
            if let Some(superseded) = self.get_deployment(&previous.id).await? {
                self.notify_deployment("update", &superseded);
            }
        }
        let promoted = self.require_deployment(deployment_id).await?;
        self.notify_deployment("update", &promoted);

        Ok(previous)
    }

    /// # Errors
    /// Returns an error if the insert fails.
    pub async fn append_deployment_log(
        &self,
        application_id: &str,
        deployment_id: &str,
        level: LogLevel,
        message: &str,
    ) -> Result<()> {
        let timestamp = now();
        let log_id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO deployment_logs (deployment_id, level, message, timestamp) VALUES (?1, ?2, ?3, ?4) RETURNING id",
        )
        .bind(deployment_id)
        .bind(level.as_str())
        .bind(message)
        .bind(&timestamp)
        .fetch_one(&self.pool)
        .await?;

        self.notify(
            "deployment_logs",
            "insert",
            application_id,
            json!({
                "id": log_id,
                "deployment_id": deployment_id,
                "level": level.as_str(),
                "message": message,
                "timestamp": timestamp,
            }),
        );

        Ok(())
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn list_deployment_logs(
        &self,
        deployment_id: &str,
        page: Page,
    ) -> Result<Vec<DeploymentLogRecord>> {
        let records = sqlx::query_as::<_, DeploymentLogRecord>(
            "SELECT id, deployment_id, level, message, timestamp FROM deployment_logs
             WHERE deployment_id = ?1 ORDER BY timestamp ASC, id ASC LIMIT ?2 OFFSET ?3",
        )
        .bind(deployment_id)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    fn notify_deployment(&self, action: &str, record: &DeploymentRecord) {
        let data = serde_json::to_value(record).unwrap_or_else(|_| json!({ "id": record.id }));
        self.notify("deployments", action, &record.application_id, data);
    }
}
