use anyhow::Result;
use serde_json::json;

use super::{
    insert_audit, new_id, now, DbClient, ExecutionStatus, ExtensionExecutionRecord,
    ExtensionRecord, HealthcheckRecord, HealthcheckResultRecord, NewAuditLog, NewHealthcheck, Page,
};

const HEALTHCHECK_COLUMNS: &str =
    "h.id, h.application_id, h.kind, h.target, h.interval_seconds, h.timeout_seconds, h.threshold, h.enabled";

const EXECUTION_COLUMNS: &str =
    "id, extension_id, organization_id, status, variables, output, error, started_at, ended_at, created_at";

impl DbClient {
    /// # Errors
    /// Returns an error if the insert fails.
    pub async fn create_healthcheck(
        &self,
        healthcheck: &NewHealthcheck,
        audit: &NewAuditLog,
    ) -> Result<HealthcheckRecord> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO healthchecks (id, application_id, kind, target, interval_seconds, timeout_seconds, threshold, enabled, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?8)",
        )
        .bind(&healthcheck.id)
        .bind(&healthcheck.application_id)
        .bind(healthcheck.kind.as_str())
        .bind(&healthcheck.target)
        .bind(i64::from(healthcheck.interval_seconds))
        .bind(i64::from(healthcheck.timeout_seconds))
        .bind(i64::from(healthcheck.threshold))
        .bind(now())
        .execute(&mut *tx)
        .await?;

        insert_audit(&mut tx, audit).await?;
        tx.commit().await?;

        Ok(HealthcheckRecord {
            id: healthcheck.id.clone(),
            application_id: healthcheck.application_id.clone(),
            kind: healthcheck.kind,
            target: healthcheck.target.clone(),
            interval_seconds: i64::from(healthcheck.interval_seconds),
            timeout_seconds: i64::from(healthcheck.timeout_seconds),
            threshold: i64::from(healthcheck.threshold),
            enabled: true,
        })
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn list_healthchecks(&self, organization_id: &str) -> Result<Vec<HealthcheckRecord>> {
        let sql = format!(
            "SELECT {HEALTHCHECK_COLUMNS} FROM healthchecks h
             JOIN applications a ON a.id = h.application_id
             WHERE a.organization_id = ?1 AND h.deleted_at IS NULL
             ORDER BY h.created_at"
        );
        let records = sqlx::query_as::<_, HealthcheckRecord>(&sql)
            .bind(organization_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    /// Every enabled check of a live application, across organizations.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn list_enabled_healthchecks(&self) -> Result<Vec<HealthcheckRecord>> {
        let sql = format!(
            "SELECT {HEALTHCHECK_COLUMNS} FROM healthchecks h
             JOIN applications a ON a.id = h.application_id AND a.deleted_at IS NULL
             WHERE h.enabled = 1 AND h.deleted_at IS NULL"
        );
        let records = sqlx::query_as::<_, HealthcheckRecord>(&sql)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn get_healthcheck(
        &self,
        organization_id: &str,
        healthcheck_id: &str,
    ) -> Result<Option<HealthcheckRecord>> {
        let sql = format!(
            "SELECT {HEALTHCHECK_COLUMNS} FROM healthchecks h
             JOIN applications a ON a.id = h.application_id
             WHERE h.id = ?1 AND a.organization_id = ?2 AND h.deleted_at IS NULL"
        );
        let record = sqlx::query_as::<_, HealthcheckRecord>(&sql)
            .bind(healthcheck_id)
            .bind(organization_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    /// # Errors
    /// Returns an error if the write fails.
    pub async fn delete_healthcheck(
        &self,
        organization_id: &str,
        healthcheck_id: &str,
        audit: &NewAuditLog,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE healthchecks SET enabled = 0, deleted_at = ?3, updated_at = ?3
             WHERE id = ?1 AND deleted_at IS NULL
               AND application_id IN (SELECT id FROM applications WHERE organization_id = ?2)",
        )
        .bind(healthcheck_id)
        .bind(organization_id)
        .bind(now())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        insert_audit(&mut tx, audit).await?;
        tx.commit().await?;

        Ok(true)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn is_healthcheck_enabled(&self, healthcheck_id: &str) -> Result<bool> {
        let enabled = sqlx::query_scalar::<_, bool>(
            "SELECT enabled FROM healthchecks WHERE id = ?1 AND deleted_at IS NULL",
        )
        .bind(healthcheck_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(enabled.unwrap_or(false))
    }

    /// # Errors
    /// Returns an error if the insert fails.
    pub async fn record_healthcheck_result(
        &self,
        healthcheck: &HealthcheckRecord,
        ok: bool,
        latency_ms: u64,
        detail: &str,
    ) -> Result<()> {
        let timestamp = now();
        let latency_ms = i64::try_from(latency_ms).unwrap_or(i64::MAX);
        let result_id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO healthcheck_results (healthcheck_id, timestamp, ok, latency_ms, detail) VALUES (?1, ?2, ?3, ?4, ?5) RETURNING id",
        )
        .bind(&healthcheck.id)
        .bind(&timestamp)
        .bind(ok)
        .bind(latency_ms)
        .bind(detail)
        .fetch_one(&self.pool)
        .await?;

        self.notify(
            "healthcheck_results",
            "insert",
            &healthcheck.application_id,
            json!({
                "id": result_id,
                "healthcheck_id": healthcheck.id,
                "ok": ok,
                "latency_ms": latency_ms,
                "detail": detail,
                "timestamp": timestamp,
            }),
        );

        Ok(())
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn list_healthcheck_results(
        &self,
        healthcheck_id: &str,
        page: Page,
    ) -> Result<Vec<HealthcheckResultRecord>> {
        let records = sqlx::query_as::<_, HealthcheckResultRecord>(
            "SELECT id, healthcheck_id, timestamp, ok, latency_ms, detail FROM healthcheck_results
             WHERE healthcheck_id = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2 OFFSET ?3",
        )
        .bind(healthcheck_id)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// # Errors
    /// Returns an error if the name is taken or the insert fails.
    pub async fn create_extension(
        &self,
        organization_id: &str,
        name: &str,
        description: &str,
        spec: &str,
        audit: &NewAuditLog,
    ) -> Result<ExtensionRecord> {
        let extension_id = new_id();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO extensions (id, organization_id, name, description, spec, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        )
        .bind(&extension_id)
        .bind(organization_id)
        .bind(name)
        .bind(description)
        .bind(spec)
        .bind(now())
        .execute(&mut *tx)
        .await?;

        insert_audit(&mut tx, audit).await?;
        let record = sqlx::query_as::<_, ExtensionRecord>(
            "SELECT id, organization_id, name, description, spec, created_at FROM extensions WHERE id = ?1",
        )
        .bind(&extension_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(record)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn list_extensions(&self, organization_id: &str) -> Result<Vec<ExtensionRecord>> {
        let records = sqlx::query_as::<_, ExtensionRecord>(
            "SELECT id, organization_id, name, description, spec, created_at FROM extensions WHERE organization_id = ?1 AND deleted_at IS NULL ORDER BY name",
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn get_extension(
        &self,
        organization_id: &str,
        extension_id: &str,
    ) -> Result<Option<ExtensionRecord>> {
        let record = sqlx::query_as::<_, ExtensionRecord>(
            "SELECT id, organization_id, name, description, spec, created_at FROM extensions WHERE id = ?1 AND organization_id = ?2 AND deleted_at IS NULL",
        )
        .bind(extension_id)
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// # Errors
    /// Returns an error if the insert fails.
    pub async fn create_extension_execution(
        &self,
        extension: &ExtensionRecord,
        variables: &serde_json::Value,
        audit: &NewAuditLog,
    ) -> Result<ExtensionExecutionRecord> {
        let execution_id = new_id();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO extension_executions (id, extension_id, organization_id, status, variables, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&execution_id)
        .bind(&extension.id)
        .bind(&extension.organization_id)
        .bind(ExecutionStatus::Pending.as_str())
        .bind(variables.to_string())
        .bind(now())
        .execute(&mut *tx)
        .await?;

        insert_audit(&mut tx, audit).await?;
        let sql = format!("SELECT {EXECUTION_COLUMNS} FROM extension_executions WHERE id = ?1");
        let record = sqlx::query_as::<_, ExtensionExecutionRecord>(&sql)
            .bind(&execution_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(record)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn get_extension_execution(
        &self,
        execution_id: &str,
    ) -> Result<Option<ExtensionExecutionRecord>> {
        let sql = format!("SELECT {EXECUTION_COLUMNS} FROM extension_executions WHERE id = ?1");
        let record = sqlx::query_as::<_, ExtensionExecutionRecord>(&sql)
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn list_extension_executions(
        &self,
        organization_id: &str,
        page: Page,
    ) -> Result<Vec<ExtensionExecutionRecord>> {
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM extension_executions WHERE organization_id = ?1 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
        );
        let records = sqlx::query_as::<_, ExtensionExecutionRecord>(&sql)
            .bind(organization_id)
            .bind(page.limit())
            .bind(page.offset())
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    /// # Errors
    /// Returns an error if the update fails.
    pub async fn update_extension_execution(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        output: &str,
        error: Option<&str>,
    ) -> Result<()> {
        let now = now();
        sqlx::query(
            "UPDATE extension_executions SET
               status = ?2,
               output = ?3,
               error = ?4,
               started_at = COALESCE(started_at, ?5),
               ended_at = CASE WHEN ?2 IN ('succeeded', 'failed', 'rolled_back') THEN ?5 ELSE ended_at END
             WHERE id = ?1",
        )
        .bind(execution_id)
        .bind(status.as_str())
        .bind(output)
        .bind(error)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
