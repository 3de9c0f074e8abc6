use anyhow::{Context, Result};

use super::{
    insert_audit, new_id, now, ApplicationRecord, ApplicationStatus, ApplicationUpdate, DbClient,
    DomainRecord, HealthStatus, NewApplication, NewAuditLog, Page, RepoCredentialRecord,
};

const APPLICATION_COLUMNS: &str = "id, organization_id, user_id, family_id, name, repository, branch, build_pack, dockerfile_path, base_path, port, domain, environment, framework, pre_run_command, post_run_command, build_variables, environment_variables, labels, status, health_status, last_deployment_failed, current_deployment_id, created_at, updated_at";

/// Route a serving deployment should have in the proxy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServingRoute {
    pub application_id: String,
    pub domain: String,
    pub container_name: String,
    pub port: u16,
}

impl DbClient {
    /// # Errors
    /// Returns an error if `(organization, name, environment)` is taken or a write fails.
    pub async fn create_application(
        &self,
        application: &NewApplication,
        audit: &NewAuditLog,
    ) -> Result<ApplicationRecord> {
        let now = now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO applications (id, organization_id, user_id, family_id, name, repository, branch, build_pack, dockerfile_path, base_path, port, domain, environment, framework, pre_run_command, post_run_command, build_variables, environment_variables, labels, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?21)",
        )
        .bind(&application.id)
        .bind(&application.organization_id)
        .bind(&application.user_id)
        .bind(application.family_id.as_deref())
        .bind(&application.name)
        .bind(&application.repository)
        .bind(&application.branch)
        .bind(application.build_pack.as_str())
        .bind(application.dockerfile_path.as_deref())
        .bind(application.base_path.as_deref())
        .bind(i64::from(application.port))
        .bind(application.domain.as_deref())
        .bind(application.environment.as_str())
        .bind(application.framework.as_deref())
        .bind(&application.pre_run_command)
        .bind(&application.post_run_command)
        .bind(application.build_variables.to_json()?)
        .bind(application.environment_variables.to_json()?)
        .bind(application.labels.to_json()?)
        .bind(ApplicationStatus::Created.as_str())
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        insert_audit(&mut tx, audit).await?;

        let sql = format!("SELECT {APPLICATION_COLUMNS} FROM applications WHERE id = ?1");
        let record = sqlx::query_as::<_, ApplicationRecord>(&sql)
            .bind(&application.id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(record)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn get_application(&self, application_id: &str) -> Result<Option<ApplicationRecord>> {
        let sql = format!(
            "SELECT {APPLICATION_COLUMNS} FROM applications WHERE id = ?1 AND deleted_at IS NULL"
        );
        let record = sqlx::query_as::<_, ApplicationRecord>(&sql)
            .bind(application_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn get_application_in_organization(
        &self,
        organization_id: &str,
        application_id: &str,
    ) -> Result<Option<ApplicationRecord>> {
        let sql = format!(
            "SELECT {APPLICATION_COLUMNS} FROM applications WHERE id = ?1 AND organization_id = ?2 AND deleted_at IS NULL"
        );
        let record = sqlx::query_as::<_, ApplicationRecord>(&sql)
            .bind(application_id)
            .bind(organization_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn list_applications(
        &self,
        organization_id: &str,
        page: Page,
    ) -> Result<Vec<ApplicationRecord>> {
        let sql = format!(
            "SELECT {APPLICATION_COLUMNS} FROM applications WHERE organization_id = ?1 AND deleted_at IS NULL ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
        );
        let records = sqlx::query_as::<_, ApplicationRecord>(&sql)
            .bind(organization_id)
            .bind(page.limit())
            .bind(page.offset())
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    /// Every non-deleted application, across organizations.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn list_all_applications(&self) -> Result<Vec<ApplicationRecord>> {
        let sql = format!(
            "SELECT {APPLICATION_COLUMNS} FROM applications WHERE deleted_at IS NULL ORDER BY created_at"
        );
        let records = sqlx::query_as::<_, ApplicationRecord>(&sql)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn list_family(&self, family_id: &str) -> Result<Vec<ApplicationRecord>> {
        let sql = format!(
            "SELECT {APPLICATION_COLUMNS} FROM applications WHERE family_id = ?1 AND deleted_at IS NULL ORDER BY environment"
        );
        let records = sqlx::query_as::<_, ApplicationRecord>(&sql)
            .bind(family_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    /// Applies stored-field changes. Running containers are not touched.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub async fn update_application(
        &self,
        organization_id: &str,
        application_id: &str,
        update: &ApplicationUpdate,
        audit: &NewAuditLog,
    ) -> Result<Option<ApplicationRecord>> {
        let build_variables = update
            .build_variables
            .as_ref()
            .map(super::StringMap::to_json)
            .transpose()?;
        let environment_variables = update
            .environment_variables
            .as_ref()
            .map(super::StringMap::to_json)
            .transpose()?;
        let labels = update
            .labels
            .as_ref()
            .map(super::StringMap::to_json)
            .transpose()?;

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE applications SET
               repository = COALESCE(?3, repository),
               branch = COALESCE(?4, branch),
               build_pack = COALESCE(?5, build_pack),
               dockerfile_path = COALESCE(?6, dockerfile_path),
               base_path = COALESCE(?7, base_path),
               port = COALESCE(?8, port),
               domain = COALESCE(?9, domain),
               framework = COALESCE(?10, framework),
               pre_run_command = COALESCE(?11, pre_run_command),
               post_run_command = COALESCE(?12, post_run_command),
               build_variables = COALESCE(?13, build_variables),
               environment_variables = COALESCE(?14, environment_variables),
               labels = COALESCE(?15, labels),
               updated_at = ?16
             WHERE id = ?1 AND organization_id = ?2 AND deleted_at IS NULL",
        )
        .bind(application_id)
        .bind(organization_id)
        .bind(update.repository.as_deref())
        .bind(update.branch.as_deref())
        .bind(update.build_pack.map(super::BuildPack::as_str))
        .bind(update.dockerfile_path.as_deref())
        .bind(update.base_path.as_deref())
        .bind(update.port.map(i64::from))
        .bind(update.domain.as_deref())
        .bind(update.framework.as_deref())
        .bind(update.pre_run_command.as_deref())
        .bind(update.post_run_command.as_deref())
        .bind(build_variables)
        .bind(environment_variables)
        .bind(labels)
        .bind(now())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        insert_audit(&mut tx, audit).await?;
        tx.commit().await?;

        self.get_application(application_id).await
    }

    /// # Errors
    /// Returns an error if the write fails.
    pub async fn soft_delete_application(
        &self,
        organization_id: &str,
        application_id: &str,
        audit: &NewAuditLog,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let now = now();
        let result = sqlx::query(
            "UPDATE applications SET deleted_at = ?3, updated_at = ?3, status = 'stopped' WHERE id = ?1 AND organization_id = ?2 AND deleted_at IS NULL",
        )
        .bind(application_id)
        .bind(organization_id)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query("UPDATE healthchecks SET enabled = 0, deleted_at = ?2, updated_at = ?2 WHERE application_id = ?1 AND deleted_at IS NULL")
            .bind(application_id)
            .bind(&now)
            .execute(&mut *tx)
            .await?;

        insert_audit(&mut tx, audit).await?;
        tx.commit().await?;

        Ok(true)
    }

    /// # Errors
    /// Returns an error if the write fails.
    pub async fn set_application_status(
        &self,
        application_id: &str,
        status: ApplicationStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE applications SET status = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(application_id)
            .bind(status.as_str())
            .bind(now())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Records a failed attempt. An application that was already running keeps
    /// `running` and only gains the failure indicator.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub async fn mark_deployment_failed_on_application(&self, application_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE applications SET
               last_deployment_failed = 1,
               status = CASE WHEN current_deployment_id IS NULL THEN 'failed' ELSE 'running' END,
               updated_at = ?2
             WHERE id = ?1",
        )
        .bind(application_id)
        .bind(now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Returns whether the stored health status changed.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub async fn set_application_health(
        &self,
        application_id: &str,
        health: HealthStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE applications SET health_status = ?2, updated_at = ?3 WHERE id = ?1 AND health_status <> ?2",
        )
        .bind(application_id)
        .bind(health.as_str())
        .bind(now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Domain routes for every application with a serving deployment.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn list_serving_routes(&self) -> Result<Vec<ServingRoute>> {
        let rows = sqlx::query_as::<_, (String, String, String, i64)>(
            "SELECT a.id, a.domain, d.container_name, a.port FROM applications a
             JOIN deployments d ON d.id = a.current_deployment_id
             WHERE a.deleted_at IS NULL AND a.domain IS NOT NULL AND a.domain <> ''
               AND d.container_name IS NOT NULL AND d.status IN ('live', 'rolled_back')
             ORDER BY a.created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(application_id, domain, container_name, port)| {
                Ok(ServingRoute {
                    application_id,
                    domain,
                    container_name,
                    port: u16::try_from(port).context("stored port out of range")?,
                })
            })
            .collect()
    }

    /// # Errors
    /// Returns an error if the name is taken or a write fails.
    pub async fn create_domain(
        &self,
        organization_id: &str,
        user_id: &str,
        name: &str,
        audit: &NewAuditLog,
    ) -> Result<DomainRecord> {
        let domain_id = new_id();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO domains (id, name, organization_id, user_id, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        )
        .bind(&domain_id)
        .bind(name)
        .bind(organization_id)
        .bind(user_id)
        .bind(now())
        .execute(&mut *tx)
        .await?;

        insert_audit(&mut tx, audit).await?;
        let record = sqlx::query_as::<_, DomainRecord>(
            "SELECT id, name, organization_id, user_id, created_at FROM domains WHERE id = ?1",
        )
        .bind(&domain_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(record)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn list_domains(&self, organization_id: &str, page: Page) -> Result<Vec<DomainRecord>> {
        let records = sqlx::query_as::<_, DomainRecord>(
            "SELECT id, name, organization_id, user_id, created_at FROM domains WHERE organization_id = ?1 AND deleted_at IS NULL ORDER BY name LIMIT ?2 OFFSET ?3",
        )
        .bind(organization_id)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn find_domain(&self, organization_id: &str, name: &str) -> Result<Option<DomainRecord>> {
        let record = sqlx::query_as::<_, DomainRecord>(
            "SELECT id, name, organization_id, user_id, created_at FROM domains WHERE organization_id = ?1 AND name = ?2 AND deleted_at IS NULL",
        )
        .bind(organization_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// # Errors
    /// Returns an error if the write fails.
    pub async fn delete_domain(
        &self,
        organization_id: &str,
        domain_id: &str,
        audit: &NewAuditLog,
    ) -> Result<Option<DomainRecord>> {
        let mut tx = self.pool.begin().await?;
        let record = sqlx::query_as::<_, DomainRecord>(
            "SELECT id, name, organization_id, user_id, created_at FROM domains WHERE id = ?1 AND organization_id = ?2 AND deleted_at IS NULL",
        )
        .bind(domain_id)
        .bind(organization_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(record) = record else {
            return Ok(None);
        };

        sqlx::query("UPDATE domains SET deleted_at = ?2, updated_at = ?2 WHERE id = ?1")
            .bind(domain_id)
            .bind(now())
            .execute(&mut *tx)
            .await?;

        insert_audit(&mut tx, audit).await?;
        tx.commit().await?;

        Ok(Some(record))
    }

    /// # Errors
    /// Returns an error if the write fails.
    pub async fn upsert_repo_credential(
        &self,
        credential: &RepoCredentialRecord,
        audit: &NewAuditLog,
    ) -> Result<()> {
        let now = now();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO repo_credentials (id, organization_id, app_id, installation_id, private_key_encrypted, client_id, client_secret_encrypted, webhook_secret_encrypted, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(organization_id) DO UPDATE SET
               app_id = excluded.app_id,
               installation_id = excluded.installation_id,
               private_key_encrypted = excluded.private_key_encrypted,
               client_id = excluded.client_id,
               client_secret_encrypted = excluded.client_secret_encrypted,
               webhook_secret_encrypted = excluded.webhook_secret_encrypted,
               updated_at = excluded.updated_at",
        )
        .bind(&credential.id)
        .bind(&credential.organization_id)
        .bind(&credential.app_id)
        .bind(&credential.installation_id)
        .bind(&credential.private_key_encrypted)
        .bind(&credential.client_id)
        .bind(&credential.client_secret_encrypted)
        .bind(&credential.webhook_secret_encrypted)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        insert_audit(&mut tx, audit).await?;
        tx.commit().await?;

        Ok(())
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn get_repo_credential(
        &self,
        organization_id: &str,
    ) -> Result<Option<RepoCredentialRecord>> {
        let record = sqlx::query_as::<_, RepoCredentialRecord>(
            "SELECT id, organization_id, app_id, installation_id, private_key_encrypted, client_id, client_secret_encrypted, webhook_secret_encrypted, updated_at
             FROM repo_credentials WHERE organization_id = ?1",
        )
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }
}
