use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{DeployError, DeploymentEngine};
use crate::db::{
    ApplicationRecord, DbClient, DeploymentRecord, DeploymentStatus, DeploymentTrigger, JobStatus,
    LogLevel, NewAuditLog,
};
use crate::error::AppError;
use crate::jobs::{JobContext, JobError, JobHandler, JobQueue, CREATE_DEPLOYMENT_QUEUE};

/// Per-request build switches.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployOptions {
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub force_without_cache: bool,
    #[serde(default)]
    pub target_commit: Option<String>,
}

/// Payload of a `create-deployment` job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeploymentJob {
    pub deployment_id: String,
    pub application_id: String,
    #[serde(default)]
    pub options: DeployOptions,
}

/// Serialization key: one deployment job per application at a time.
#[must_use]
pub fn deployment_job_key(application_id: &str) -> String {
    format!("deploy:{application_id}")
}

#[derive(Clone)]
pub struct DeploymentService {
    db: DbClient,
    jobs: JobQueue,
    engine: Arc<DeploymentEngine>,
}

impl DeploymentService {
    #[must_use]
    pub fn new(db: DbClient, jobs: JobQueue, engine: Arc<DeploymentEngine>) -> Self {
        Self { db, jobs, engine }
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<DeploymentEngine> {
        &self.engine
    }

    /// Creates a `queued` deployment and enqueues the job that runs it.
    ///
    /// # Errors
    /// Returns an error if the deployment or its job cannot be stored.
    pub async fn queue(
        &self,
        application: &ApplicationRecord,
        trigger: DeploymentTrigger,
        rollback_of: Option<&str>,
        options: DeployOptions,
    ) -> Result<DeploymentRecord, AppError> {
        let deployment = self
            .db
            .create_deployment(&application.id, trigger, rollback_of)
            .await?;
        let payload = DeploymentJob {
            deployment_id: deployment.id.clone(),
            application_id: application.id.clone(),
            options,
        };

        let enqueued = self
            .jobs
            .enqueue(
                CREATE_DEPLOYMENT_QUEUE,
                &deployment_job_key(&application.id),
                Some(deployment.id.clone()),
                serde_json::to_value(&payload).map_err(anyhow::Error::from)?,
            )
            .await;
        if let Err(error) = enqueued {
            warn!(deployment_id = %deployment.id, error = %format!("{error:#}"), "failed to enqueue deployment");
            self.fail_unstarted(&deployment, "could not be queued").await?;
            return Err(AppError::TransientInfrastructure("deployment queue unavailable".to_string()));
        }

        info!(deployment_id = %deployment.id, application_id = %application.id, %trigger, "deployment queued");
        Ok(deployment)
    }

    /// Queues a rollback to `target`, or to the most recent deployment that
    /// served traffic before the current one.
    ///
    /// # Errors
    /// `NotFound` when there is nothing to roll back to.
    pub async fn rollback(
        &self,
        application: &ApplicationRecord,
        target: Option<&str>,
    ) -> Result<DeploymentRecord, AppError> {
        let target = match target {
            Some(target_id) => self
                .db
                .get_deployment(target_id)
                .await?
                .filter(|deployment| deployment.application_id == application.id)
                .ok_or_else(|| AppError::not_found(format!("deployment {target_id} not found")))?,
            None => self
                .db
                .find_rollback_target(&application.id, application.current_deployment_id.as_deref())
                .await?
                .ok_or_else(|| AppError::not_found("no earlier deployment to roll back to"))?,
        };
        if target.container_image.is_none() {
            return Err(AppError::validation(format!(
                "deployment {} never produced an image",
                target.id
            )));
        }
        if application.current_deployment_id.as_deref() == Some(target.id.as_str()) {
            return Err(AppError::conflict("that deployment is already serving"));
        }

        self.queue(
            application,
            DeploymentTrigger::Rollback,
            Some(&target.id),
            DeployOptions::default(),
        )
        .await
    }

    /// # Errors
    /// `Conflict` when the application has no serving deployment.
    pub async fn restart(&self, application: &ApplicationRecord) -> Result<DeploymentRecord, AppError> {
        if application.current_deployment_id.is_none() {
            return Err(AppError::conflict("application has no running deployment"));
        }
        self.queue(application, DeploymentTrigger::Restart, None, DeployOptions::default())
            .await
    }

    /// Cancels a deployment. A queued one fails immediately; a running one
    /// is interrupted at its next step and cleaned up by the engine.
    ///
    /// # Errors
    /// `NotFound` for unknown deployments, `Conflict` for finished ones.
    pub async fn cancel(&self, deployment_id: &str) -> Result<DeploymentRecord, AppError> {
        let deployment = self
            .db
            .get_deployment(deployment_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("deployment {deployment_id} not found")))?;
        if deployment.status.is_terminal() {
            return Err(AppError::conflict(format!("deployment is already {}", deployment.status)));
        }

        match self.jobs.cancel(deployment_id).await? {
            Some(JobStatus::Running) => {
                info!(%deployment_id, "cancel requested for running deployment");
                Ok(deployment)
            }
            _ if deployment.status == DeploymentStatus::Queued => {
                self.fail_unstarted(&deployment, "was cancelled before it started")
                    .await
            }
            _ => Err(AppError::conflict("deployment is not running")),
        }
    }

    /// Soft-deletes an application, cancels its jobs and removes every
    /// resource it owns.
    ///
    /// # Errors
    /// `NotFound` when the application does not exist in the organization.
    pub async fn delete_application(
        &self,
        application: &ApplicationRecord,
        audit: &NewAuditLog,
    ) -> Result<(), AppError> {
        let deleted = self
            .db
            .soft_delete_application(&application.organization_id, &application.id, audit)
            .await?;
        if !deleted {
            return Err(AppError::not_found(format!("application {} not found", application.id)));
        }

        let cancelled = self.jobs.cancel_key(&deployment_job_key(&application.id)).await?;
        if !cancelled.is_empty() {
            info!(application_id = %application.id, jobs = cancelled.len(), "cancelled jobs of deleted application");
        }
        for deployment_id in &cancelled {
            if let Some(deployment) = self.db.get_deployment(deployment_id).await? {
                if deployment.status == DeploymentStatus::Queued {
                    self.fail_unstarted(&deployment, "was cancelled because the application was deleted")
                        .await?;
                }
            }
        }

        self.engine.teardown(application).await;
        Ok(())
    }

    async fn fail_unstarted(
        &self,
        deployment: &DeploymentRecord,
        reason: &str,
    ) -> Result<DeploymentRecord, AppError> {
        self.db
            .append_deployment_log(
                &deployment.application_id,
                &deployment.id,
                LogLevel::Warn,
                &format!("deployment {reason}"),
            )
            .await?;
        let failed = self
            .db
            .transition_deployment(&deployment.id, DeploymentStatus::Failed)
            .await?;
        self.db
            .mark_deployment_failed_on_application(&deployment.application_id)
            .await?;
        Ok(failed)
    }
}

pub struct DeploymentJobHandler {
    engine: Arc<DeploymentEngine>,
}

impl DeploymentJobHandler {
    #[must_use]
    pub fn new(engine: Arc<DeploymentEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl JobHandler for DeploymentJobHandler {
    async fn handle(&self, context: &JobContext) -> Result<(), JobError> {
        let job: DeploymentJob = context.payload()?;
        let cancel = context.cancel_token();
        match self.engine.execute(&job.deployment_id, &job.options, &cancel).await {
            Ok(deployment) => {
                info!(deployment_id = %deployment.id, status = %deployment.status, "deployment finished");
                Ok(())
            }
            Err(DeployError::Cancelled) => Err(JobError::Cancelled),
            // The deployment row is failed by now, so a rerun would not help.
            Err(error) => Err(JobError::Terminal(error.to_string())),
        }
    }
}
