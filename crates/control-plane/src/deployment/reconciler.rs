//! Startup recovery: settles work a previous process left half done.

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::db::{DbClient, DeploymentStatus, LogLevel};
use crate::proxy::ProxyManager;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub requeued_jobs: u64,
    pub failed_deployments: usize,
    pub routes: usize,
}

/// Requeues jobs whose worker died, fails deployments no job will ever
/// finish, and rebuilds the proxy table from the serving deployments.
///
/// # Errors
/// Returns an error if the store cannot be read or the proxy rejects the
/// rebuilt table.
pub async fn reconcile_on_startup(db: &DbClient, proxy: &ProxyManager) -> Result<ReconcileReport> {
    let mut report = ReconcileReport {
        requeued_jobs: db.requeue_expired_leases().await?,
        ..ReconcileReport::default()
    };

    for deployment in db.list_unfinished_deployments().await? {
        if db.has_unfinished_job(&deployment.id).await? {
            continue;
        }
        db.append_deployment_log(
            &deployment.application_id,
            &deployment.id,
            LogLevel::Error,
            &format!("deployment was interrupted while {} and has no job left to finish it", deployment.status),
        )
        .await?;
        match db.transition_deployment(&deployment.id, DeploymentStatus::Failed).await {
            Ok(_) => {
                db.mark_deployment_failed_on_application(&deployment.application_id)
                    .await?;
                report.failed_deployments += 1;
            }
            Err(error) => {
                warn!(deployment_id = %deployment.id, error = %format!("{error:#}"), "cannot fail orphaned deployment");
            }
        }
    }

    let routes = db.list_serving_routes().await?;
    report.routes = routes.len();
    proxy
        .reconcile(&routes)
        .await
        .context("failed to rebuild proxy routes")?;

    info!(
        requeued_jobs = report.requeued_jobs,
        failed_deployments = report.failed_deployments,
        routes = report.routes,
        "startup reconciliation finished"
    );
    Ok(report)
}
