use tracing::{info, warn};

use super::{build, naming, remove_container, DeploymentEngine};
use crate::db::{ApplicationRecord, BuildPack};
use crate::docker::cli::{self as docker_cli, ComposeAction};
use crate::docker::{label_filter, DockerError, LABEL_APPLICATION_ID};
use crate::host::{shell_quote, SHORT_COMMAND_TIMEOUT};
use crate::repository::staging_path;

impl DeploymentEngine {
    /// Removes everything a deleted application owned: its routes,
    /// containers, compose project, dev service and checkout.
    ///
    /// Each step is attempted even when an earlier one fails; failures are
    /// logged and the rest still run.
    pub async fn teardown(&self, application: &ApplicationRecord) {
        let application_id = application.id.as_str();

        if let Err(error) = self.ports.proxy.remove_owner(application_id).await {
            warn!(%application_id, %error, "failed to remove proxy routes");
        }

        let containers = match self.ports.runtime.containers_for(&application.organization_id).await {
            Ok(containers) => Some(containers),
            Err(error) => {
                warn!(%application_id, %error, "container runtime unavailable during teardown");
                None
            }
        };
        if let Some(containers) = &containers {
            match containers
                .list_containers(&label_filter(LABEL_APPLICATION_ID, application_id))
                .await
            {
                Ok(owned) => {
                    for container in owned {
                        remove_container(containers.as_ref(), &container.name).await;
                    }
                }
                Err(error) => warn!(%application_id, %error, "failed to list application containers"),
            }

            match containers.remove_service(&naming::dev_service_name(application_id)).await {
                Ok(()) | Err(DockerError::NotFound(_)) => {}
                Err(error) => warn!(%application_id, %error, "failed to remove dev service"),
            }
        }

        let host = match self.ports.hosts.host_for(&application.organization_id).await {
            Ok(host) => host,
            Err(error) => {
                warn!(%application_id, %error, "host unavailable during teardown");
                return;
            }
        };

        let checkout_dir = staging_path(
            &self.settings.staging_root,
            &application.user_id,
            application.environment,
            application_id,
            None,
        );
        if application.build_pack == BuildPack::Compose {
            let context_dir = staging_path(
                &self.settings.staging_root,
                &application.user_id,
                application.environment,
                application_id,
                application.base_path.as_deref(),
            );
            let plan = build::BuildPlan::for_application(
                application,
                context_dir,
                String::new(),
                naming::compose_project(&application.name, application_id),
            );
            let request = plan.compose_request(application.environment_variables.0.clone());
            match docker_cli::compose(host.as_ref(), &request, ComposeAction::Down, SHORT_COMMAND_TIMEOUT).await {
                Ok(output) if output.success() => {}
                Ok(output) => warn!(%application_id, stderr = %output.stderr, "compose down failed"),
                Err(error) => warn!(%application_id, %error, "compose down failed"),
            }
        }

        let command = format!("rm -rf {}", shell_quote(&checkout_dir));
        match host.execute(&command, SHORT_COMMAND_TIMEOUT).await {
            Ok(output) if output.success() => {}
            Ok(output) => warn!(%application_id, stderr = %output.stderr, "failed to remove checkout"),
            Err(error) => warn!(%application_id, %error, "failed to remove checkout"),
        }

        info!(%application_id, "application resources removed");
    }
}
