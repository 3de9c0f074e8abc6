//! The deployment engine: one deployment row driven from `queued` to a
//! terminal state.
//!
//! Every state change is persisted before the work it names starts. A failed
//! attempt removes whatever it created and leaves the previously serving
//! deployment routed. Engine work for one application is serialized by the
//! job queue key, so the engine itself holds no per-application locks.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ControlPlaneConfig;
use crate::crypto::SecretBox;
use crate::db::{
    ApplicationRecord, BuildPack, DbClient, DeploymentArtifacts, DeploymentRecord,
    DeploymentStatus, DeploymentTrigger, HealthcheckKind, LogLevel,
};
use crate::docker::cli::{self as docker_cli, ComposeAction};
use crate::docker::{
    label_filter, ContainerPort, ContainerRuntime, ContainerSpec, DockerError,
    LABEL_APPLICATION_ID, LABEL_APPLICATION_NAME, LABEL_DEPLOYMENT_ID, LABEL_ENVIRONMENT,
    LABEL_ORGANIZATION_ID,
};
use crate::error::sanitize_output;
use crate::healthcheck::{http_url, Prober};
use crate::host::{shell_quote, with_server_timeout, Host, HostError, HostProvider, DEFAULT_COMMAND_TIMEOUT};
use crate::jobs::backoff_delay;
use crate::proxy::{ProxyError, ProxyManager, Upstream};
use crate::repository::{staging_path, FetchRequest, FetchedSource, InstallationCredential, RepoError, SourceFetcher};
use crate::telemetry;

pub mod build;
pub mod naming;
pub mod reconciler;
pub mod service;
mod teardown;


pub use service::{DeployOptions, DeploymentJob, DeploymentJobHandler, DeploymentService};

const REQUIRED_HEALTHY_PROBES: u32 = 2;
const BUILD_LOG_LINES: usize = 40;
const MAX_CLONE_BACKOFF: Duration = Duration::from_secs(30);
const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error(transparent)]
    Source(#[from] RepoError),
    #[error("build failed: {0}")]
    Build(String),
    #[error("container failed: {0}")]
    Runtime(String),
    #[error(transparent)]
    Docker(#[from] DockerError),
    #[error(transparent)]
    Host(#[from] HostError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error("no healthy response within {0:?}")]
    Unhealthy(Duration),
    #[error("{0}")]
    Invalid(String),
    #[error("deployment cancelled")]
    Cancelled,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub staging_root: String,
    pub upstream_network: Option<String>,
    pub build_timeout: Duration,
    pub health_timeout: Duration,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    /// How long a superseded container keeps running after the switch.
    pub drain_delay: Duration,
    pub clone_attempts: u32,
    pub clone_backoff: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            staging_root: "/etc/nixopus/configs/deployments".to_string(),
            upstream_network: None,
            build_timeout: DEFAULT_COMMAND_TIMEOUT,
            health_timeout: Duration::from_secs(90),
            probe_interval: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(5),
            drain_delay: Duration::from_secs(10),
            clone_attempts: 3,
            clone_backoff: Duration::from_secs(2),
        }
    }
}

impl EngineSettings {
    #[must_use]
    pub fn from_config(config: &ControlPlaneConfig) -> Self {
        Self {
            staging_root: config.staging_root(),
            upstream_network: Some(config.upstream_network()),
            ..Self::default()
        }
    }
}

/// The capabilities the engine drives.
#[derive(Clone)]
pub struct EnginePorts {
    pub hosts: Arc<dyn HostProvider>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub proxy: Arc<ProxyManager>,
    pub fetcher: Arc<dyn SourceFetcher>,
    pub prober: Arc<dyn Prober>,
}

/// Labels every engine-created container carries. User labels cannot
/// override the reserved ones.
#[must_use]
pub fn deployment_labels(application: &ApplicationRecord, deployment_id: &str) -> BTreeMap<String, String> {
    let mut labels = application.labels.0.clone();
    labels.insert(LABEL_APPLICATION_ID.to_string(), application.id.clone());
    labels.insert(LABEL_APPLICATION_NAME.to_string(), application.name.clone());
    labels.insert(LABEL_DEPLOYMENT_ID.to_string(), deployment_id.to_string());
    labels.insert(LABEL_ENVIRONMENT.to_string(), application.environment.as_str().to_string());
    labels.insert(LABEL_ORGANIZATION_ID.to_string(), application.organization_id.clone());
    labels
}

/// Runtime environment: the application's variables plus the injected ones.
#[must_use]
pub fn runtime_env(application: &ApplicationRecord, deployment_id: &str) -> BTreeMap<String, String> {
    let mut env = application.environment_variables.0.clone();
    env.insert("PORT".to_string(), application.port().to_string());
    env.insert("NIXOPUS_APPLICATION_ID".to_string(), application.id.clone());
    env.insert("NIXOPUS_DEPLOYMENT_ID".to_string(), deployment_id.to_string());
    env
}

async fn cancellable<T, E>(
    cancel: &CancellationToken,
    future: impl Future<Output = Result<T, E>>,
) -> Result<T, DeployError>
where
    DeployError: From<E>,
{
    tokio::select! {
        () = cancel.cancelled() => Err(DeployError::Cancelled),
        result = future => result.map_err(DeployError::from),
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), DeployError> {
    if cancel.is_cancelled() {
        Err(DeployError::Cancelled)
    } else {
        Ok(())
    }
}

/// Bookkeeping for one run: what it has created and must undo on failure.
struct Attempt {
    deployment_id: String,
    application_id: String,
    status: DeploymentStatus,
    host: Option<Arc<dyn Host>>,
    containers: Option<Arc<dyn ContainerPort>>,
    created_container: Option<String>,
    /// An existing container this attempt started; stopped again on failure.
    started_container: Option<String>,
    staging_dir: Option<String>,
    secrets: Vec<String>,
}

impl Attempt {
    fn new(deployment: &DeploymentRecord) -> Self {
        Self {
            deployment_id: deployment.id.clone(),
            application_id: deployment.application_id.clone(),
            status: deployment.status,
            host: None,
            containers: None,
            created_container: None,
            started_container: None,
            staging_dir: None,
            secrets: Vec::new(),
        }
    }

    fn secret_refs(&self) -> Vec<&str> {
        self.secrets.iter().map(String::as_str).collect()
    }
}

pub struct DeploymentEngine {
    db: DbClient,
    ports: EnginePorts,
    secrets: SecretBox,
    settings: EngineSettings,
    /// Superseded containers waiting out the drain delay.
    retirements: Mutex<Vec<JoinHandle<()>>>,
    /// Cuts the drain delay short at shutdown.
    retire_now: CancellationToken,
}

impl DeploymentEngine {
    #[must_use]
    pub fn new(db: DbClient, ports: EnginePorts, secrets: SecretBox, settings: EngineSettings) -> Self {
        Self {
            db,
            ports,
            secrets,
            settings,
            retirements: Mutex::new(Vec::new()),
            retire_now: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn db(&self) -> &DbClient {
        &self.db
    }

    #[must_use]
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    #[must_use]
    pub fn proxy(&self) -> &Arc<ProxyManager> {
        &self.ports.proxy
    }

    /// Runs a queued deployment to a terminal state. A deployment that
    /// already finished is returned unchanged.
    ///
    /// # Errors
    /// Returns why the deployment failed; the row is `failed` by then.
    pub async fn execute(
        &self,
        deployment_id: &str,
        options: &DeployOptions,
        cancel: &CancellationToken,
    ) -> Result<DeploymentRecord, DeployError> {
        let Some(deployment) = self.db.get_deployment(deployment_id).await? else {
            return Err(DeployError::Invalid(format!("deployment {deployment_id} does not exist")));
        };
        if deployment.status.is_terminal() {
            return Ok(deployment);
        }

        let mut attempt = Attempt::new(&deployment);
        let result = self.run(&mut attempt, &deployment, options, cancel).await;
        match result {
            Ok(record) => {
                telemetry::deployment_finished(record.status.as_str());
                Ok(record)
            }
            Err(error) => {
                self.fail(&mut attempt, &error).await;
                Err(error)
            }
        }
    }

    async fn run(
        &self,
        attempt: &mut Attempt,
        deployment: &DeploymentRecord,
        options: &DeployOptions,
        cancel: &CancellationToken,
    ) -> Result<DeploymentRecord, DeployError> {
        if deployment.status != DeploymentStatus::Queued {
            return Err(DeployError::Invalid(format!(
                "deployment was interrupted while {}; start a new one",
                deployment.status
            )));
        }
        let Some(application) = self.db.get_application(&deployment.application_id).await? else {
            return Err(DeployError::Invalid("application was deleted".to_string()));
        };
        attempt.secrets = application
            .build_variables
            .values()
            .chain(application.environment_variables.values())
            .filter(|value| value.len() >= 4)
            .cloned()
            .collect();

        match deployment.trigger {
            DeploymentTrigger::Create | DeploymentTrigger::Redeploy => {
                self.deploy(attempt, &application, options, cancel).await
            }
            DeploymentTrigger::Rollback => self.rollback(attempt, &application, deployment, cancel).await,
            DeploymentTrigger::Restart => self.restart(attempt, &application, cancel).await,
        }
    }

    async fn log(&self, attempt: &Attempt, level: LogLevel, message: &str) {
        let message = sanitize_output(message, &attempt.secret_refs());
        match level {
            LogLevel::Error | LogLevel::Warn => {
                warn!(deployment_id = %attempt.deployment_id, %message, "deployment");
            }
            LogLevel::Info | LogLevel::Debug => {
                info!(deployment_id = %attempt.deployment_id, %message, "deployment");
            }
        }
        if let Err(error) = self
            .db
            .append_deployment_log(&attempt.application_id, &attempt.deployment_id, level, &message)
            .await
        {
            warn!(deployment_id = %attempt.deployment_id, error = %format!("{error:#}"), "failed to store deployment log");
        }
    }

    async fn advance(&self, attempt: &mut Attempt, next: DeploymentStatus) -> Result<(), DeployError> {
        self.db.transition_deployment(&attempt.deployment_id, next).await?;
        attempt.status = next;
        self.log(attempt, LogLevel::Info, &format!("deployment is {next}")).await;
        Ok(())
    }

    async fn tenant_ports(
        &self,
        attempt: &mut Attempt,
        organization_id: &str,
    ) -> Result<(Arc<dyn Host>, Arc<dyn ContainerPort>), DeployError> {
        let host = self.ports.hosts.host_for(organization_id).await?;
        let containers = self.ports.runtime.containers_for(organization_id).await?;
        attempt.host = Some(host.clone());
        attempt.containers = Some(containers.clone());
        Ok((host, containers))
    }

    async fn deploy(
        &self,
        attempt: &mut Attempt,
        application: &ApplicationRecord,
        options: &DeployOptions,
        cancel: &CancellationToken,
    ) -> Result<DeploymentRecord, DeployError> {
        let Some(organization) = self.db.get_organization(&application.organization_id).await? else {
            return Err(DeployError::Invalid("organization was deleted".to_string()));
        };
        let (host, containers) = self.tenant_ports(attempt, &application.organization_id).await?;

        self.advance(attempt, DeploymentStatus::Cloning).await?;
        let checkout_dir = staging_path(
            &self.settings.staging_root,
            &application.user_id,
            application.environment,
            &application.id,
            None,
        );
        let context_dir = staging_path(
            &self.settings.staging_root,
            &application.user_id,
            application.environment,
            &application.id,
            application.base_path.as_deref(),
        );
        attempt.staging_dir = Some(checkout_dir.clone());

        let credential = match self.db.get_repo_credential(&application.organization_id).await? {
            Some(record) => Some(InstallationCredential::from_record(&record, &self.secrets)?),
            None => None,
        };
        let request = FetchRequest {
            repository: application.repository.clone(),
            branch: application.branch.clone(),
            target_commit: options.target_commit.clone(),
            checkout_dir,
            credential,
        };
        let source = self.fetch_with_retry(attempt, host.as_ref(), &request, cancel).await?;
        let short = naming::short_commit(&source.commit_hash);
        self.log(attempt, LogLevel::Info, &format!("checked out {} at {short}", application.branch))
            .await;
        self.db
            .record_deployment_artifacts(
                &attempt.deployment_id,
                &DeploymentArtifacts {
                    commit_hash: Some(source.commit_hash.clone()),
                    ..DeploymentArtifacts::default()
                },
            )
            .await?;

        checkpoint(cancel)?;
        self.advance(attempt, DeploymentStatus::Building).await?;
        let image = naming::image_tag(&organization.slug, &application.name, &source.commit_hash);
        let compose_project = naming::compose_project(&application.name, &application.id);
        let is_compose = application.build_pack == BuildPack::Compose;
        let reuse_image = !options.force
            && !options.force_without_cache
            && !is_compose
            && cancellable(cancel, containers.image_exists(&image)).await?;

        if reuse_image {
            self.log(attempt, LogLevel::Info, &format!("image {image} already built; skipping build"))
                .await;
        } else {
            self.run_pre_build(attempt, host.as_ref(), application, &context_dir, cancel)
                .await?;
            let mut plan = build::BuildPlan::for_application(
                application,
                context_dir.clone(),
                image.clone(),
                compose_project.clone(),
            );
            plan.no_cache = options.force_without_cache;
            plan.labels = deployment_labels(application, &attempt.deployment_id);
            if !plan.no_cache {
                plan.cache_from = self.serving_image(application).await?;
            }
            self.log(attempt, LogLevel::Info, &format!("building {image} with {}", application.build_pack))
                .await;
            let output = cancellable(
                cancel,
                build::run_build(host.as_ref(), &plan, self.settings.build_timeout),
            )
            .await?;
            let tail = build::output_tail(&output.combined(), BUILD_LOG_LINES);
            if !output.success() {
                self.log(attempt, LogLevel::Error, &tail).await;
                return Err(DeployError::Build(format!("build exited with {}", output.exit_code)));
            }
            if !tail.is_empty() {
                self.log(attempt, LogLevel::Debug, &tail).await;
            }
        }

        checkpoint(cancel)?;
        self.advance(attempt, DeploymentStatus::Starting).await?;
        let container_name = if is_compose {
            self.start_compose(attempt, host.as_ref(), containers.as_ref(), application, &context_dir, &compose_project, cancel)
                .await?
        } else {
            let name = naming::container_name(&application.name, &source.commit_hash, &attempt.deployment_id);
            self.start_container(attempt, containers.as_ref(), application, &name, &image, cancel)
                .await?;
            name
        };

        checkpoint(cancel)?;
        self.advance(attempt, DeploymentStatus::HealthCheck).await?;
        self.wait_healthy(attempt, application, &container_name, cancel).await?;

        checkpoint(cancel)?;
        self.go_live(attempt, application, containers, &container_name, DeploymentStatus::Live)
            .await
    }

    async fn fetch_with_retry(
        &self,
        attempt: &Attempt,
        host: &dyn Host,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<FetchedSource, DeployError> {
        let mut attempt_number = 1;
        loop {
            match cancellable(cancel, self.ports.fetcher.fetch(host, request)).await {
                Err(DeployError::Source(error))
                    if error.is_retryable() && attempt_number < self.settings.clone_attempts =>
                {
                    let delay = backoff_delay(attempt_number, self.settings.clone_backoff, MAX_CLONE_BACKOFF);
                    self.log(
                        attempt,
                        LogLevel::Warn,
                        &format!(
                            "fetch attempt {attempt_number}/{} failed: {error}; retrying in {}s",
                            self.settings.clone_attempts,
                            delay.as_secs()
                        ),
                    )
                    .await;
                    tokio::select! {
                        () = cancel.cancelled() => return Err(DeployError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                    attempt_number += 1;
                }
                result => return result,
            }
        }
    }

    async fn run_pre_build(
        &self,
        attempt: &Attempt,
        host: &dyn Host,
        application: &ApplicationRecord,
        context_dir: &str,
        cancel: &CancellationToken,
    ) -> Result<(), DeployError> {
        let command = application.pre_run_command.trim();
        if command.is_empty() {
            return Ok(());
        }
        self.log(attempt, LogLevel::Info, &format!("running pre-run command: {command}"))
            .await;
        let script = format!("cd {} && {command}", shell_quote(context_dir));
        let output = cancellable(
            cancel,
            host.execute(&with_server_timeout(&script, self.settings.build_timeout), self.settings.build_timeout),
        )
        .await?;
        if !output.success() {
            self.log(attempt, LogLevel::Error, &build::output_tail(&output.combined(), BUILD_LOG_LINES))
                .await;
            return Err(DeployError::Build(format!("pre-run command exited with {}", output.exit_code)));
        }
        Ok(())
    }

    async fn serving_image(&self, application: &ApplicationRecord) -> Result<Option<String>, DeployError> {
        let Some(current) = application.current_deployment_id.as_deref() else {
            return Ok(None);
        };
        Ok(self
            .db
            .get_deployment(current)
            .await?
            .and_then(|deployment| deployment.container_image))
    }

    fn container_spec(
        &self,
        application: &ApplicationRecord,
        deployment_id: &str,
        name: &str,
        image: &str,
    ) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: image.to_string(),
            env: runtime_env(application, deployment_id),
            labels: deployment_labels(application, deployment_id),
            network: self.settings.upstream_network.clone(),
            exposed_port: Some(application.port()),
            ..ContainerSpec::default()
        }
    }

    async fn start_container(
        &self,
        attempt: &mut Attempt,
        containers: &dyn ContainerPort,
        application: &ApplicationRecord,
        name: &str,
        image: &str,
        cancel: &CancellationToken,
    ) -> Result<String, DeployError> {
        let spec = self.container_spec(application, &attempt.deployment_id, name, image);
        let container_id = cancellable(cancel, containers.create_container(&spec)).await?;
        attempt.created_container = Some(name.to_string());
        self.db
            .record_deployment_artifacts(
                &attempt.deployment_id,
                &DeploymentArtifacts {
                    container_id: Some(container_id.clone()),
                    container_name: Some(name.to_string()),
                    container_image: Some(image.to_string()),
                    ..DeploymentArtifacts::default()
                },
            )
            .await?;
        cancellable(cancel, containers.start_container(name)).await?;
        self.log(attempt, LogLevel::Info, &format!("started container {name}"))
            .await;

        let command = application.post_run_command.trim();
        if !command.is_empty() {
            self.log(attempt, LogLevel::Info, &format!("running post-run command: {command}"))
                .await;
            let exec = vec!["sh".to_string(), "-c".to_string(), command.to_string()];
            let output = match cancellable(cancel, containers.exec(name, &exec)).await {
                Ok(output) => output,
                Err(DeployError::Docker(error)) => {
                    return Err(DeployError::Runtime(format!("post-run command failed: {error}")));
                }
                Err(error) => return Err(error),
            };
            if !output.trim().is_empty() {
                self.log(attempt, LogLevel::Debug, &build::output_tail(&output, BUILD_LOG_LINES))
                    .await;
            }
        }
        Ok(container_id)
    }

    #[allow(clippy::too_many_arguments)]
    async fn start_compose(
        &self,
        attempt: &mut Attempt,
        host: &dyn Host,
        containers: &dyn ContainerPort,
        application: &ApplicationRecord,
        context_dir: &str,
        project: &str,
        cancel: &CancellationToken,
    ) -> Result<String, DeployError> {
        let plan = build::BuildPlan::for_application(
            application,
            context_dir.to_string(),
            String::new(),
            project.to_string(),
        );
        let request = plan.compose_request(runtime_env(application, &attempt.deployment_id));
        let output = cancellable(
            cancel,
            docker_cli::compose(host, &request, ComposeAction::Up, self.settings.build_timeout),
        )
        .await?;
        if !output.success() {
            self.log(attempt, LogLevel::Error, &build::output_tail(&output.combined(), BUILD_LOG_LINES))
                .await;
            return Err(DeployError::Runtime(format!("compose up exited with {}", output.exit_code)));
        }

        let started = cancellable(cancel, containers.list_containers(&label_filter(COMPOSE_PROJECT_LABEL, project)))
            .await?;
        let service = naming::slugify(&application.name).unwrap_or_default();
        let Some(container) = started
            .iter()
            .find(|container| container.labels.get(COMPOSE_SERVICE_LABEL) == Some(&service))
            .or_else(|| started.first())
        else {
            return Err(DeployError::Runtime(format!("compose project {project} started no containers")));
        };

        self.db
            .record_deployment_artifacts(
                &attempt.deployment_id,
                &DeploymentArtifacts {
                    container_id: Some(container.id.clone()),
                    container_name: Some(container.name.clone()),
                    container_image: Some(container.image.clone()),
                    ..DeploymentArtifacts::default()
                },
            )
            .await?;
        self.log(attempt, LogLevel::Info, &format!("compose project {project} is up; routing to {}", container.name))
            .await;
        Ok(container.name.clone())
    }

    async fn health_target(
        &self,
        application: &ApplicationRecord,
        container_name: &str,
    ) -> Result<(HealthcheckKind, String), DeployError> {
        let base = format!("{container_name}:{}", application.port());
        let configured = self
            .db
            .list_healthchecks(&application.organization_id)
            .await?
            .into_iter()
            .find(|check| check.application_id == application.id && check.enabled);

        Ok(match configured {
            Some(check) if check.kind == HealthcheckKind::Tcp => (HealthcheckKind::Tcp, base),
            Some(check) => {
                let path = reqwest::Url::parse(&http_url(&check.target))
                    .map(|url| url.path().to_string())
                    .unwrap_or_else(|_| "/".to_string());
                (HealthcheckKind::Http, format!("http://{base}{path}"))
            }
            None => (HealthcheckKind::Http, format!("http://{base}/")),
        })
    }

    async fn wait_healthy(
        &self,
        attempt: &Attempt,
        application: &ApplicationRecord,
        container_name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), DeployError> {
        let (kind, target) = self.health_target(application, container_name).await?;
        self.log(attempt, LogLevel::Info, &format!("waiting for {target} to become healthy"))
            .await;

        let started = Instant::now();
        let mut consecutive = 0;
        let mut last_detail = String::new();
        loop {
            checkpoint(cancel)?;
            let outcome = self
                .ports
                .prober
                .probe(kind, &target, self.settings.probe_timeout)
                .await;
            if outcome.ok {
                consecutive += 1;
                if consecutive >= REQUIRED_HEALTHY_PROBES {
                    self.log(attempt, LogLevel::Info, "health check passed").await;
                    return Ok(());
                }
            } else {
                consecutive = 0;
                last_detail = outcome.detail;
            }

            if started.elapsed() >= self.settings.health_timeout {
                if !last_detail.is_empty() {
                    self.log(attempt, LogLevel::Warn, &format!("last probe: {last_detail}"))
                        .await;
                }
                return Err(DeployError::Unhealthy(self.settings.health_timeout));
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(DeployError::Cancelled),
                () = tokio::time::sleep(self.settings.probe_interval) => {}
            }
        }
    }

    /// Points the proxy at `container_name`, then swaps the serving
    /// deployment in one transaction and retires the previous container.
    async fn go_live(
        &self,
        attempt: &mut Attempt,
        application: &ApplicationRecord,
        containers: Arc<dyn ContainerPort>,
        container_name: &str,
        status: DeploymentStatus,
    ) -> Result<DeploymentRecord, DeployError> {
        let domain = application.domain.as_deref().filter(|domain| !domain.trim().is_empty());
        if let Some(domain) = domain {
            self.ports
                .proxy
                .add(domain, Upstream::new(container_name, application.port()), &application.id)
                .await?;
            self.log(attempt, LogLevel::Info, &format!("routing {domain} to {container_name}"))
                .await;
        }

        let previous = match self
            .db
            .promote_deployment(&application.id, &attempt.deployment_id, status)
            .await
        {
            Ok(previous) => previous,
            Err(error) => {
                if domain.is_some() {
                    self.restore_route(application).await;
                }
                return Err(error.into());
            }
        };
        attempt.status = status;
        attempt.created_container = None;
        attempt.started_container = None;
        self.log(attempt, LogLevel::Info, &format!("deployment is {status}")).await;

        if let Err(error) = self.ports.proxy.prune_owner(&application.id, domain).await {
            warn!(application_id = %application.id, %error, "failed to drop stale proxy routes");
        }

        if let Some(previous_name) = previous.and_then(|previous| previous.container_name) {
            if previous_name != container_name {
                self.retire_container(containers, previous_name).await;
            }
        }

        let Some(record) = self.db.get_deployment(&attempt.deployment_id).await? else {
            return Err(DeployError::Invalid("deployment disappeared".to_string()));
        };
        Ok(record)
    }

    /// Puts the route back on whatever the store says is serving.
    async fn restore_route(&self, application: &ApplicationRecord) {
        let Some(domain) = application.domain.as_deref() else {
            return;
        };
        let serving = match self.db.list_serving_routes().await {
            Ok(routes) => routes.into_iter().find(|route| route.application_id == application.id),
            Err(error) => {
                warn!(application_id = %application.id, error = %format!("{error:#}"), "cannot restore proxy route");
                return;
            }
        };
        let result = match serving {
            Some(route) => {
                self.ports
                    .proxy
                    .add(domain, Upstream::new(route.container_name, route.port), &application.id)
                    .await
            }
            None => self.ports.proxy.remove(domain).await,
        };
        if let Err(error) = result {
            warn!(application_id = %application.id, %error, "cannot restore proxy route");
        }
    }

    async fn retire_container(&self, containers: Arc<dyn ContainerPort>, name: String) {
        let delay = self.settings.drain_delay;
        let retire_now = self.retire_now.clone();
        let retire = async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = retire_now.cancelled() => {}
            }
            remove_container(containers.as_ref(), &name).await;
            info!(container = %name, "retired superseded container");
        };
        if delay.is_zero() {
            retire.await;
        } else {
            let mut pending = self.retirements.lock().await;
            pending.retain(|handle| !handle.is_finished());
            pending.push(tokio::spawn(retire));
        }
    }

    /// Removes every superseded container still waiting out its drain delay,
    /// without waiting for the delay. Returns `false` when `deadline` passed
    /// first.
    pub async fn finish_retirements(&self, deadline: Duration) -> bool {
        self.retire_now.cancel();
        let pending = std::mem::take(&mut *self.retirements.lock().await);
        if pending.is_empty() {
            return true;
        }
        info!(containers = pending.len(), "retiring superseded containers before exit");
        let all = futures_util::future::join_all(pending);
        tokio::time::timeout(deadline, all).await.is_ok()
    }

    /// Makes sure the container of a historical deployment runs, recreating
    /// it from its image when it was already removed.
    #[allow(clippy::too_many_arguments)]
    async fn ensure_running(
        &self,
        attempt: &mut Attempt,
        containers: &dyn ContainerPort,
        application: &ApplicationRecord,
        target: &DeploymentRecord,
        name: &str,
        image: &str,
        cancel: &CancellationToken,
    ) -> Result<String, DeployError> {
        match cancellable(cancel, containers.inspect_container(name)).await {
            Ok(container) if container.is_running() => Ok(container.id),
            Ok(container) => {
                cancellable(cancel, containers.start_container(name)).await?;
                attempt.started_container = Some(name.to_string());
                self.log(attempt, LogLevel::Info, &format!("started stopped container {name}"))
                    .await;
                Ok(container.id)
            }
            Err(DeployError::Docker(DockerError::NotFound(_))) => {
                let spec = self.container_spec(application, &target.id, name, image);
                let container_id = cancellable(cancel, containers.create_container(&spec)).await?;
                attempt.created_container = Some(name.to_string());
                cancellable(cancel, containers.start_container(name)).await?;
                self.log(attempt, LogLevel::Info, &format!("recreated container {name} from {image}"))
                    .await;
                Ok(container_id)
            }
            Err(error) => Err(error),
        }
    }

    async fn rollback(
        &self,
        attempt: &mut Attempt,
        application: &ApplicationRecord,
        deployment: &DeploymentRecord,
        cancel: &CancellationToken,
    ) -> Result<DeploymentRecord, DeployError> {
        let Some(target_id) = deployment.rollback_of.as_deref() else {
            return Err(DeployError::Invalid("rollback has no target deployment".to_string()));
        };
        let target = self
            .db
            .get_deployment(target_id)
            .await?
            .filter(|target| target.application_id == application.id);
        let Some(target) = target else {
            return Err(DeployError::Invalid(format!("rollback target {target_id} does not exist")));
        };
        let (Some(image), Some(name)) = (target.container_image.clone(), target.container_name.clone()) else {
            return Err(DeployError::Invalid(format!("deployment {target_id} never produced a container")));
        };

        let (_, containers) = self.tenant_ports(attempt, &application.organization_id).await?;
        self.advance(attempt, DeploymentStatus::Restarting).await?;
        self.log(attempt, LogLevel::Info, &format!("rolling back to deployment {target_id} ({image})"))
            .await;

        let container_id = self
            .ensure_running(attempt, containers.as_ref(), application, &target, &name, &image, cancel)
            .await?;
        self.db
            .record_deployment_artifacts(
                &attempt.deployment_id,
                &DeploymentArtifacts {
                    commit_hash: target.commit_hash.clone(),
                    container_id: Some(container_id),
                    container_name: Some(name.clone()),
                    container_image: Some(image),
                },
            )
            .await?;

        checkpoint(cancel)?;
        self.go_live(attempt, application, containers, &name, DeploymentStatus::RolledBack)
            .await
    }

    async fn restart(
        &self,
        attempt: &mut Attempt,
        application: &ApplicationRecord,
        cancel: &CancellationToken,
    ) -> Result<DeploymentRecord, DeployError> {
        let Some(current_id) = application.current_deployment_id.as_deref() else {
            return Err(DeployError::Invalid("application has no running deployment".to_string()));
        };
        let Some(current) = self.db.get_deployment(current_id).await? else {
            return Err(DeployError::Invalid(format!("deployment {current_id} does not exist")));
        };
        let (Some(image), Some(name)) = (current.container_image.clone(), current.container_name.clone()) else {
            return Err(DeployError::Invalid(format!("deployment {current_id} has no container")));
        };

        let (_, containers) = self.tenant_ports(attempt, &application.organization_id).await?;
        self.advance(attempt, DeploymentStatus::Restarting).await?;

        let container_id = match cancellable(cancel, containers.restart_container(&name)).await {
            Ok(()) => {
                self.log(attempt, LogLevel::Info, &format!("restarted container {name}"))
                    .await;
                cancellable(cancel, containers.inspect_container(&name)).await?.id
            }
            Err(DeployError::Docker(DockerError::NotFound(_))) => {
                self.ensure_running(attempt, containers.as_ref(), application, &current, &name, &image, cancel)
                    .await?
            }
            Err(error) => return Err(error),
        };
        self.db
            .record_deployment_artifacts(
                &attempt.deployment_id,
                &DeploymentArtifacts {
                    commit_hash: current.commit_hash.clone(),
                    container_id: Some(container_id),
                    container_name: Some(name.clone()),
                    container_image: Some(image),
                },
            )
            .await?;

        self.go_live(attempt, application, containers, &name, DeploymentStatus::Live)
            .await
    }

    /// Undoes what the attempt created and records the failure.
    async fn fail(&self, attempt: &mut Attempt, error: &DeployError) {
        let level = if matches!(error, DeployError::Cancelled) {
            LogLevel::Warn
        } else {
            LogLevel::Error
        };
        self.log(attempt, level, &format!("deployment failed: {error}")).await;

        if let (Some(name), Some(containers)) = (attempt.created_container.take(), attempt.containers.clone()) {
            remove_container(containers.as_ref(), &name).await;
            self.log(attempt, LogLevel::Info, &format!("removed container {name}"))
                .await;
        }
        if let (Some(name), Some(containers)) = (attempt.started_container.take(), attempt.containers.clone()) {
            match containers.stop_container(&name).await {
                Ok(()) | Err(DockerError::Conflict(_) | DockerError::NotFound(_)) => {
                    self.log(attempt, LogLevel::Info, &format!("stopped container {name}"))
                        .await;
                }
                Err(error) => warn!(container = %name, %error, "failed to stop container"),
            }
        }

        if matches!(error, DeployError::Cancelled) {
            if let (Some(dir), Some(host)) = (attempt.staging_dir.take(), attempt.host.clone()) {
                let command = format!("rm -rf {}", shell_quote(&dir));
                match host.execute(&command, crate::host::SHORT_COMMAND_TIMEOUT).await {
                    Ok(output) if output.success() => {}
                    Ok(output) => warn!(%dir, stderr = %output.stderr, "failed to clean staging directory"),
                    Err(error) => warn!(%dir, %error, "failed to clean staging directory"),
                }
            }
        }

        if attempt.status.can_transition_to(DeploymentStatus::Failed) {
            match self
                .db
                .transition_deployment(&attempt.deployment_id, DeploymentStatus::Failed)
                .await
            {
                Ok(_) => attempt.status = DeploymentStatus::Failed,
                Err(error) => {
                    warn!(deployment_id = %attempt.deployment_id, error = %format!("{error:#}"), "failed to mark deployment failed");
                }
            }
        }
        if let Err(error) = self
            .db
            .mark_deployment_failed_on_application(&attempt.application_id)
            .await
        {
            warn!(application_id = %attempt.application_id, error = %format!("{error:#}"), "failed to flag application");
        }
        telemetry::deployment_finished(DeploymentStatus::Failed.as_str());
    }
}

/// Stops then removes a container; a missing container counts as removed.
pub(crate) async fn remove_container(containers: &dyn ContainerPort, name: &str) {
    match containers.stop_container(name).await {
        Ok(()) | Err(DockerError::Conflict(_) | DockerError::NotFound(_)) => {}
        Err(error) => warn!(container = %name, %error, "failed to stop container"),
    }
    match containers.remove_container(name).await {
        Ok(()) | Err(DockerError::NotFound(_)) => {}
        Err(error) => warn!(container = %name, %error, "failed to remove container"),
    }
}
