//! Keeps one dev service per live-synced application running.
//!
//! File writes call [`DevServiceManager::ensure_started`] freely: a ready flag
//! answers without Docker calls once the service is up, checks within the
//! debounce window coalesce, a starting set admits one creator, and a
//! cooldown spaces out attempts after a failed creation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::db::{ApplicationRecord, DbClient};
use crate::deployment::naming::dev_service_name;
use crate::docker::{
    label_filter, ContainerPort, ContainerRuntime, DockerError, ServiceSpec, LABEL_APPLICATION_ID,
    LABEL_APPLICATION_NAME, LABEL_ENVIRONMENT, LABEL_ORGANIZATION_ID,
};
use crate::jobs::{JobContext, JobError, JobHandler, JobQueue, LIVE_DEV_QUEUE};
use crate::proxy::{ProxyManager, Upstream};
use crate::repository::staging_path;

pub const DEV_MOUNT_PATH: &str = "/app";

#[derive(Debug, thiserror::Error)]
pub enum DevServiceError {
    #[error(transparent)]
    Docker(#[from] DockerError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
    #[error("dev service not healthy within {0:?}")]
    Unhealthy(Duration),
    #[error("{0}")]
    Invalid(String),
    #[error("dev service start cancelled")]
    Cancelled,
}

#[derive(Clone, Debug)]
pub struct DevServiceSettings {
    pub staging_root: String,
    pub network: Option<String>,
    pub debounce: Duration,
    pub cooldown: Duration,
    pub alert_after_failures: u32,
    pub ready_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for DevServiceSettings {
    fn default() -> Self {
        Self {
            staging_root: "/etc/nixopus/configs/deployments".to_string(),
            network: None,
            debounce: Duration::from_secs(2),
            cooldown: Duration::from_secs(30),
            alert_after_failures: 3,
            ready_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnsureOutcome {
    Ready,
    Debounced,
    Starting,
    CoolingDown,
    /// A `live-dev` job was enqueued; `failures` counts the consecutive
    /// failed creations before it.
    Requested { failures: u32 },
}

/// Payload of a `live-dev` job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DevServiceJob {
    pub application_id: String,
}

#[must_use]
pub fn dev_job_key(application_id: &str) -> String {
    format!("dev:{application_id}")
}

/// Base image and command for a framework hint.
#[must_use]
pub fn dev_runtime(framework: Option<&str>) -> (&'static str, Vec<String>) {
    let shell = |script: &str| vec!["sh".to_string(), "-c".to_string(), script.to_string()];
    match framework.map(str::to_ascii_lowercase).as_deref() {
        Some("bun") => ("oven/bun:1", shell("bun install && bun run dev")),
        Some("python" | "django" | "flask" | "fastapi") => (
            "python:3.12-slim",
            shell("pip install -r requirements.txt && python main.py"),
        ),
        Some("go" | "golang") => ("golang:1.22-alpine", shell("go run .")),
        Some("rust") => ("rust:1-slim", shell("cargo run")),
        _ => ("node:20-alpine", shell("npm install && npm run dev")),
    }
}

struct FailureState {
    consecutive: u32,
    last: Instant,
}

pub struct DevServiceManager {
    db: DbClient,
    runtime: Arc<dyn ContainerRuntime>,
    proxy: Arc<ProxyManager>,
    jobs: JobQueue,
    settings: DevServiceSettings,
    ready: DashSet<String>,
    last_check: DashMap<String, Instant>,
    starting: DashSet<String>,
    failures: DashMap<String, FailureState>,
}

impl DevServiceManager {
    #[must_use]
    pub fn new(
        db: DbClient,
        runtime: Arc<dyn ContainerRuntime>,
        proxy: Arc<ProxyManager>,
        jobs: JobQueue,
        settings: DevServiceSettings,
    ) -> Self {
        Self {
            db,
            runtime,
            proxy,
            jobs,
            settings,
            ready: DashSet::new(),
            last_check: DashMap::new(),
            starting: DashSet::new(),
            failures: DashMap::new(),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &DevServiceSettings {
        &self.settings
    }

    #[must_use]
    pub fn is_ready(&self, application_id: &str) -> bool {
        self.ready.contains(application_id)
    }

    /// Drops all state for an application, e.g. after it is deleted.
    pub fn forget(&self, application_id: &str) {
        self.ready.remove(application_id);
        self.last_check.remove(application_id);
        self.starting.remove(application_id);
        self.failures.remove(application_id);
    }

    fn debounced(&self, application_id: &str) -> bool {
        let now = Instant::now();
        let mut debounced = false;
        self.last_check
            .entry(application_id.to_string())
            .and_modify(|last| {
                if now.duration_since(*last) < self.settings.debounce {
                    debounced = true;
                } else {
                    *last = now;
                }
            })
            .or_insert(now);
        debounced
    }

    fn cooling_down(&self, application_id: &str) -> bool {
        self.failures
            .get(application_id)
            .is_some_and(|failure| failure.last.elapsed() < self.settings.cooldown)
    }

    fn record_failure(&self, application_id: &str) -> u32 {
        let mut entry = self
            .failures
            .entry(application_id.to_string())
            .or_insert(FailureState {
                consecutive: 0,
                last: Instant::now(),
            });
        entry.consecutive += 1;
        entry.last = Instant::now();
        entry.consecutive
    }

    /// # Errors
    /// Returns an error if the daemon cannot be inspected or the job cannot
    /// be enqueued.
    pub async fn ensure_started(&self, application: &ApplicationRecord) -> Result<EnsureOutcome, DevServiceError> {
        if self.ready.contains(&application.id) {
            return Ok(EnsureOutcome::Ready);
        }
        if self.debounced(&application.id) {
            return Ok(EnsureOutcome::Debounced);
        }
        if self.starting.contains(&application.id) {
            return Ok(EnsureOutcome::Starting);
        }
        if self.cooling_down(&application.id) {
            return Ok(EnsureOutcome::CoolingDown);
        }

        let containers = self.runtime.containers_for(&application.organization_id).await?;
        if healthy_service(containers.as_ref(), &application.id).await? {
            self.mark_ready(application).await;
            return Ok(EnsureOutcome::Ready);
        }

        if !self.starting.insert(application.id.clone()) {
            return Ok(EnsureOutcome::Starting);
        }
        let failures = self
            .failures
            .get(&application.id)
            .map_or(0, |failure| failure.consecutive);

        let payload = serde_json::to_value(DevServiceJob {
            application_id: application.id.clone(),
        })
        .map_err(anyhow::Error::from)?;
        if let Err(error) = self
            .jobs
            .enqueue(LIVE_DEV_QUEUE, &dev_job_key(&application.id), None, payload)
            .await
        {
            self.starting.remove(&application.id);
            return Err(error.into());
        }

        info!(application_id = %application.id, failures, "dev service start requested");
        Ok(EnsureOutcome::Requested { failures })
    }

    async fn mark_ready(&self, application: &ApplicationRecord) {
        self.ready.insert(application.id.clone());
        self.failures.remove(&application.id);

        let Some(domain) = application.domain.as_deref() else {
            return;
        };
        let upstream = Upstream::new(dev_service_name(&application.id), application.port());
        if let Err(error) = self.proxy.add(domain, upstream, &application.id).await {
            warn!(application_id = %application.id, %domain, %error, "failed to route dev domain");
        }
    }

    #[must_use]
    pub fn service_spec(&self, application: &ApplicationRecord) -> ServiceSpec {
        let (image, command) = dev_runtime(application.framework.as_deref());
        let staging_dir = staging_path(
            &self.settings.staging_root,
            &application.user_id,
            application.environment,
            &application.id,
            application.base_path.as_deref(),
        );

        let mut env = application.environment_variables.0.clone();
        env.insert("PORT".to_string(), application.port().to_string());
        env.insert("HOST".to_string(), "0.0.0.0".to_string());

        let labels = BTreeMap::from([
            (LABEL_APPLICATION_ID.to_string(), application.id.clone()),
            (LABEL_APPLICATION_NAME.to_string(), application.name.clone()),
            (LABEL_ENVIRONMENT.to_string(), application.environment.as_str().to_string()),
            (LABEL_ORGANIZATION_ID.to_string(), application.organization_id.clone()),
        ]);

        ServiceSpec {
            name: dev_service_name(&application.id),
            image: image.to_string(),
            env,
            labels,
            network: self.settings.network.clone(),
            target_port: application.port(),
            published_port: None,
            binds: vec![(staging_dir, DEV_MOUNT_PATH.to_string())],
            command: Some(command),
            working_dir: Some(DEV_MOUNT_PATH.to_string()),
        }
    }

    /// Creates the dev service and waits for it to report healthy. Runs on
    /// the `live-dev` queue.
    ///
    /// # Errors
    /// Returns the creation or health failure; it is also counted towards
    /// the cooldown.
    pub async fn provision(&self, application_id: &str, cancel: &CancellationToken) -> Result<(), DevServiceError> {
        let result = self.create_and_wait(application_id, cancel).await;
        self.starting.remove(application_id);

        match result {
            Ok(application) => {
                self.mark_ready(&application).await;
                info!(%application_id, "dev service ready");
                Ok(())
            }
            Err(error) => {
                let consecutive = self.record_failure(application_id);
                warn!(%application_id, consecutive, %error, "dev service failed to start");
                Err(error)
            }
        }
    }

    async fn create_and_wait(
        &self,
        application_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ApplicationRecord, DevServiceError> {
        let application = self
            .db
            .get_application(application_id)
            .await?
            .ok_or_else(|| DevServiceError::Invalid(format!("application {application_id} no longer exists")))?;
        let containers = self.runtime.containers_for(&application.organization_id).await?;
        let spec = self.service_spec(&application);

        match containers.remove_service(&spec.name).await {
            Ok(()) | Err(DockerError::NotFound(_)) => {}
            Err(error) => return Err(error.into()),
        }
        containers.create_service(&spec).await?;

        let deadline = Instant::now() + self.settings.ready_timeout;
        loop {
            if containers.service_health(&spec.name).await?.is_healthy() {
                return Ok(application);
            }
            if Instant::now() >= deadline {
                return Err(DevServiceError::Unhealthy(self.settings.ready_timeout));
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(DevServiceError::Cancelled),
                () = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }
    }
}

async fn healthy_service(containers: &dyn ContainerPort, application_id: &str) -> Result<bool, DockerError> {
    for service in containers
        .list_services(&label_filter(LABEL_APPLICATION_ID, application_id))
        .await?
    {
        match containers.service_health(&service.name).await {
            Ok(health) if health.is_healthy() => return Ok(true),
            Ok(_) | Err(DockerError::NotFound(_)) => {}
            Err(error) => return Err(error),
        }
    }
    Ok(false)
}

pub struct DevServiceJobHandler {
    manager: Arc<DevServiceManager>,
}

impl DevServiceJobHandler {
    #[must_use]
    pub fn new(manager: Arc<DevServiceManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl JobHandler for DevServiceJobHandler {
    async fn handle(&self, context: &JobContext) -> Result<(), JobError> {
        let job: DevServiceJob = context.payload()?;
        match self.manager.provision(&job.application_id, &context.cancel_token()).await {
            Ok(()) => Ok(()),
            Err(DevServiceError::Cancelled) => Err(JobError::Cancelled),
            // The next file write retries after the cooldown.
            Err(error) => Err(JobError::Terminal(error.to_string())),
        }
    }
}
