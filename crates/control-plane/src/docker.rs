//! Container runtime access: a typed port over the daemon API, the manager
//! that picks a daemon per tenant, and the host-side `docker build` /
//! `docker compose` commands that need the build context on disk.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod cli;
pub mod daemon;
pub mod manager;

pub use manager::DockerManager;

pub const LABEL_APPLICATION_ID: &str = "com.application.id";
pub const LABEL_APPLICATION_NAME: &str = "com.application.name";
pub const LABEL_DEPLOYMENT_ID: &str = "com.deployment.id";
pub const LABEL_ENVIRONMENT: &str = "com.environment";
pub const LABEL_ORGANIZATION_ID: &str = "com.organization.id";

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum DockerError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("docker daemon error: {0}")]
    Infrastructure(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub network: Option<String>,
    pub exposed_port: Option<u16>,
    pub binds: Vec<String>,
    pub command: Option<Vec<String>>,
    pub working_dir: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub status: String,
    pub labels: BTreeMap<String, String>,
}

impl ContainerSummary {
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ContainerStats {
    pub id: String,
    pub name: String,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub memory_limit_bytes: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ImageSummary {
    pub id: String,
    pub tags: Vec<String>,
    pub size_bytes: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
    pub server: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub network: Option<String>,
    pub target_port: u16,
    pub published_port: Option<u16>,
    /// `(host_path, container_path)` bind mounts, read-write.
    pub binds: Vec<(String, String)>,
    pub command: Option<Vec<String>>,
    pub working_dir: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ServiceHealth {
    pub running: u64,
    pub desired: u64,
}

impl ServiceHealth {
    #[must_use]
    pub fn is_healthy(self) -> bool {
        self.desired > 0 && self.running >= self.desired
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ServiceSummary {
    pub id: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct NetworkSummary {
    pub id: String,
    pub name: String,
    pub driver: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VolumeSummary {
    pub name: String,
    pub driver: String,
    pub mountpoint: String,
}

pub type LabelFilters = BTreeMap<String, Vec<String>>;

/// Label filter in the daemon's `key=value` form.
#[must_use]
pub fn label_filter(key: &str, value: &str) -> LabelFilters {
    BTreeMap::from([("label".to_string(), vec![format!("{key}={value}")])])
}

/// Typed operations against one container daemon. Implementations are
/// stateless; [`ContainerRuntime`] picks which daemon a tenant uses.
#[async_trait]
pub trait ContainerPort: Send + Sync {
    async fn list_containers(&self, filters: &LabelFilters) -> Result<Vec<ContainerSummary>, DockerError>;
    async fn inspect_container(&self, id_or_name: &str) -> Result<ContainerSummary, DockerError>;
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, DockerError>;
    async fn start_container(&self, id_or_name: &str) -> Result<(), DockerError>;
    async fn stop_container(&self, id_or_name: &str) -> Result<(), DockerError>;
    async fn restart_container(&self, id_or_name: &str) -> Result<(), DockerError>;
    async fn remove_container(&self, id_or_name: &str) -> Result<(), DockerError>;
    /// Streams up to `tail` recent lines, then new ones when `follow` is set,
    /// until `cancel` fires or the container stops.
    async fn container_logs(
        &self,
        id_or_name: &str,
        tail: u32,
        follow: bool,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<String>, DockerError>;
    async fn container_stats(&self, id_or_name: &str) -> Result<ContainerStats, DockerError>;
    async fn exec(&self, id_or_name: &str, command: &[String]) -> Result<String, DockerError>;

    async fn list_images(&self) -> Result<Vec<ImageSummary>, DockerError>;
    async fn pull_image(&self, image: &str, credentials: Option<&RegistryCredentials>) -> Result<(), DockerError>;
    async fn tag_image(&self, source: &str, repository: &str, tag: &str) -> Result<(), DockerError>;
    async fn image_exists(&self, image: &str) -> Result<bool, DockerError>;
    async fn remove_image(&self, image: &str) -> Result<(), DockerError>;
    /// Removes dangling images; returns bytes reclaimed.
    async fn prune_dangling_images(&self) -> Result<u64, DockerError>;

    async fn create_service(&self, spec: &ServiceSpec) -> Result<String, DockerError>;
    async fn list_services(&self, filters: &LabelFilters) -> Result<Vec<ServiceSummary>, DockerError>;
    async fn service_health(&self, name: &str) -> Result<ServiceHealth, DockerError>;
    async fn remove_service(&self, name: &str) -> Result<(), DockerError>;

    async fn create_network(&self, name: &str) -> Result<(), DockerError>;
    async fn list_networks(&self) -> Result<Vec<NetworkSummary>, DockerError>;
    async fn remove_network(&self, name: &str) -> Result<(), DockerError>;
    async fn create_volume(&self, name: &str) -> Result<VolumeSummary, DockerError>;
    async fn list_volumes(&self) -> Result<Vec<VolumeSummary>, DockerError>;
    async fn remove_volume(&self, name: &str) -> Result<(), DockerError>;
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn containers_for(&self, organization_id: &str) -> Result<Arc<dyn ContainerPort>, DockerError>;

    async fn release_tenant(&self, organization_id: &str);
}

/// CPU share of one stats sample, as `docker stats` reports it.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn cpu_percent(cpu_delta: u64, system_delta: u64, online_cpus: u64) -> f64 {
    if cpu_delta == 0 || system_delta == 0 {
        return 0.0;
    }
    cpu_delta as f64 / system_delta as f64 * online_cpus.max(1) as f64 * 100.0
}
