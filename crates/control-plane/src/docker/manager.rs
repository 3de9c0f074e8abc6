use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::{Docker, API_DEFAULT_VERSION};
use dashmap::DashMap;
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::daemon::DaemonContainers;
use super::{ContainerPort, ContainerRuntime, DockerError};
use crate::config::{ControlPlaneConfig, DockerEndpointKind};
use crate::host::ssh::SshTarget;

const REMOTE_DOCKER_SOCKET: &str = "/var/run/docker.sock";
const TUNNEL_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a tenant's container daemon lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DockerEndpoint {
    Local { socket_path: String },
    Ssh { target: SshTarget, tunnel_dir: PathBuf },
    Tls { address: String, cert_dir: PathBuf },
}

impl DockerEndpoint {
    /// # Errors
    /// Returns an error when the configured endpoint kind lacks the settings
    /// it needs.
    pub fn from_config(config: &ControlPlaneConfig) -> Result<Self, DockerError> {
        match config.docker.endpoint {
            DockerEndpointKind::Local => Ok(Self::Local {
                socket_path: config.docker_socket_path(),
            }),
            DockerEndpointKind::Ssh => {
                let target = SshTarget::from_config(config).ok_or_else(|| {
                    DockerError::Infrastructure("docker endpoint `ssh` needs ssh.host".to_string())
                })?;
                Ok(Self::Ssh {
                    target,
                    tunnel_dir: std::env::temp_dir(),
                })
            }
            DockerEndpointKind::Tls => {
                let address = config.docker.tls_address.clone().ok_or_else(|| {
                    DockerError::Infrastructure("docker endpoint `tls` needs docker.tls_address".to_string())
                })?;
                let cert_dir = config.docker.tls_cert_dir.clone().ok_or_else(|| {
                    DockerError::Infrastructure("docker endpoint `tls` needs docker.tls_cert_dir".to_string())
                })?;
                Ok(Self::Tls {
                    address,
                    cert_dir: PathBuf::from(cert_dir),
                })
            }
        }
    }
}

#[must_use]
pub fn tunnel_socket_path(tunnel_dir: &Path, organization_id: &str) -> PathBuf {
    let safe: String = organization_id
        .chars()
        .filter(|character| character.is_ascii_alphanumeric() || *character == '-')
        .collect();
    tunnel_dir.join(format!("nixopus-docker-{safe}.sock"))
}

struct CachedClient {
    containers: Arc<DaemonContainers>,
    _tunnel: Option<Mutex<Child>>,
}

/// Resolves and caches a daemon client per tenant.
pub struct DockerManager {
    endpoint: DockerEndpoint,
    timeout: Duration,
    clients: DashMap<String, CachedClient>,
    connecting: Mutex<()>,
}

impl DockerManager {
    #[must_use]
    pub fn new(endpoint: DockerEndpoint, timeout: Duration) -> Self {
        Self {
            endpoint,
            timeout,
            clients: DashMap::new(),
            connecting: Mutex::new(()),
        }
    }

    /// # Errors
    /// Returns an error when the endpoint configuration is incomplete.
    pub fn from_config(config: &ControlPlaneConfig) -> Result<Self, DockerError> {
        Ok(Self::new(DockerEndpoint::from_config(config)?, config.docker_timeout()))
    }

    fn cached(&self, organization_id: &str) -> Option<Arc<DaemonContainers>> {
        self.clients
            .get(organization_id)
            .map(|entry| Arc::clone(&entry.containers))
    }

    async fn connect(&self, organization_id: &str) -> Result<CachedClient, DockerError> {
        let timeout_seconds = self.timeout.as_secs().max(1);
        match &self.endpoint {
            DockerEndpoint::Local { socket_path } => {
                let docker = Docker::connect_with_socket(socket_path, timeout_seconds, API_DEFAULT_VERSION)
                    .map_err(|error| DockerError::Infrastructure(error.to_string()))?;
                Ok(CachedClient {
                    containers: Arc::new(DaemonContainers::new(docker)),
                    _tunnel: None,
                })
            }
            DockerEndpoint::Ssh { target, tunnel_dir } => {
                let socket = tunnel_socket_path(tunnel_dir, organization_id);
                let _ = tokio::fs::remove_file(&socket).await;
                let tunnel = target
                    .spawn_socket_tunnel(&socket, REMOTE_DOCKER_SOCKET)
                    .map_err(|error| DockerError::Infrastructure(format!("docker tunnel: {error}")))?;
                wait_for_socket(&socket).await?;

                let socket_path = socket.display().to_string();
                let docker = Docker::connect_with_socket(&socket_path, timeout_seconds, API_DEFAULT_VERSION)
                    .map_err(|error| DockerError::Infrastructure(error.to_string()))?;
                info!(organization_id, destination = %target.destination(), "docker tunnel ready");
                Ok(CachedClient {
                    containers: Arc::new(DaemonContainers::new(docker)),
                    _tunnel: Some(Mutex::new(tunnel)),
                })
            }
            DockerEndpoint::Tls { address, cert_dir } => {
                let docker = Docker::connect_with_ssl(
                    address,
                    &cert_dir.join("key.pem"),
                    &cert_dir.join("cert.pem"),
                    &cert_dir.join("ca.pem"),
                    timeout_seconds,
                    API_DEFAULT_VERSION,
                )
                .map_err(|error| DockerError::Infrastructure(error.to_string()))?;
                Ok(CachedClient {
                    containers: Arc::new(DaemonContainers::new(docker)),
                    _tunnel: None,
                })
            }
        }
    }
}

async fn wait_for_socket(socket: &Path) -> Result<(), DockerError> {
    let deadline = tokio::time::Instant::now() + TUNNEL_READY_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if tokio::fs::try_exists(socket).await.unwrap_or(false) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Err(DockerError::Infrastructure(format!(
        "docker tunnel socket {} did not appear",
        socket.display()
    )))
}

#[async_trait]
impl ContainerRuntime for DockerManager {
    async fn containers_for(&self, organization_id: &str) -> Result<Arc<dyn ContainerPort>, DockerError> {
        if let Some(containers) = self.cached(organization_id) {
            return Ok(containers);
        }

        let _guard = self.connecting.lock().await;
        if let Some(containers) = self.cached(organization_id) {
            return Ok(containers);
        }
        let client = self.connect(organization_id).await?;
        let containers = Arc::clone(&client.containers);
        self.clients.insert(organization_id.to_string(), client);
        Ok(containers)
    }

    async fn release_tenant(&self, organization_id: &str) {
        if self.clients.remove(organization_id).is_some() {
            if let DockerEndpoint::Ssh { tunnel_dir, .. } = &self.endpoint {
                let socket = tunnel_socket_path(tunnel_dir, organization_id);
                if let Err(error) = tokio::fs::remove_file(&socket).await {
                    warn!(%error, socket = %socket.display(), "failed to remove docker tunnel socket");
                }
            }
        }
    }
}
