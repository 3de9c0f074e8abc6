use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use openssh::{KnownHosts, Session, SessionBuilder};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::pool::{Connector, PoolPolicy, SessionPool};
use super::remote::RemoteHost;
use super::system::RemoteSystemReader;
use super::{classify_connect_error, Host, HostError, HostProvider, SystemReader};
use crate::config::ControlPlaneConfig;

const REAP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub private_key_path: Option<PathBuf>,
}

impl SshTarget {
    #[must_use]
    pub fn from_config(config: &ControlPlaneConfig) -> Option<Self> {
        Some(Self {
            host: config.ssh_host()?,
            port: config.ssh_port(),
            user: config.ssh_user(),
            private_key_path: config.ssh_private_key_path().map(PathBuf::from),
        })
    }

    #[must_use]
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Forwards a local unix socket to one on the host with a dedicated
    /// `ssh` process. The process dies with the returned child.
    ///
    /// # Errors
    /// Returns an error if `ssh` cannot be spawned.
    pub fn spawn_socket_tunnel(&self, local_socket: &Path, remote_socket: &str) -> std::io::Result<Child> {
        let mut command = Command::new("ssh");
        command
            .arg("-nNT")
            .args(["-o", "ExitOnForwardFailure=yes"])
            .args(["-o", "StreamLocalBindUnlink=yes"])
            .args(["-o", "StrictHostKeyChecking=accept-new"])
            .args(["-p", &self.port.to_string()]);
        if let Some(key_path) = &self.private_key_path {
            command.arg("-i").arg(key_path);
        }
        command
            .arg("-L")
            .arg(format!("{}:{remote_socket}", local_socket.display()))
            .arg(self.destination())
            .kill_on_drop(true);

        debug!(destination = %self.destination(), "starting docker socket tunnel");
        command.spawn()
    }
}

/// Opens OpenSSH control-master connections.
pub struct OpensshConnector {
    target: SshTarget,
}

impl OpensshConnector {
    #[must_use]
    pub fn new(target: SshTarget) -> Self {
        Self { target }
    }
}

#[async_trait]
impl Connector for OpensshConnector {
    type Connection = Session;

    async fn connect(&self) -> Result<Session, HostError> {
        let mut builder = SessionBuilder::default();
        builder
            .user(self.target.user.clone())
            .port(self.target.port)
            .known_hosts_check(KnownHosts::Add)
            .connect_timeout(Duration::from_secs(10))
            .server_alive_interval(Duration::from_secs(15));
        if let Some(key_path) = &self.target.private_key_path {
            builder.keyfile(key_path);
        }

        builder
            .connect_mux(&self.target.host)
            .await
            .map_err(|error| classify_connect_error(&error.to_string()))
    }

    async fn is_alive(&self, connection: &Session) -> bool {
        connection.check().await.is_ok()
    }
}

/// One session pool per organization, all pointed at the configured host.
pub struct SshManager {
    target: SshTarget,
    policy: PoolPolicy,
    pools: DashMap<String, Arc<SessionPool<OpensshConnector>>>,
}

impl SshManager {
    #[must_use]
    pub fn new(target: SshTarget, policy: PoolPolicy) -> Self {
        Self {
            target,
            policy,
            pools: DashMap::new(),
        }
    }

    #[must_use]
    pub fn from_config(config: &ControlPlaneConfig) -> Option<Self> {
        let target = SshTarget::from_config(config)?;
        let policy = PoolPolicy {
            capacity: config.ssh_pool_size(),
            idle_timeout: config.ssh_idle_timeout(),
            max_lifetime: config.ssh_max_lifetime(),
            cooldown: config.ssh_cooldown(),
            ..PoolPolicy::default()
        };
        Some(Self::new(target, policy))
    }

    #[must_use]
    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    fn pool(&self, organization_id: &str) -> Arc<SessionPool<OpensshConnector>> {
        let entry = self
            .pools
            .entry(organization_id.to_string())
            .or_insert_with(|| {
                Arc::new(SessionPool::new(
                    organization_id,
                    OpensshConnector::new(self.target.clone()),
                    self.policy,
                ))
            });
        Arc::clone(entry.value())
    }

    pub async fn reap_idle(&self) {
        let pools: Vec<_> = self.pools.iter().map(|entry| Arc::clone(entry.value())).collect();
        for pool in pools {
            pool.reap_idle().await;
        }
    }

    pub fn spawn_reaper(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REAP_INTERVAL);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => self.reap_idle().await,
                }
            }
        })
    }
}

#[async_trait]
impl HostProvider for SshManager {
    async fn host_for(&self, organization_id: &str) -> Result<Arc<dyn Host>, HostError> {
        Ok(Arc::new(RemoteHost::new(self.pool(organization_id))))
    }

    async fn system_reader_for(&self, organization_id: &str) -> Result<Arc<dyn SystemReader>, HostError> {
        let host = self.host_for(organization_id).await?;
        Ok(Arc::new(RemoteSystemReader::new(host)))
    }

    async fn release_tenant(&self, organization_id: &str) {
        if let Some((_, pool)) = self.pools.remove(organization_id) {
            pool.drain().await;
            info!(organization_id, "released host sessions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> SshTarget {
        SshTarget {
            host: "10.0.0.5".to_string(),
            port: 2222,
            user: "deploy".to_string(),
            private_key_path: Some(PathBuf::from("/etc/nixopus/ssh/id_ed25519")),
        }
    }

    #[test]
    fn destination_joins_user_and_host() {
        assert_eq!(target().destination(), "deploy@10.0.0.5");
    }

    #[tokio::test]
    async fn pools_are_created_per_organization_and_released() {
        let manager = SshManager::new(target(), PoolPolicy::default());
        let first = manager.pool("org-1");
        let again = manager.pool("org-1");
        let other = manager.pool("org-2");
        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));

        manager.release_tenant("org-1").await;
        assert_eq!(manager.pools.len(), 1);
    }
}
