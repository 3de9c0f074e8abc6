use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

const DEFAULT_CONFIG_PATH: &str = "/etc/nixopus/config.json";

const DEFAULT_DB_PATH: &str = "/var/lib/nixopus/control-plane.db";
const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8443";
const DEFAULT_STAGING_ROOT: &str = "/etc/nixopus/configs/deployments";

const DEFAULT_PROXY_ADMIN_URL: &str = "http://127.0.0.1:2019";
const DEFAULT_PROXY_SERVER_NAME: &str = "nixopus";
const DEFAULT_UPSTREAM_NETWORK: &str = "nixopus-network";

const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";
const DEFAULT_DOCKER_TIMEOUT_SECONDS: u64 = 120;

const DEFAULT_SSH_PORT: u16 = 22;
const DEFAULT_SSH_USER: &str = "root";
const DEFAULT_SSH_POOL_SIZE: usize = 4;
const DEFAULT_SSH_IDLE_SECONDS: u64 = 30;
const DEFAULT_SSH_MAX_LIFETIME_SECONDS: u64 = 5 * 60;
const DEFAULT_SSH_COOLDOWN_SECONDS: u64 = 10;

const DEFAULT_JOB_WORKERS: usize = 4;
const DEFAULT_JOB_MAX_RETRIES: u32 = 3;
const DEFAULT_JOB_DRAIN_SECONDS: u64 = 30;

const DEFAULT_MAX_CONCURRENT_PROBES: usize = 50;

const DEFAULT_AUTH_CACHE_TTL_SECONDS: u64 = 5 * 60;
const DEFAULT_AUTH_CACHE_CAPACITY: usize = 10_000;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    pub database_path: Option<String>,
    pub bind_address: Option<String>,
    pub staging_root: Option<String>,
    pub encryption_key: Option<String>,
    pub allowed_domain_ips: Vec<String>,
    pub proxy: ProxyConfig,
    pub docker: DockerConfig,
    pub ssh: SshConfig,
    pub jobs: JobsConfig,
    pub healthcheck: HealthcheckConfig,
    pub auth: AuthConfig,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub admin_url: Option<String>,
    pub server_name: Option<String>,
    pub upstream_network: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DockerEndpointKind {
    #[default]
    Local,
    Ssh,
    Tls,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub endpoint: DockerEndpointKind,
    pub socket_path: Option<String>,
    pub tls_address: Option<String>,
    pub tls_cert_dir: Option<String>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub private_key_path: Option<String>,
    pub pool_size: Option<usize>,
    pub idle_timeout_seconds: Option<u64>,
    pub max_lifetime_seconds: Option<u64>,
    pub cooldown_seconds: Option<u64>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub workers_per_queue: Option<usize>,
    pub max_retries: Option<u32>,
    pub drain_seconds: Option<u64>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct HealthcheckConfig {
    pub max_concurrent_probes: Option<usize>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub cache_ttl_seconds: Option<u64>,
    pub cache_capacity: Option<usize>,
    pub secure_cookies: Option<bool>,
}

impl ControlPlaneConfig {
    /// Loads the config file named by `NIXOPUS_CONFIG_PATH`, or the default path.
    ///
    /// # Errors
    ///
    /// This function will return an error if the config file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("NIXOPUS_CONFIG_PATH")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

        Self::load_from(Path::new(&config_path))
    }

    /// Loads a specific config file; a missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config = serde_json::from_str::<Self>(&raw)
            .with_context(|| format!("Failed to parse config JSON: {}", path.display()))?;

        Ok(config)
    }

    #[must_use]
    pub fn database_path(&self) -> String {
        trimmed_or_env(self.database_path.as_deref(), "NIXOPUS_DB_PATH")
            .unwrap_or_else(|| DEFAULT_DB_PATH.to_string())
    }

    #[must_use]
    pub fn bind_address(&self) -> String {
        trimmed_or_env(self.bind_address.as_deref(), "NIXOPUS_BIND_ADDRESS")
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string())
    }

    #[must_use]
    pub fn staging_root(&self) -> String {
        trimmed_or_env(self.staging_root.as_deref(), "NIXOPUS_STAGING_ROOT")
            .map(|value| value.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_STAGING_ROOT.to_string())
    }

    pub fn encryption_key(&self) -> Option<String> {
        trimmed_or_env(self.encryption_key.as_deref(), "NIXOPUS_ENCRYPTION_KEY")
    }

    #[must_use]
    pub fn allowed_domain_ips(&self) -> Vec<String> {
        self.allowed_domain_ips
            .iter()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .collect()
    }

    #[must_use]
    pub fn proxy_admin_url(&self) -> String {
        trimmed_or_env(self.proxy.admin_url.as_deref(), "NIXOPUS_PROXY_ADMIN_URL")
            .map(|value| value.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_PROXY_ADMIN_URL.to_string())
    }

    #[must_use]
    pub fn proxy_server_name(&self) -> String {
        trimmed(self.proxy.server_name.as_deref())
            .unwrap_or_else(|| DEFAULT_PROXY_SERVER_NAME.to_string())
    }

    #[must_use]
    pub fn upstream_network(&self) -> String {
        trimmed(self.proxy.upstream_network.as_deref())
            .unwrap_or_else(|| DEFAULT_UPSTREAM_NETWORK.to_string())
    }

    #[must_use]
    pub fn docker_socket_path(&self) -> String {
        trimmed(self.docker.socket_path.as_deref())
            .unwrap_or_else(|| DEFAULT_DOCKER_SOCKET.to_string())
    }

    #[must_use]
    pub fn docker_timeout(&self) -> Duration {
        Duration::from_secs(
            self.docker
                .timeout_seconds
                .unwrap_or(DEFAULT_DOCKER_TIMEOUT_SECONDS),
        )
    }

    pub fn ssh_host(&self) -> Option<String> {
        trimmed_or_env(self.ssh.host.as_deref(), "NIXOPUS_SSH_HOST")
    }

    #[must_use]
    pub fn ssh_port(&self) -> u16 {
        self.ssh.port.unwrap_or(DEFAULT_SSH_PORT)
    }

    #[must_use]
    pub fn ssh_user(&self) -> String {
        trimmed_or_env(self.ssh.user.as_deref(), "NIXOPUS_SSH_USER")
            .unwrap_or_else(|| DEFAULT_SSH_USER.to_string())
    }

    pub fn ssh_private_key_path(&self) -> Option<String> {
        trimmed_or_env(
            self.ssh.private_key_path.as_deref(),
            "NIXOPUS_SSH_PRIVATE_KEY_PATH",
        )
    }

    #[must_use]
    pub fn ssh_pool_size(&self) -> usize {
        self.ssh.pool_size.unwrap_or(DEFAULT_SSH_POOL_SIZE).max(1)
    }

    #[must_use]
    pub fn ssh_idle_timeout(&self) -> Duration {
        Duration::from_secs(
            self.ssh
                .idle_timeout_seconds
                .unwrap_or(DEFAULT_SSH_IDLE_SECONDS),
        )
    }

    #[must_use]
    pub fn ssh_max_lifetime(&self) -> Duration {
        Duration::from_secs(
            self.ssh
                .max_lifetime_seconds
                .unwrap_or(DEFAULT_SSH_MAX_LIFETIME_SECONDS),
        )
    }

    #[must_use]
    pub fn ssh_cooldown(&self) -> Duration {
        Duration::from_secs(
            self.ssh
                .cooldown_seconds
                .unwrap_or(DEFAULT_SSH_COOLDOWN_SECONDS),
        )
    }

    #[must_use]
    pub fn job_workers_per_queue(&self) -> usize {
        self.jobs
            .workers_per_queue
            .unwrap_or(DEFAULT_JOB_WORKERS)
            .max(1)
    }

    #[must_use]
    pub fn job_max_retries(&self) -> u32 {
        self.jobs.max_retries.unwrap_or(DEFAULT_JOB_MAX_RETRIES)
    }

    #[must_use]
    pub fn job_drain_deadline(&self) -> Duration {
        Duration::from_secs(self.jobs.drain_seconds.unwrap_or(DEFAULT_JOB_DRAIN_SECONDS))
    }

    #[must_use]
    pub fn max_concurrent_probes(&self) -> usize {
        self.healthcheck
            .max_concurrent_probes
            .unwrap_or(DEFAULT_MAX_CONCURRENT_PROBES)
            .max(1)
    }

    #[must_use]
    pub fn auth_cache_ttl(&self) -> Duration {
        Duration::from_secs(
            self.auth
                .cache_ttl_seconds
                .unwrap_or(DEFAULT_AUTH_CACHE_TTL_SECONDS),
        )
    }

    #[must_use]
    pub fn auth_cache_capacity(&self) -> usize {
        self.auth
            .cache_capacity
            .unwrap_or(DEFAULT_AUTH_CACHE_CAPACITY)
            .max(1)
    }

    #[must_use]
    pub fn secure_cookies(&self) -> bool {
        self.auth.secure_cookies.unwrap_or(true)
    }
}

fn trimmed(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

fn trimmed_or_env(value: Option<&str>, env_name: &str) -> Option<String> {
    trimmed(value).or_else(|| {
        std::env::var(env_name)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}
