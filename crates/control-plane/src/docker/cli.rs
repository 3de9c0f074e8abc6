use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

use crate::host::{shell_quote, CommandOutput, Host, HostError};

/// `docker build` of a context directory that lives on the host.
#[derive(Clone, Debug, Default)]
pub struct BuildRequest {
    pub context_dir: String,
    pub dockerfile: Option<String>,
    pub tag: String,
    pub build_args: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub no_cache: bool,
    pub cache_from: Option<String>,
}

#[must_use]
pub fn build_command(request: &BuildRequest) -> String {
    let mut command = format!("docker build -t {}", shell_quote(&request.tag));
    if let Some(dockerfile) = &request.dockerfile {
        let _ = write!(command, " -f {}", shell_quote(dockerfile));
    }
    if request.no_cache {
        command.push_str(" --no-cache");
    } else if let Some(cache_from) = &request.cache_from {
        let _ = write!(command, " --cache-from {}", shell_quote(cache_from));
    }
    for (key, value) in &request.build_args {
        let _ = write!(command, " --build-arg {}", shell_quote(&format!("{key}={value}")));
    }
    for (key, value) in &request.labels {
        let _ = write!(command, " --label {}", shell_quote(&format!("{key}={value}")));
    }
    let _ = write!(command, " {}", shell_quote(&request.context_dir));
    command
}

/// # Errors
/// Returns host errors; a failed build is a non-zero exit code in the output.
pub async fn build_image(host: &dyn Host, request: &BuildRequest, timeout: Duration) -> Result<CommandOutput, HostError> {
    host.execute(&build_command(request), timeout).await
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComposeAction {
    Up,
    Down,
    Build,
}

impl ComposeAction {
    fn arguments(self) -> &'static str {
        match self {
            Self::Up => "up -d --remove-orphans",
            Self::Down => "down --remove-orphans",
            Self::Build => "build",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ComposeRequest {
    pub project_dir: String,
    pub compose_file: String,
    pub project_name: String,
    pub env: BTreeMap<String, String>,
}

#[must_use]
pub fn compose_command(request: &ComposeRequest, action: ComposeAction) -> String {
    let mut command = format!("cd {} && ", shell_quote(&request.project_dir));
    if !request.env.is_empty() {
        command.push_str("env");
        for (key, value) in &request.env {
            let _ = write!(command, " {}", shell_quote(&format!("{key}={value}")));
        }
        command.push(' ');
    }
    let _ = write!(
        command,
        "docker compose -p {} -f {} {}",
        shell_quote(&request.project_name),
        shell_quote(&request.compose_file),
        action.arguments()
    );
    command
}

/// # Errors
/// Returns host errors; compose failures show up as a non-zero exit code.
pub async fn compose(
    host: &dyn Host,
    request: &ComposeRequest,
    action: ComposeAction,
    timeout: Duration,
) -> Result<CommandOutput, HostError> {
    host.execute(&compose_command(request, action), timeout).await
}

/// # Errors
/// Returns host errors.
pub async fn prune_build_cache(host: &dyn Host, timeout: Duration) -> Result<CommandOutput, HostError> {
    host.execute("docker builder prune -f", timeout).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_command_quotes_args_and_prefers_no_cache() {
        let request = BuildRequest {
            context_dir: "/srv/deployments/u/production/api".to_string(),
            dockerfile: Some("docker/Dockerfile".to_string()),
            tag: "acme/api:abc1234".to_string(),
            build_args: BTreeMap::from([("GREETING".to_string(), "hello world".to_string())]),
            labels: BTreeMap::new(),
            no_cache: true,
            cache_from: Some("acme/api:prev".to_string()),
        };
        assert_eq!(
            build_command(&request),
            "docker build -t acme/api:abc1234 -f docker/Dockerfile --no-cache --build-arg 'GREETING=hello world' /srv/deployments/u/production/api"
        );
    }

    #[test]
    fn build_command_uses_cache_from_when_caching() {
        let request = BuildRequest {
            context_dir: "/ctx".to_string(),
            tag: "acme/api:def5678".to_string(),
            cache_from: Some("acme/api:abc1234".to_string()),
            ..BuildRequest::default()
        };
        assert_eq!(
            build_command(&request),
            "docker build -t acme/api:def5678 --cache-from acme/api:abc1234 /ctx"
        );
    }

    #[test]
    fn compose_command_passes_env_through_env() {
        let request = ComposeRequest {
            project_dir: "/srv/app".to_string(),
            compose_file: "docker-compose.yml".to_string(),
            project_name: "api-production".to_string(),
            env: BTreeMap::from([("TOKEN".to_string(), "a'b".to_string())]),
        };
        assert_eq!(
            compose_command(&request, ComposeAction::Up),
            r"cd /srv/app && env 'TOKEN=a'\''b' docker compose -p api-production -f docker-compose.yml up -d --remove-orphans"
        );
    }
}
