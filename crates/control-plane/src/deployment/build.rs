use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

use crate::db::{ApplicationRecord, BuildPack};
use crate::docker::cli::{self, BuildRequest, ComposeAction, ComposeRequest};
use crate::host::{shell_quote, CommandOutput, Host, HostError};

pub const DEFAULT_COMPOSE_FILE: &str = "docker-compose.yml";
const STATIC_DOCKERFILE_NAME: &str = ".nixopus.static.Dockerfile";

/// Everything needed to turn a checked-out tree into an image.
#[derive(Clone, Debug)]
pub struct BuildPlan {
    pub build_pack: BuildPack,
    pub context_dir: String,
    pub image: String,
    pub dockerfile_path: Option<String>,
    pub build_args: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub cache_from: Option<String>,
    pub no_cache: bool,
    pub port: u16,
    pub compose_project: String,
}

impl BuildPlan {
    #[must_use]
    pub fn for_application(
        application: &ApplicationRecord,
        context_dir: String,
        image: String,
        compose_project: String,
    ) -> Self {
        Self {
            build_pack: application.build_pack,
            context_dir,
            image,
            dockerfile_path: application.dockerfile_path.clone(),
            build_args: application.build_variables.0.clone(),
            labels: BTreeMap::new(),
            cache_from: None,
            no_cache: false,
            port: application.port(),
            compose_project,
        }
    }

    /// The compose file, relative to the context directory.
    #[must_use]
    pub fn compose_file(&self) -> String {
        self.dockerfile_path
            .clone()
            .filter(|path| !path.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_COMPOSE_FILE.to_string())
    }

    #[must_use]
    pub fn compose_request(&self, env: BTreeMap<String, String>) -> ComposeRequest {
        ComposeRequest {
            project_dir: self.context_dir.clone(),
            compose_file: self.compose_file(),
            project_name: self.compose_project.clone(),
            env,
        }
    }

    fn in_context(&self, relative: &str) -> String {
        format!(
            "{}/{}",
            self.context_dir.trim_end_matches('/'),
            relative.trim_start_matches("./").trim_start_matches('/')
        )
    }
}

/// Serves the checked-out tree as files on the application port.
#[must_use]
pub fn static_dockerfile(port: u16) -> String {
    format!(
        "FROM caddy:2-alpine\nCOPY . /srv\nEXPOSE {port}\nCMD [\"caddy\", \"file-server\", \"--root\", \"/srv\", \"--listen\", \":{port}\"]\n"
    )
}

#[must_use]
pub fn nixpacks_command(plan: &BuildPlan) -> String {
    let mut command = format!(
        "nixpacks build {} --name {}",
        shell_quote(&plan.context_dir),
        shell_quote(&plan.image)
    );
    for (key, value) in &plan.build_args {
        let _ = write!(command, " --env {}", shell_quote(&format!("{key}={value}")));
    }
    if plan.no_cache {
        command.push_str(" --no-cache");
    }
    command
}

/// Runs the build for the plan's build pack on `host`.
///
/// # Errors
/// Returns host errors; a failing build is a non-zero exit code.
pub async fn run_build(host: &dyn Host, plan: &BuildPlan, timeout: Duration) -> Result<CommandOutput, HostError> {
    match plan.build_pack {
        BuildPack::Dockerfile => {
            let request = BuildRequest {
                context_dir: plan.context_dir.clone(),
                dockerfile: plan
                    .dockerfile_path
                    .as_deref()
                    .filter(|path| !path.trim().is_empty())
                    .map(|path| plan.in_context(path)),
                tag: plan.image.clone(),
                build_args: plan.build_args.clone(),
                labels: plan.labels.clone(),
                no_cache: plan.no_cache,
                cache_from: plan.cache_from.clone(),
            };
            cli::build_image(host, &request, timeout).await
        }
        BuildPack::Static => {
            let dockerfile = plan.in_context(STATIC_DOCKERFILE_NAME);
            host.write_file(&dockerfile, static_dockerfile(plan.port).as_bytes(), 0o644)
                .await?;
            let request = BuildRequest {
                context_dir: plan.context_dir.clone(),
                dockerfile: Some(dockerfile),
                tag: plan.image.clone(),
                build_args: BTreeMap::new(),
                labels: plan.labels.clone(),
                no_cache: plan.no_cache,
                cache_from: plan.cache_from.clone(),
            };
            cli::build_image(host, &request, timeout).await
        }
        BuildPack::Nixpacks => host.execute(&nixpacks_command(plan), timeout).await,
        BuildPack::Compose => {
            cli::compose(
                host,
                &plan.compose_request(plan.build_args.clone()),
                ComposeAction::Build,
                timeout,
            )
            .await
        }
    }
}

/// Last `max_lines` lines of build output, for deployment logs.
#[must_use]
pub fn output_tail(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::FakeHost;

    fn plan(build_pack: BuildPack) -> BuildPlan {
        BuildPlan {
            build_pack,
            context_dir: "/srv/u/production/app".to_string(),
            image: "acme/api:abc1234".to_string(),
            dockerfile_path: None,
            build_args: BTreeMap::from([("NODE_ENV".to_string(), "production".to_string())]),
            labels: BTreeMap::new(),
            cache_from: None,
            no_cache: false,
            port: 3000,
            compose_project: "api-123456".to_string(),
        }
    }

    #[tokio::test]
    async fn dockerfile_path_is_resolved_inside_the_context() {
        let host = Arc::new(FakeHost::new());
        let mut plan = plan(BuildPack::Dockerfile);
        plan.dockerfile_path = Some("./docker/Dockerfile".to_string());
        run_build(host.as_ref(), &plan, Duration::from_secs(5)).await.expect("build");

        let commands = host.commands();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].contains("-f /srv/u/production/app/docker/Dockerfile"), "{}", commands[0]);
        assert!(commands[0].contains("--build-arg NODE_ENV=production"));
    }

    #[tokio::test]
    async fn static_sites_get_a_generated_dockerfile() {
        let host = Arc::new(FakeHost::new());
        run_build(host.as_ref(), &plan(BuildPack::Static), Duration::from_secs(5))
            .await
            .expect("build");

        let dockerfile = host
            .file("/srv/u/production/app/.nixopus.static.Dockerfile")
            .expect("generated dockerfile");
        assert!(String::from_utf8_lossy(&dockerfile).contains("--listen\", \":3000\""));
        assert!(host.commands()[0].starts_with("docker build -t acme/api:abc1234"));
    }

    #[test]
    fn nixpacks_passes_build_variables_as_env() {
        let mut plan = plan(BuildPack::Nixpacks);
        plan.no_cache = true;
        assert_eq!(
            nixpacks_command(&plan),
            "nixpacks build /srv/u/production/app --name acme/api:abc1234 --env NODE_ENV=production --no-cache"
        );
    }

    #[test]
    fn output_tail_keeps_the_last_lines() {
        assert_eq!(output_tail("a\nb\nc\nd", 2), "c\nd");
        assert_eq!(output_tail("only", 5), "only");
    }
}
