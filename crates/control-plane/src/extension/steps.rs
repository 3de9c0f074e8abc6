//! Typed step actions and the compensations that undo them.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde_json::Value;

use super::spec::StepKind;
use super::ExtensionError;
use crate::docker::{ContainerPort, ContainerSpec, DockerError, LABEL_ORGANIZATION_ID};
use crate::host::{shell_quote, with_server_timeout, Host, HostError, SHORT_COMMAND_TIMEOUT};
use crate::proxy::{self, ProxyManager, RouteEntry, Upstream, EXTENSION_OWNER_PREFIX};

const DEFAULT_FILE_MODE: u32 = 0o644;
const LABEL_EXTENSION_ID: &str = "com.extension.id";

/// What a step may touch.
pub struct StepEnv<'a> {
    pub organization_id: &'a str,
    pub extension_id: &'a str,
    pub host: &'a dyn Host,
    pub containers: &'a dyn ContainerPort,
    pub proxy: &'a ProxyManager,
}

impl StepEnv<'_> {
    fn route_owner(&self) -> String {
        format!("{EXTENSION_OWNER_PREFIX}{}", self.extension_id)
    }
}

/// Reads typed values out of a step's substituted properties.
struct Props<'a> {
    step: &'a str,
    values: &'a BTreeMap<String, Value>,
}

impl Props<'_> {
    fn invalid(&self, message: impl fmt::Display) -> ExtensionError {
        ExtensionError::InvalidStep {
            step: self.step.to_string(),
            message: message.to_string(),
        }
    }

    fn opt_str(&self, key: &str) -> Result<Option<String>, ExtensionError> {
        match self.values.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(text)) if text.trim().is_empty() => Ok(None),
            Some(Value::String(text)) => Ok(Some(text.clone())),
            Some(Value::Number(number)) => Ok(Some(number.to_string())),
            Some(Value::Bool(flag)) => Ok(Some(flag.to_string())),
            Some(_) => Err(self.invalid(format!("'{key}' must be a string"))),
        }
    }

    fn str(&self, key: &str) -> Result<String, ExtensionError> {
        self.opt_str(key)?
            .ok_or_else(|| self.invalid(format!("'{key}' is required")))
    }

    fn bool(&self, key: &str) -> Result<bool, ExtensionError> {
        match self.values.get(key) {
            None | Some(Value::Null) => Ok(false),
            Some(Value::Bool(flag)) => Ok(*flag),
            Some(Value::String(text)) => match text.as_str() {
                "true" | "yes" => Ok(true),
                "false" | "no" | "" => Ok(false),
                _ => Err(self.invalid(format!("'{key}' must be a boolean"))),
            },
            Some(_) => Err(self.invalid(format!("'{key}' must be a boolean"))),
        }
    }

    /// A list given as an array or a comma-separated string.
    fn list(&self, key: &str) -> Result<Vec<String>, ExtensionError> {
        match self.values.get(key) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::String(text)) => Ok(text
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(text) => Ok(text.clone()),
                    Value::Number(number) => Ok(number.to_string()),
                    _ => Err(self.invalid(format!("'{key}' must hold strings"))),
                })
                .collect(),
            Some(_) => Err(self.invalid(format!("'{key}' must be a list"))),
        }
    }

    fn map(&self, key: &str) -> Result<BTreeMap<String, String>, ExtensionError> {
        match self.values.get(key) {
            None | Some(Value::Null) => Ok(BTreeMap::new()),
            Some(Value::Object(entries)) => entries
                .iter()
                .map(|(name, value)| match value {
                    Value::String(text) => Ok((name.clone(), text.clone())),
                    Value::Number(_) | Value::Bool(_) => Ok((name.clone(), value.to_string())),
                    _ => Err(self.invalid(format!("'{key}.{name}' must be a scalar"))),
                })
                .collect(),
            Some(_) => Err(self.invalid(format!("'{key}' must be a map"))),
        }
    }

    fn port(&self, key: &str) -> Result<Option<u16>, ExtensionError> {
        self.opt_str(key)?
            .map(|raw| {
                raw.parse::<u16>()
                    .ok()
                    .filter(|port| *port > 0)
                    .ok_or_else(|| self.invalid(format!("'{key}' must be a port number")))
            })
            .transpose()
    }

    /// File modes are octal whether written as `"0755"` or `755`.
    fn mode(&self) -> Result<u32, ExtensionError> {
        match self.opt_str("mode")? {
            None => Ok(DEFAULT_FILE_MODE),
            Some(raw) => u32::from_str_radix(raw.trim_start_matches("0o"), 8)
                .ok()
                .filter(|mode| *mode <= 0o7777)
                .ok_or_else(|| self.invalid(format!("'{raw}' is not an octal file mode"))),
        }
    }

    fn action(&self) -> Result<String, ExtensionError> {
        self.str("action").map(|action| action.to_ascii_lowercase())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PackageState {
    Present,
    Absent,
    Latest,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
    Enable,
    Disable,
}

impl ServiceAction {
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "restart" => Some(Self::Restart),
            "enable" => Some(Self::Enable),
            "disable" => Some(Self::Disable),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Enable => "enable",
            Self::Disable => "disable",
        }
    }

    fn inverse(self) -> Option<Self> {
        match self {
            Self::Start => Some(Self::Stop),
            Self::Stop => Some(Self::Start),
            Self::Enable => Some(Self::Disable),
            Self::Disable => Some(Self::Enable),
            Self::Restart => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileOp {
    Move { from: String, to: String },
    Copy { from: String, to: String, mode: u32 },
    Upload { path: String, contents: String, mode: u32 },
    Delete { path: String, backup: bool },
    Mkdir { path: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UserOp {
    Ensure {
        name: String,
        shell: Option<String>,
        home: Option<String>,
        groups: Vec<String>,
    },
    Delete { name: String },
    Modify {
        name: String,
        shell: Option<String>,
        home: Option<String>,
    },
    AddGroups { name: String, groups: Vec<String> },
    RemoveGroups { name: String, groups: Vec<String> },
    Check { name: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DockerOp {
    Pull { image: String },
    Run(ContainerSpec),
    Stop { name: String },
    Start { name: String },
    Rm { name: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComposeAction {
    Up,
    Down,
    Build,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyAction {
    Add,
    Update,
    Remove,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepAction {
    Command {
        cmd: String,
        user: Option<String>,
    },
    Package {
        name: String,
        state: PackageState,
    },
    Service {
        name: String,
        action: ServiceAction,
        revert: Option<ServiceAction>,
    },
    File(FileOp),
    User(UserOp),
    Docker(DockerOp),
    Compose {
        file: String,
        project: Option<String>,
        action: ComposeAction,
    },
    Proxy {
        action: ProxyAction,
        domain: String,
        upstream: Option<Upstream>,
    },
}

impl StepAction {
    /// Builds the action from already substituted properties.
    ///
    /// # Errors
    /// Returns `InvalidStep` when a property is missing or malformed.
    pub fn parse(
        step: &str,
        kind: StepKind,
        properties: &BTreeMap<String, Value>,
        revert_action: Option<&str>,
    ) -> Result<Self, ExtensionError> {
        let props = Props {
            step,
            values: properties,
        };
        match kind {
            StepKind::Command => Ok(Self::Command {
                cmd: props.str("cmd")?,
                user: props.opt_str("user")?,
            }),
            StepKind::Package => {
                let state = match props.opt_str("state")?.as_deref().unwrap_or("present") {
                    "present" | "install" | "installed" => PackageState::Present,
                    "absent" | "remove" | "removed" => PackageState::Absent,
                    "latest" | "upgrade" => PackageState::Latest,
                    other => return Err(props.invalid(format!("unknown package state '{other}'"))),
                };
                Ok(Self::Package {
                    name: props.str("name")?,
                    state,
                })
            }
            StepKind::Service => {
                let raw = props.action()?;
                let action = ServiceAction::parse(&raw)
                    .ok_or_else(|| props.invalid(format!("unknown service action '{raw}'")))?;
                let revert = revert_action
                    .map(|raw| {
                        ServiceAction::parse(raw)
                            .ok_or_else(|| props.invalid(format!("unknown revert action '{raw}'")))
                    })
                    .transpose()?;
                Ok(Self::Service {
                    name: props.str("name")?,
                    action,
                    revert,
                })
            }
            StepKind::File => Self::parse_file(&props),
            StepKind::User => Self::parse_user(&props),
            StepKind::Docker => Self::parse_docker(&props),
            StepKind::DockerCompose => {
                let action = match props.action()?.as_str() {
                    "up" => ComposeAction::Up,
                    "down" => ComposeAction::Down,
                    "build" => ComposeAction::Build,
                    other => return Err(props.invalid(format!("unknown compose action '{other}'"))),
                };
                Ok(Self::Compose {
                    file: props.str("file")?,
                    project: props.opt_str("project")?,
                    action,
                })
            }
            StepKind::Proxy => {
                let action = match props.action()?.as_str() {
                    "add" => ProxyAction::Add,
                    "update" => ProxyAction::Update,
                    "remove" => ProxyAction::Remove,
                    other => return Err(props.invalid(format!("unknown proxy action '{other}'"))),
                };
                let domain = proxy::domain::normalize(&props.str("domain")?).map_err(|error| props.invalid(error))?;
                let upstream = if action == ProxyAction::Remove {
                    None
                } else {
                    let port = props
                        .port("port")?
                        .ok_or_else(|| props.invalid("'port' is required"))?;
                    let host = props.opt_str("host")?.unwrap_or_else(|| "localhost".to_string());
                    Some(Upstream::new(host, port))
                };
                Ok(Self::Proxy {
                    action,
                    domain,
                    upstream,
                })
            }
        }
    }

    fn parse_file(props: &Props<'_>) -> Result<Self, ExtensionError> {
        let op = match props.action()?.as_str() {
            "move" => FileOp::Move {
                from: props.str("src")?,
                to: props.str("dest")?,
            },
            "copy" => FileOp::Copy {
                from: props.str("src")?,
                to: props.str("dest")?,
                mode: props.mode()?,
            },
            "upload" => FileOp::Upload {
                path: props.str("dest")?,
                contents: props.opt_str("content")?.unwrap_or_default(),
                mode: props.mode()?,
            },
            "delete" => FileOp::Delete {
                path: props.str("path")?,
                backup: props.bool("backup")?,
            },
            "mkdir" => FileOp::Mkdir {
                path: props.str("path")?,
            },
            other => return Err(props.invalid(format!("unknown file action '{other}'"))),
        };
        Ok(Self::File(op))
    }

    fn parse_user(props: &Props<'_>) -> Result<Self, ExtensionError> {
        let name = props.str("username")?;
        let groups = props.list("groups")?;
        let op = match props.action()?.as_str() {
            "ensure" | "create" => UserOp::Ensure {
                name,
                shell: props.opt_str("shell")?,
                home: props.opt_str("home")?,
                groups,
            },
            "delete" => UserOp::Delete { name },
            "modify" => {
                let shell = props.opt_str("shell")?;
                let home = props.opt_str("home")?;
                if shell.is_none() && home.is_none() {
                    return Err(props.invalid("modify needs 'shell' or 'home'"));
                }
                UserOp::Modify { name, shell, home }
            }
            "add_groups" | "remove_groups" if groups.is_empty() => {
                return Err(props.invalid("'groups' is required"));
            }
            "add_groups" => UserOp::AddGroups { name, groups },
            "remove_groups" => UserOp::RemoveGroups { name, groups },
            "check" => UserOp::Check { name },
            other => return Err(props.invalid(format!("unknown user action '{other}'"))),
        };
        Ok(Self::User(op))
    }

    fn parse_docker(props: &Props<'_>) -> Result<Self, ExtensionError> {
        let op = match props.action()?.as_str() {
            "pull" => DockerOp::Pull {
                image: props.str("image")?,
            },
            "run" => {
                let command = props.list("command")?;
                DockerOp::Run(ContainerSpec {
                    name: props.str("name")?,
                    image: props.str("image")?,
                    env: props.map("env")?,
                    network: props.opt_str("network")?,
                    exposed_port: props.port("port")?,
                    binds: props.list("volumes")?,
                    command: (!command.is_empty()).then_some(command),
                    ..ContainerSpec::default()
                })
            }
            "stop" => DockerOp::Stop {
                name: props.str("name")?,
            },
            "start" => DockerOp::Start {
                name: props.str("name")?,
            },
            "rm" | "remove" => DockerOp::Rm {
                name: props.str("name")?,
            },
            other => return Err(props.invalid(format!("unknown docker action '{other}'"))),
        };
        Ok(Self::Docker(op))
    }
}

/// The inverse of a completed step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Compensation {
    Command(String),
    RestoreFile {
        path: String,
        contents: Vec<u8>,
        mode: u32,
    },
    RemoveFile(String),
    Rename {
        from: String,
        to: String,
    },
    StartContainer(String),
    StopContainer(String),
    RemoveContainer(String),
    Proxy {
        domain: String,
        previous: Option<RouteEntry>,
    },
}

impl fmt::Display for Compensation {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command(command) => write!(formatter, "run `{command}`"),
            Self::RestoreFile { path, .. } => write!(formatter, "restore {path}"),
            Self::RemoveFile(path) => write!(formatter, "remove {path}"),
            Self::Rename { from, to } => write!(formatter, "move {from} back to {to}"),
            Self::StartContainer(name) => write!(formatter, "start container {name}"),
            Self::StopContainer(name) => write!(formatter, "stop container {name}"),
            Self::RemoveContainer(name) => write!(formatter, "remove container {name}"),
            Self::Proxy { domain, previous: None } => write!(formatter, "unroute {domain}"),
            Self::Proxy { domain, previous: Some(entry) } => {
                write!(formatter, "route {domain} back to {}", entry.upstream.dial())
            }
        }
    }
}

impl Compensation {
    /// # Errors
    /// Returns the failure of the undoing operation.
    pub async fn apply(&self, env: &StepEnv<'_>, timeout: Duration) -> Result<String, ExtensionError> {
        match self {
            Self::Command(command) => run(env.host, command, timeout).await,
            Self::RestoreFile { path, contents, mode } => {
                env.host.write_file(path, contents, *mode).await?;
                Ok(format!("restored {path}"))
            }
            Self::RemoveFile(path) => {
                env.host.remove_file(path).await?;
                Ok(format!("removed {path}"))
            }
            Self::Rename { from, to } => {
                env.host.rename(from, to).await?;
                Ok(format!("moved {from} to {to}"))
            }
            Self::StartContainer(name) => {
                env.containers.start_container(name).await?;
                Ok(format!("started {name}"))
            }
            Self::StopContainer(name) => {
                env.containers.stop_container(name).await?;
                Ok(format!("stopped {name}"))
            }
            Self::RemoveContainer(name) => {
                force_remove(env.containers, name).await?;
                Ok(format!("removed {name}"))
            }
            Self::Proxy { domain, previous } => {
                env.proxy.restore(domain, previous.clone()).await?;
                Ok(self.to_string())
            }
        }
    }
}

/// Result of a step that ran to completion.
#[derive(Debug, Default)]
pub struct StepOutcome {
    pub output: String,
    pub compensation: Option<Compensation>,
}

impl StepOutcome {
    fn new(output: impl Into<String>, compensation: Option<Compensation>) -> Self {
        Self {
            output: output.into(),
            compensation,
        }
    }
}

/// Runs `command` and fails on a non-zero exit.
async fn run(host: &dyn Host, command: &str, timeout: Duration) -> Result<String, ExtensionError> {
    let output = host.execute(&with_server_timeout(command, timeout), timeout).await?;
    if output.success() {
        Ok(output.combined())
    } else {
        Err(ExtensionError::CommandFailed {
            exit_code: output.exit_code,
            output: output.combined(),
        })
    }
}

/// Exit status of a probe; only the exit code matters.
async fn probe(host: &dyn Host, command: &str) -> Result<bool, HostError> {
    Ok(host.execute(command, SHORT_COMMAND_TIMEOUT).await?.success())
}

async fn force_remove(containers: &dyn ContainerPort, name: &str) -> Result<(), DockerError> {
    match containers.stop_container(name).await {
        Ok(()) | Err(DockerError::Conflict(_)) => {}
        Err(error) => return Err(error),
    }
    containers.remove_container(name).await
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PackageManager {
    Apt,
    Dnf,
    Yum,
    Apk,
    Pacman,
}

impl PackageManager {
    async fn detect(host: &dyn Host) -> Result<Self, ExtensionError> {
        let output = host
            .execute(
                "for pm in apt-get dnf yum apk pacman; do if command -v $pm >/dev/null 2>&1; then echo $pm; break; fi; done",
                SHORT_COMMAND_TIMEOUT,
            )
            .await?;
        match output.stdout.trim() {
            "apt-get" => Ok(Self::Apt),
            "dnf" => Ok(Self::Dnf),
            "yum" => Ok(Self::Yum),
            "apk" => Ok(Self::Apk),
            "pacman" => Ok(Self::Pacman),
            _ => Err(ExtensionError::Unsupported("no supported package manager on the host".to_string())),
        }
    }

    fn installed_probe(self, package: &str) -> String {
        let package = shell_quote(package);
        match self {
            Self::Apt => format!("dpkg -s {package} >/dev/null 2>&1"),
            Self::Dnf | Self::Yum => format!("rpm -q {package} >/dev/null 2>&1"),
            Self::Apk => format!("apk info -e {package} >/dev/null 2>&1"),
            Self::Pacman => format!("pacman -Q {package} >/dev/null 2>&1"),
        }
    }

    fn command(self, state: PackageState, package: &str) -> String {
        let package = shell_quote(package);
        match (self, state) {
            (Self::Apt, PackageState::Present) => {
                format!("apt-get update -qq && DEBIAN_FRONTEND=noninteractive apt-get install -y {package}")
            }
            (Self::Apt, PackageState::Absent) => format!("DEBIAN_FRONTEND=noninteractive apt-get remove -y {package}"),
            (Self::Apt, PackageState::Latest) => {
                format!("apt-get update -qq && DEBIAN_FRONTEND=noninteractive apt-get install --only-upgrade -y {package}")
            }
            (Self::Dnf, PackageState::Present) => format!("dnf install -y {package}"),
            (Self::Dnf, PackageState::Absent) => format!("dnf remove -y {package}"),
            (Self::Dnf, PackageState::Latest) => format!("dnf upgrade -y {package}"),
            (Self::Yum, PackageState::Present) => format!("yum install -y {package}"),
            (Self::Yum, PackageState::Absent) => format!("yum remove -y {package}"),
            (Self::Yum, PackageState::Latest) => format!("yum update -y {package}"),
            (Self::Apk, PackageState::Present) => format!("apk add --no-cache {package}"),
            (Self::Apk, PackageState::Absent) => format!("apk del {package}"),
            (Self::Apk, PackageState::Latest) => format!("apk add --no-cache --upgrade {package}"),
            (Self::Pacman, PackageState::Present | PackageState::Latest) => {
                format!("pacman -S --noconfirm --needed {package}")
            }
            (Self::Pacman, PackageState::Absent) => format!("pacman -R --noconfirm {package}"),
        }
    }
}

fn service_command(systemd: bool, name: &str, action: ServiceAction) -> String {
    let quoted = shell_quote(name);
    if systemd {
        return format!("systemctl {} {quoted}", action.as_str());
    }
    match action {
        ServiceAction::Enable => format!(
            "if command -v update-rc.d >/dev/null 2>&1; then update-rc.d {quoted} defaults; else chkconfig {quoted} on; fi"
        ),
        ServiceAction::Disable => format!(
            "if command -v update-rc.d >/dev/null 2>&1; then update-rc.d {quoted} disable; else chkconfig {quoted} off; fi"
        ),
        other => format!("service {quoted} {}", other.as_str()),
    }
}

fn delete_user_command(name: &str) -> String {
    let name = shell_quote(name);
    format!("if command -v userdel >/dev/null 2>&1; then userdel -r {name}; else deluser --remove-home {name}; fi")
}

fn remove_groups_command(name: &str, groups: &[String]) -> String {
    let name = shell_quote(name);
    groups
        .iter()
        .map(|group| format!("gpasswd -d {name} {}", shell_quote(group)))
        .collect::<Vec<_>>()
        .join(" && ")
}

fn add_groups_command(name: &str, groups: &[String]) -> String {
    format!("usermod -aG {} {}", shell_quote(&groups.join(",")), shell_quote(name))
}

fn compose_command(file: &str, project: Option<&str>, action: ComposeAction) -> String {
    let mut command = format!("docker compose -f {}", shell_quote(file));
    if let Some(project) = project {
        command.push_str(&format!(" -p {}", shell_quote(project)));
    }
    command.push_str(match action {
        ComposeAction::Up => " up -d",
        ComposeAction::Down => " down",
        ComposeAction::Build => " build",
    });
    command
}

impl StepAction {
    /// Performs the action. A `revert_cmd` replaces the built-in
    /// compensation.
    ///
    /// # Errors
    /// Returns the first failing host, container or proxy operation.
    pub async fn run(
        &self,
        env: &StepEnv<'_>,
        timeout: Duration,
        revert_cmd: Option<&str>,
    ) -> Result<StepOutcome, ExtensionError> {
        let mut outcome = match self {
            Self::Command { cmd, user } => {
                let command = match user {
                    Some(user) => format!("sudo -u {} sh -c {}", shell_quote(user), shell_quote(cmd)),
                    None => cmd.clone(),
                };
                StepOutcome::new(run(env.host, &command, timeout).await?, None)
            }
            Self::Package { name, state } => run_package(env.host, name, *state, timeout).await?,
            Self::Service { name, action, revert } => {
                let systemd = probe(env.host, "command -v systemctl >/dev/null 2>&1").await?;
                let output = run(env.host, &service_command(systemd, name, *action), timeout).await?;
                let compensation = revert
                    .or_else(|| action.inverse())
                    .map(|inverse| Compensation::Command(service_command(systemd, name, inverse)));
                StepOutcome::new(output, compensation)
            }
            Self::File(op) => run_file(env.host, op).await?,
            Self::User(op) => run_user(env.host, op, timeout).await?,
            Self::Docker(op) => run_docker(env, op).await?,
            Self::Compose { file, project, action } => {
                let output = run(env.host, &compose_command(file, project.as_deref(), *action), timeout).await?;
                let compensation = match action {
                    ComposeAction::Up => Some(ComposeAction::Down),
                    ComposeAction::Down => Some(ComposeAction::Up),
                    ComposeAction::Build => None,
                }
                .map(|inverse| Compensation::Command(compose_command(file, project.as_deref(), inverse)));
                StepOutcome::new(output, compensation)
            }
            Self::Proxy {
                action,
                domain,
                upstream,
            } => run_proxy(env, *action, domain, upstream.as_ref()).await?,
        };

        if let Some(revert) = revert_cmd {
            outcome.compensation = Some(Compensation::Command(revert.to_string()));
        }
        Ok(outcome)
    }
}

async fn run_package(
    host: &dyn Host,
    name: &str,
    state: PackageState,
    timeout: Duration,
) -> Result<StepOutcome, ExtensionError> {
    let manager = PackageManager::detect(host).await?;
    let installed = probe(host, &manager.installed_probe(name)).await?;
    let compensation = match state {
        PackageState::Present if !installed => Some(PackageState::Absent),
        PackageState::Absent if installed => Some(PackageState::Present),
        PackageState::Present | PackageState::Absent | PackageState::Latest => None,
    };

    let output = match state {
        PackageState::Present if installed => format!("{name} is already installed"),
        PackageState::Absent if !installed => format!("{name} is not installed"),
        _ => run(host, &manager.command(state, name), timeout).await?,
    };
    Ok(StepOutcome::new(
        output,
        compensation.map(|inverse| Compensation::Command(manager.command(inverse, name))),
    ))
}

/// Contents of `path` before it gets overwritten, if it existed.
async fn previous_contents(host: &dyn Host, path: &str) -> Result<Option<Vec<u8>>, HostError> {
    if host.exists(path).await? {
        host.read_file(path).await.map(Some)
    } else {
        Ok(None)
    }
}

fn overwrite_compensation(path: &str, previous: Option<Vec<u8>>, mode: u32) -> Compensation {
    match previous {
        Some(contents) => Compensation::RestoreFile {
            path: path.to_string(),
            contents,
            mode,
        },
        None => Compensation::RemoveFile(path.to_string()),
    }
}

async fn run_file(host: &dyn Host, op: &FileOp) -> Result<StepOutcome, ExtensionError> {
    match op {
        FileOp::Move { from, to } => {
            host.rename(from, to).await?;
            Ok(StepOutcome::new(
                format!("moved {from} to {to}"),
                Some(Compensation::Rename {
                    from: to.clone(),
                    to: from.clone(),
                }),
            ))
        }
        FileOp::Copy { from, to, mode } => {
            let contents = host.read_file(from).await?;
            let previous = previous_contents(host, to).await?;
            host.write_file(to, &contents, *mode).await?;
            Ok(StepOutcome::new(
                format!("copied {from} to {to}"),
                Some(overwrite_compensation(to, previous, *mode)),
            ))
        }
        FileOp::Upload { path, contents, mode } => {
            let previous = previous_contents(host, path).await?;
            host.write_file(path, contents.as_bytes(), *mode).await?;
            Ok(StepOutcome::new(
                format!("wrote {} bytes to {path}", contents.len()),
                Some(overwrite_compensation(path, previous, *mode)),
            ))
        }
        FileOp::Delete { path, backup } => {
            let compensation = if *backup {
                previous_contents(host, path).await?.map(|contents| Compensation::RestoreFile {
                    path: path.clone(),
                    contents,
                    mode: DEFAULT_FILE_MODE,
                })
            } else {
                None
            };
            host.remove_file(path).await?;
            Ok(StepOutcome::new(format!("deleted {path}"), compensation))
        }
        FileOp::Mkdir { path } => {
            let existed = host.exists(path).await?;
            host.create_dir_all(path).await?;
            let compensation = (!existed).then(|| Compensation::Command(format!("rmdir {}", shell_quote(path))));
            Ok(StepOutcome::new(format!("created {path}"), compensation))
        }
    }
}

async fn run_user(host: &dyn Host, op: &UserOp, timeout: Duration) -> Result<StepOutcome, ExtensionError> {
    match op {
        UserOp::Ensure {
            name,
            shell,
            home,
            groups,
        } => {
            let quoted = shell_quote(name);
            if probe(host, &format!("id -u {quoted} >/dev/null 2>&1")).await? {
                return Ok(StepOutcome::new(format!("user {name} exists"), None));
            }
            let mut useradd = String::from("useradd -m");
            let mut adduser = String::from("adduser -D");
            if let Some(shell) = shell {
                let shell = shell_quote(shell);
                useradd.push_str(&format!(" -s {shell}"));
                adduser.push_str(&format!(" -s {shell}"));
            }
            if let Some(home) = home {
                let home = shell_quote(home);
                useradd.push_str(&format!(" -d {home}"));
                adduser.push_str(&format!(" -h {home}"));
            }
            if !groups.is_empty() {
                useradd.push_str(&format!(" -G {}", shell_quote(&groups.join(","))));
            }
            let mut command = format!(
                "if command -v useradd >/dev/null 2>&1; then {useradd} {quoted}; else {adduser} {quoted}; fi"
            );
            if !groups.is_empty() {
                command.push_str(&format!(" && {}", add_groups_command(name, groups)));
            }
            let output = run(host, &command, timeout).await?;
            Ok(StepOutcome::new(
                output,
                Some(Compensation::Command(delete_user_command(name))),
            ))
        }
        UserOp::Delete { name } => Ok(StepOutcome::new(run(host, &delete_user_command(name), timeout).await?, None)),
        UserOp::Modify { name, shell, home } => {
            let mut command = String::from("usermod");
            if let Some(shell) = shell {
                command.push_str(&format!(" -s {}", shell_quote(shell)));
            }
            if let Some(home) = home {
                command.push_str(&format!(" -d {} -m", shell_quote(home)));
            }
            command.push_str(&format!(" {}", shell_quote(name)));
            Ok(StepOutcome::new(run(host, &command, timeout).await?, None))
        }
        UserOp::AddGroups { name, groups } => {
            let output = run(host, &add_groups_command(name, groups), timeout).await?;
            Ok(StepOutcome::new(
                output,
                Some(Compensation::Command(remove_groups_command(name, groups))),
            ))
        }
        UserOp::RemoveGroups { name, groups } => {
            let output = run(host, &remove_groups_command(name, groups), timeout).await?;
            Ok(StepOutcome::new(
                output,
                Some(Compensation::Command(add_groups_command(name, groups))),
            ))
        }
        UserOp::Check { name } => {
            let output = run(host, &format!("id {}", shell_quote(name)), timeout).await?;
            Ok(StepOutcome::new(output, None))
        }
    }
}

async fn run_docker(env: &StepEnv<'_>, op: &DockerOp) -> Result<StepOutcome, ExtensionError> {
    let containers = env.containers;
    match op {
        DockerOp::Pull { image } => {
            containers.pull_image(image, None).await?;
            Ok(StepOutcome::new(format!("pulled {image}"), None))
        }
        DockerOp::Run(spec) => {
            if !containers.image_exists(&spec.image).await? {
                containers.pull_image(&spec.image, None).await?;
            }
            let mut spec = spec.clone();
            spec.labels
                .insert(LABEL_ORGANIZATION_ID.to_string(), env.organization_id.to_string());
            spec.labels
                .insert(LABEL_EXTENSION_ID.to_string(), env.extension_id.to_string());
            let id = containers.create_container(&spec).await?;
            if let Err(error) = containers.start_container(&id).await {
                let _ = containers.remove_container(&id).await;
                return Err(error.into());
            }
            Ok(StepOutcome::new(
                format!("started {} ({id})", spec.name),
                Some(Compensation::RemoveContainer(spec.name.clone())),
            ))
        }
        DockerOp::Stop { name } => {
            containers.stop_container(name).await?;
            Ok(StepOutcome::new(
                format!("stopped {name}"),
                Some(Compensation::StartContainer(name.clone())),
            ))
        }
        DockerOp::Start { name } => {
            containers.start_container(name).await?;
            Ok(StepOutcome::new(
                format!("started {name}"),
                Some(Compensation::StopContainer(name.clone())),
            ))
        }
        DockerOp::Rm { name } => {
            force_remove(containers, name).await?;
            Ok(StepOutcome::new(format!("removed {name}"), None))
        }
    }
}

async fn run_proxy(
    env: &StepEnv<'_>,
    action: ProxyAction,
    domain: &str,
    upstream: Option<&Upstream>,
) -> Result<StepOutcome, ExtensionError> {
    let owner = env.route_owner();
    let previous = env.proxy.snapshot().await?.get(domain).cloned();
    let foreign = previous
        .as_ref()
        .is_some_and(|entry| !entry.owner.starts_with(EXTENSION_OWNER_PREFIX));
    let compensation = Some(Compensation::Proxy {
        domain: domain.to_string(),
        previous: previous.clone(),
    });

    match (action, upstream) {
        (ProxyAction::Add, Some(upstream)) => {
            env.proxy.add(domain, upstream.clone(), &owner).await?;
            Ok(StepOutcome::new(format!("routed {domain} to {}", upstream.dial()), compensation))
        }
        (ProxyAction::Update, Some(_)) | (ProxyAction::Remove, _) if foreign => {
            Err(ExtensionError::Unsupported(format!(
                "{domain} is routed for an application and cannot be changed by an extension"
            )))
        }
        (ProxyAction::Update, Some(upstream)) => {
            let entry = RouteEntry {
                upstream: upstream.clone(),
                owner,
            };
            env.proxy.restore(domain, Some(entry)).await?;
            Ok(StepOutcome::new(format!("routed {domain} to {}", upstream.dial()), compensation))
        }
        (ProxyAction::Remove, _) => {
            if previous.is_none() {
                return Ok(StepOutcome::new(format!("{domain} was not routed"), None));
            }
            env.proxy.remove(domain).await?;
            Ok(StepOutcome::new(format!("unrouted {domain}"), compensation))
        }
        (ProxyAction::Add | ProxyAction::Update, None) => Err(ExtensionError::InvalidStep {
            step: domain.to_string(),
            message: "an upstream is required".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::proxy::memory::MemoryProxy;
    use crate::testing::{FakeContainers, FakeHost};

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Env {
        host: FakeHost,
        containers: FakeContainers,
        backend: Arc<MemoryProxy>,
        proxy: ProxyManager,
    }

    impl Env {
        fn new() -> Self {
            let backend = Arc::new(MemoryProxy::default());
            Self {
                host: FakeHost::new(),
                containers: FakeContainers::new(),
                proxy: ProxyManager::new(backend.clone()),
                backend,
            }
        }

        fn step(&self) -> StepEnv<'_> {
            StepEnv {
                organization_id: "org-1",
                extension_id: "ext-1",
                host: &self.host,
                containers: &self.containers,
                proxy: &self.proxy,
            }
        }

        async fn run(&self, kind: StepKind, properties: Value) -> Result<StepOutcome, ExtensionError> {
            let properties: BTreeMap<String, Value> = serde_json::from_value(properties).expect("properties");
            let action = StepAction::parse("step", kind, &properties, None)?;
            action.run(&self.step(), TIMEOUT, None).await
        }
    }

    fn unwrap_command(compensation: Option<Compensation>) -> String {
        match compensation {
            Some(Compensation::Command(command)) => command,
            other => panic!("expected a command compensation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn commands_fail_on_non_zero_exit_and_run_as_the_requested_user() {
        let env = Env::new();
        env.host.respond("false-command", "boom", 3);

        let failed = env.run(StepKind::Command, json!({ "cmd": "false-command" })).await;
        assert!(matches!(failed, Err(ExtensionError::CommandFailed { exit_code: 3, .. })));

        env.run(StepKind::Command, json!({ "cmd": "whoami", "user": "deploy" }))
            .await
            .expect("command");
        assert!(env.host.commands().iter().any(|command| command.contains("sudo -u deploy")));
    }

    #[tokio::test]
    async fn installing_a_missing_package_compensates_with_removal() {
        let env = Env::new();
        env.host.respond("for pm in", "apt-get\n", 0);
        env.host.respond("dpkg -s", "", 1);

        let outcome = env
            .run(StepKind::Package, json!({ "name": "redis-server" }))
            .await
            .expect("install");
        assert!(env
            .host
            .commands()
            .iter()
            .any(|command| command.contains("apt-get install -y redis-server")));
        assert!(unwrap_command(outcome.compensation).contains("apt-get remove -y redis-server"));
    }

    #[tokio::test]
    async fn installed_packages_are_left_alone() {
        let env = Env::new();
        env.host.respond("for pm in", "apk\n", 0);

        let outcome = env.run(StepKind::Package, json!({ "name": "curl" })).await.expect("present");
        assert_eq!(outcome.output, "curl is already installed");
        assert!(outcome.compensation.is_none());
        assert!(!env.host.commands().iter().any(|command| command.contains("apk add")));

        let upgraded = env
            .run(StepKind::Package, json!({ "name": "curl", "state": "latest" }))
            .await
            .expect("latest");
        assert!(upgraded.compensation.is_none());
    }

    #[tokio::test]
    async fn unknown_package_managers_are_reported() {
        let env = Env::new();
        let result = env.run(StepKind::Package, json!({ "name": "curl" })).await;
        assert!(matches!(result, Err(ExtensionError::Unsupported(_))));
    }

    #[tokio::test]
    async fn services_compensate_with_the_inverse_or_the_revert_action() {
        let env = Env::new();
        let started = env
            .run(StepKind::Service, json!({ "name": "nginx", "action": "start" }))
            .await
            .expect("start");
        assert_eq!(unwrap_command(started.compensation), "systemctl stop nginx");

        let restarted = env
            .run(StepKind::Service, json!({ "name": "nginx", "action": "restart" }))
            .await
            .expect("restart");
        assert!(restarted.compensation.is_none());

        let properties = BTreeMap::from([
            ("name".to_string(), json!("nginx")),
            ("action".to_string(), json!("restart")),
        ]);
        let action = StepAction::parse("svc", StepKind::Service, &properties, Some("stop")).expect("parse");
        let outcome = action.run(&env.step(), TIMEOUT, None).await.expect("restart");
        assert_eq!(unwrap_command(outcome.compensation), "systemctl stop nginx");
    }

    #[tokio::test]
    async fn sysv_hosts_use_the_service_command() {
        let env = Env::new();
        env.host.respond("command -v systemctl", "", 1);
        let enabled = env
            .run(StepKind::Service, json!({ "name": "cron", "action": "enable" }))
            .await
            .expect("enable");
        assert!(env.host.commands().iter().any(|command| command.contains("update-rc.d cron defaults")));
        assert!(unwrap_command(enabled.compensation).contains("update-rc.d cron disable"));
    }

    #[tokio::test]
    async fn uploads_restore_previous_contents_and_new_files_are_removed() {
        let env = Env::new();
        env.host.put_file("/etc/app.conf", b"old");

        let overwritten = env
            .run(
                StepKind::File,
                json!({ "action": "upload", "dest": "/etc/app.conf", "content": "new", "mode": "0600" }),
            )
            .await
            .expect("upload");
        assert_eq!(env.host.file("/etc/app.conf").as_deref(), Some(&b"new"[..]));
        assert_eq!(env.host.file_mode("/etc/app.conf"), Some(0o600));
        let compensation = overwritten.compensation.expect("compensation");
        compensation.apply(&env.step(), TIMEOUT).await.expect("restore");
        assert_eq!(env.host.file("/etc/app.conf").as_deref(), Some(&b"old"[..]));

        let created = env
            .run(StepKind::File, json!({ "action": "upload", "dest": "/etc/new.conf", "content": "x" }))
            .await
            .expect("upload");
        assert_eq!(
            created.compensation,
            Some(Compensation::RemoveFile("/etc/new.conf".to_string()))
        );
    }

    #[tokio::test]
    async fn moves_reverse_and_deletes_only_restore_with_a_backup() {
        let env = Env::new();
        env.host.put_file("/tmp/a", b"data");

        let moved = env
            .run(StepKind::File, json!({ "action": "move", "src": "/tmp/a", "dest": "/tmp/b" }))
            .await
            .expect("move");
        moved.compensation.expect("rename").apply(&env.step(), TIMEOUT).await.expect("undo");
        assert!(env.host.file("/tmp/a").is_some());
        assert!(env.host.file("/tmp/b").is_none());

        let unrecoverable = env
            .run(StepKind::File, json!({ "action": "delete", "path": "/tmp/a" }))
            .await
            .expect("delete");
        assert!(unrecoverable.compensation.is_none());

        env.host.put_file("/tmp/c", b"keep");
        let backed_up = env
            .run(StepKind::File, json!({ "action": "delete", "path": "/tmp/c", "backup": true }))
            .await
            .expect("delete");
        assert!(env.host.file("/tmp/c").is_none());
        backed_up.compensation.expect("restore").apply(&env.step(), TIMEOUT).await.expect("undo");
        assert_eq!(env.host.file("/tmp/c").as_deref(), Some(&b"keep"[..]));
    }

    #[tokio::test]
    async fn ensuring_a_user_compensates_only_when_it_was_created() {
        let env = Env::new();
        let existing = env
            .run(StepKind::User, json!({ "action": "ensure", "username": "deploy" }))
            .await
            .expect("ensure");
        assert!(existing.compensation.is_none());

        env.host.respond("id -u app", "no such user", 1);
        let created = env
            .run(
                StepKind::User,
                json!({ "action": "ensure", "username": "app", "shell": "/bin/bash", "groups": ["docker"] }),
            )
            .await
            .expect("ensure");
        assert!(env.host.commands().iter().any(|command| command.contains("useradd -m -s /bin/bash -G docker app")));
        assert!(unwrap_command(created.compensation).contains("userdel -r app"));

        let grouped = env
            .run(StepKind::User, json!({ "action": "add_groups", "username": "app", "groups": "docker, sudo" }))
            .await
            .expect("groups");
        assert_eq!(
            unwrap_command(grouped.compensation),
            "gpasswd -d app docker && gpasswd -d app sudo"
        );
    }

    #[tokio::test]
    async fn docker_run_creates_a_labelled_container_and_compensates_by_removal() {
        let env = Env::new();
        let outcome = env
            .run(
                StepKind::Docker,
                json!({ "action": "run", "name": "redis", "image": "redis:7", "env": { "A": 1 }, "port": 6379 }),
            )
            .await
            .expect("run");
        assert!(env.containers.has_image("redis:7"));
        let container = env.containers.container("redis").expect("container");
        assert!(container.is_running());
        assert_eq!(container.labels[LABEL_EXTENSION_ID], "ext-1");
        assert_eq!(env.containers.created()[0].env["A"], "1");

        outcome.compensation.expect("remove").apply(&env.step(), TIMEOUT).await.expect("undo");
        assert!(env.containers.container("redis").is_none());
        assert_eq!(env.containers.removed(), vec!["redis".to_string()]);
    }

    #[tokio::test]
    async fn docker_stop_and_start_invert_each_other() {
        let env = Env::new();
        env.containers.add_container("web", "nginx", BTreeMap::new(), true);

        let stopped = env
            .run(StepKind::Docker, json!({ "action": "stop", "name": "web" }))
            .await
            .expect("stop");
        assert_eq!(stopped.compensation, Some(Compensation::StartContainer("web".to_string())));
        stopped.compensation.expect("start").apply(&env.step(), TIMEOUT).await.expect("undo");
        assert!(env.containers.container("web").expect("web").is_running());
    }

    #[tokio::test]
    async fn compose_up_compensates_with_down() {
        let env = Env::new();
        let outcome = env
            .run(
                StepKind::DockerCompose,
                json!({ "action": "up", "file": "/srv/stack/compose.yml", "project": "stack" }),
            )
            .await
            .expect("up");
        assert_eq!(
            unwrap_command(outcome.compensation),
            "docker compose -f /srv/stack/compose.yml -p stack down"
        );
    }

    #[tokio::test]
    async fn proxy_steps_restore_the_prior_route() {
        let env = Env::new();
        let added = env
            .run(StepKind::Proxy, json!({ "action": "add", "domain": "Admin.Example.com", "port": 8080 }))
            .await
            .expect("add");
        let route = &env.backend.routes()["admin.example.com"];
        assert_eq!(route.owner, "extension:ext-1");
        assert_eq!(route.upstream, Upstream::new("localhost", 8080));

        let updated = env
            .run(
                StepKind::Proxy,
                json!({ "action": "update", "domain": "admin.example.com", "host": "panel", "port": 9000 }),
            )
            .await
            .expect("update");
        updated.compensation.expect("restore").apply(&env.step(), TIMEOUT).await.expect("undo");
        assert_eq!(env.backend.routes()["admin.example.com"].upstream.port, 8080);

        added.compensation.expect("unroute").apply(&env.step(), TIMEOUT).await.expect("undo");
        assert!(env.backend.routes().is_empty());
    }

    #[tokio::test]
    async fn proxy_steps_cannot_touch_application_routes() {
        let env = Env::new();
        env.proxy
            .add("app.example.com", Upstream::new("app-1", 3000), "application-1")
            .await
            .expect("app route");

        let removed = env
            .run(StepKind::Proxy, json!({ "action": "remove", "domain": "app.example.com" }))
            .await;
        assert!(matches!(removed, Err(ExtensionError::Unsupported(_))));

        let added = env
            .run(StepKind::Proxy, json!({ "action": "add", "domain": "app.example.com", "port": 1 }))
            .await;
        assert!(matches!(added, Err(ExtensionError::Proxy(_))));
        assert_eq!(env.backend.routes()["app.example.com"].owner, "application-1");
    }

    #[test]
    fn malformed_properties_name_the_step() {
        let properties = BTreeMap::from([("action".to_string(), json!("upload"))]);
        let error = StepAction::parse("write-config", StepKind::File, &properties, None).expect_err("missing dest");
        assert_eq!(error.to_string(), "step write-config: 'dest' is required");

        let mode = BTreeMap::from([
            ("action".to_string(), json!("upload")),
            ("dest".to_string(), json!("/x")),
            ("mode".to_string(), json!(755)),
        ]);
        assert_eq!(
            StepAction::parse("m", StepKind::File, &mode, None).expect("mode"),
            StepAction::File(FileOp::Upload {
                path: "/x".to_string(),
                contents: String::new(),
                mode: 0o755,
            })
        );
    }
}
