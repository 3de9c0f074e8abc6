//! Shell, file and system access to the machines applications run on.
//!
//! Every tenant reaches its host through a [`HostProvider`]. Production uses
//! the SSH pool in [`ssh`]; a single-machine install can use [`local`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod local;
pub mod pool;
pub mod remote;
pub mod ssh;
pub mod system;

pub use system::{SystemReader, SystemSnapshot};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(15 * 60);
pub const SHORT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout and stderr joined for logs.
    #[must_use]
    pub fn combined(&self) -> String {
        match (self.stdout.trim(), self.stderr.trim()) {
            ("", stderr) => stderr.to_string(),
            (stdout, "") => stdout.to_string(),
            (stdout, stderr) => format!("{stdout}\n{stderr}"),
        }
    }
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum HostError {
    #[error("host unreachable: {0}")]
    Transient(String),
    #[error("host access refused: {0}")]
    Fatal(String),
    #[error("host connection for {0} is cooling down after a failure")]
    CoolingDown(String),
    #[error("timed out waiting for a host session")]
    AcquireTimeout,
    #[error("command timed out after {0:?}")]
    CommandTimeout(Duration),
    #[error("file operation failed: {0}")]
    File(String),
    #[error("no host configured for organization {0}")]
    NotConfigured(String),
}

impl HostError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::CoolingDown(_) | Self::AcquireTimeout | Self::CommandTimeout(_)
        )
    }
}

/// Sorts a connection failure message into transient or fatal.
#[must_use]
pub fn classify_connect_error(message: &str) -> HostError {
    const FATAL_MARKERS: [&str; 4] = [
        "Permission denied",
        "Host key verification failed",
        "REMOTE HOST IDENTIFICATION HAS CHANGED",
        "no matching host key type",
    ];

    if FATAL_MARKERS.iter().any(|marker| message.contains(marker)) {
        HostError::Fatal(message.to_string())
    } else {
        HostError::Transient(message.to_string())
    }
}

/// Interactive shell bound to a host. Dropping it ends the shell.
pub struct ShellProcess {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub guard: Box<dyn Send>,
}

impl std::fmt::Debug for ShellProcess {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("ShellProcess").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Host: Send + Sync {
    /// Runs `command` through `sh -c`, bounded by `timeout`.
    async fn execute(&self, command: &str, timeout: Duration) -> Result<CommandOutput, HostError>;

    /// Writes `contents` atomically (temporary file then rename) with `mode`,
    /// creating parent directories.
    async fn write_file(&self, path: &str, contents: &[u8], mode: u32) -> Result<(), HostError>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, HostError>;

    /// Removes a file. A missing file is not an error.
    async fn remove_file(&self, path: &str) -> Result<(), HostError>;

    async fn create_dir_all(&self, path: &str) -> Result<(), HostError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), HostError>;

    async fn exists(&self, path: &str) -> Result<bool, HostError>;

    /// Starts an interactive shell with a pseudo-terminal.
    async fn open_shell(&self) -> Result<ShellProcess, HostError>;
}

#[async_trait]
pub trait HostProvider: Send + Sync {
    async fn host_for(&self, organization_id: &str) -> Result<Arc<dyn Host>, HostError>;

    async fn system_reader_for(
        &self,
        organization_id: &str,
    ) -> Result<Arc<dyn SystemReader>, HostError>;

    /// Drops pooled connections for a tenant.
    async fn release_tenant(&self, organization_id: &str);
}

/// Quotes a value for a POSIX shell.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|character| character.is_ascii_alphanumeric() || "-_./=:@%+,".contains(character))
    {
        return value.to_string();
    }

    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Wraps a command with `timeout(1)` when the host has it.
#[must_use]
pub fn with_server_timeout(command: &str, timeout: Duration) -> String {
    let seconds = timeout.as_secs().max(1);
    let quoted = shell_quote(command);
    format!(
        "if command -v timeout >/dev/null 2>&1; then timeout {seconds} sh -c {quoted}; else sh -c {quoted}; fi"
    )
}

/// Parent directory of a slash-separated path.
#[must_use]
pub fn parent_dir(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    let index = trimmed.rfind('/')?;
    if index == 0 {
        return Some("/");
    }
    Some(&trimmed[..index])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_leaves_safe_words_alone() {
        assert_eq!(shell_quote("nginx"), "nginx");
        assert_eq!(shell_quote("/srv/app-1/main.rs"), "/srv/app-1/main.rs");
    }

    #[test]
    fn shell_quote_wraps_and_escapes_single_quotes() {
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's; rm -rf /"), r"'it'\''s; rm -rf /'");
        assert_eq!(shell_quote("$(whoami)"), "'$(whoami)'");
    }

    #[test]
    fn classify_connect_error_separates_fatal_from_transient() {
        assert!(matches!(
            classify_connect_error("root@10.0.0.1: Permission denied (publickey)."),
            HostError::Fatal(_)
        ));
        assert!(matches!(
            classify_connect_error("Host key verification failed."),
            HostError::Fatal(_)
        ));
        let transient = classify_connect_error("ssh: connect to host 10.0.0.1 port 22: Connection refused");
        assert!(transient.is_retryable());
    }

    #[test]
    fn server_timeout_wraps_quoted_command() {
        let wrapped = with_server_timeout("echo 'hi'", Duration::from_secs(30));
        assert!(wrapped.contains("timeout 30 sh -c 'echo '\\''hi'\\'''"));
    }

    #[test]
    fn parent_dir_handles_nested_and_root_paths() {
        assert_eq!(parent_dir("/srv/app/src/main.rs"), Some("/srv/app/src"));
        assert_eq!(parent_dir("/main.rs"), Some("/"));
        assert_eq!(parent_dir("main.rs"), None);
    }

    #[test]
    fn combined_output_joins_streams() {
        let output = CommandOutput {
            stdout: "built\n".to_string(),
            stderr: "warning\n".to_string(),
            exit_code: 0,
        };
        assert_eq!(output.combined(), "built\nwarning");
        assert!(output.success());
    }
}
