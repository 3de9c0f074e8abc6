use std::os::unix::fs::PermissionsExt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::system::LocalSystemReader;
use super::{parent_dir, CommandOutput, Host, HostError, HostProvider, ShellProcess, SystemReader};

/// The machine the control plane itself runs on.
#[derive(Clone, Debug, Default)]
pub struct LocalHost;

fn io_error(path: &str, error: &std::io::Error) -> HostError {
    HostError::File(format!("{path}: {error}"))
}

#[async_trait]
impl Host for LocalHost {
    async fn execute(&self, command: &str, timeout: Duration) -> Result<CommandOutput, HostError> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(timeout, child)
            .await
            .map_err(|_| HostError::CommandTimeout(timeout))?
            .map_err(|error| HostError::Transient(error.to_string()))?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn write_file(&self, path: &str, contents: &[u8], mode: u32) -> Result<(), HostError> {
        if let Some(parent) = parent_dir(path) {
            self.create_dir_all(parent).await?;
        }

        let temporary = format!("{path}.nixopus-tmp");
        tokio::fs::write(&temporary, contents)
            .await
            .map_err(|error| io_error(&temporary, &error))?;
        tokio::fs::set_permissions(&temporary, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|error| io_error(&temporary, &error))?;
        self.rename(&temporary, path).await
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, HostError> {
        tokio::fs::read(path).await.map_err(|error| io_error(path, &error))
    }

    async fn remove_file(&self, path: &str) -> Result<(), HostError> {
        match tokio::fs::remove_file(path).await {
            Err(error) if error.kind() != std::io::ErrorKind::NotFound => Err(io_error(path, &error)),
            _ => Ok(()),
        }
    }

    async fn create_dir_all(&self, path: &str) -> Result<(), HostError> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|error| io_error(path, &error))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), HostError> {
        tokio::fs::rename(from, to)
            .await
            .map_err(|error| io_error(to, &error))
    }

    async fn exists(&self, path: &str) -> Result<bool, HostError> {
        tokio::fs::try_exists(path)
            .await
            .map_err(|error| io_error(path, &error))
    }

    async fn open_shell(&self) -> Result<ShellProcess, HostError> {
        let mut child = Command::new("script")
            .args(["-qfc", "/bin/sh -l", "/dev/null"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| HostError::Transient(error.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HostError::Transient("shell stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HostError::Transient("shell stdout unavailable".to_string()))?;

        Ok(ShellProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            guard: Box::new(child),
        })
    }
}

/// Every tenant runs on this machine.
#[derive(Clone, Debug, Default)]
pub struct LocalHostProvider;

#[async_trait]
impl HostProvider for LocalHostProvider {
    async fn host_for(&self, _organization_id: &str) -> Result<Arc<dyn Host>, HostError> {
        Ok(Arc::new(LocalHost))
    }

    async fn system_reader_for(&self, _organization_id: &str) -> Result<Arc<dyn SystemReader>, HostError> {
        Ok(Arc::new(LocalSystemReader))
    }

    async fn release_tenant(&self, _organization_id: &str) {}
}
