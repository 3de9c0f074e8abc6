use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use openssh::{Session, Stdio};
use openssh_sftp_client::{Sftp, SftpOptions};
use tracing::warn;

use super::pool::{Lease, SessionPool};
use super::ssh::OpensshConnector;
use super::{
    parent_dir, shell_quote, with_server_timeout, CommandOutput, Host, HostError, ShellProcess,
    SHORT_COMMAND_TIMEOUT,
};

/// Slack on top of the server-side `timeout(1)` before the client gives up.
const CLIENT_GRACE: Duration = Duration::from_secs(5);

/// Commands over SSH exec channels, files over SFTP.
pub struct RemoteHost {
    pool: Arc<SessionPool<OpensshConnector>>,
}

impl RemoteHost {
    #[must_use]
    pub fn new(pool: Arc<SessionPool<OpensshConnector>>) -> Self {
        Self { pool }
    }

    async fn sftp(&self) -> Result<(Sftp, Lease<Session>), HostError> {
        let lease = self.pool.acquire().await?;
        let sftp = Sftp::from_clonable_session(lease.shared(), SftpOptions::default())
            .await
            .map_err(|error| HostError::Transient(format!("sftp session failed: {error}")))?;
        Ok((sftp, lease))
    }

    async fn transport_failed(&self, error: &openssh::Error) -> HostError {
        warn!(pool = %self.pool.name(), %error, "ssh transport failed; dropping connection");
        self.pool.drain().await;
        HostError::Transient(error.to_string())
    }
}

fn file_error(path: &str, error: &openssh_sftp_client::Error) -> HostError {
    HostError::File(format!("{path}: {error}"))
}

async fn close(sftp: Sftp) {
    if let Err(error) = sftp.close().await {
        warn!(%error, "failed to close sftp session");
    }
}

#[async_trait]
impl Host for RemoteHost {
    async fn execute(&self, command: &str, timeout: Duration) -> Result<CommandOutput, HostError> {
        let lease = self.pool.acquire().await?;
        let wrapped = with_server_timeout(command, timeout);
        let mut remote = lease.raw_command(&wrapped);
        let result = tokio::time::timeout(timeout + CLIENT_GRACE, remote.output())
            .await
            .map_err(|_| HostError::CommandTimeout(timeout))?;

        match result {
            Ok(output) => Ok(CommandOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: output.status.code().unwrap_or(-1),
            }),
            Err(error) => Err(self.transport_failed(&error).await),
        }
    }

    async fn write_file(&self, path: &str, contents: &[u8], mode: u32) -> Result<(), HostError> {
        if let Some(parent) = parent_dir(path) {
            self.create_dir_all(parent).await?;
        }

        let temporary = format!("{path}.nixopus-tmp");
        let (sftp, _lease) = self.sftp().await?;
        let mut fs = sftp.fs();
        let written = fs.write(&temporary, contents).await;
        drop(fs);
        close(sftp).await;
        written.map_err(|error| file_error(&temporary, &error))?;

        let chmod = format!("chmod {mode:o} {}", shell_quote(&temporary));
        let output = self.execute(&chmod, SHORT_COMMAND_TIMEOUT).await?;
        if !output.success() {
            return Err(HostError::File(format!("{temporary}: {}", output.combined())));
        }

        self.rename(&temporary, path).await
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, HostError> {
        let (sftp, _lease) = self.sftp().await?;
        let mut fs = sftp.fs();
        let contents = fs.read(path).await;
        drop(fs);
        close(sftp).await;
        Ok(contents.map_err(|error| file_error(path, &error))?.to_vec())
    }

    async fn remove_file(&self, path: &str) -> Result<(), HostError> {
        let (sftp, _lease) = self.sftp().await?;
        let mut fs = sftp.fs();
        let result = match fs.remove_file(path).await {
            Ok(()) => Ok(()),
            Err(error) => match fs.metadata(path).await {
                Err(_) => Ok(()),
                Ok(_) => Err(file_error(path, &error)),
            },
        };
        drop(fs);
        close(sftp).await;
        result
    }

    async fn create_dir_all(&self, path: &str) -> Result<(), HostError> {
        let (sftp, _lease) = self.sftp().await?;
        let mut fs = sftp.fs();
        let mut current = String::new();
        let mut result = Ok(());
        for component in path.split('/').filter(|component| !component.is_empty()) {
            current.push('/');
            current.push_str(component);
            if fs.metadata(&current).await.is_ok() {
                continue;
            }
            if let Err(error) = fs.create_dir(&current).await {
                if fs.metadata(&current).await.is_err() {
                    result = Err(file_error(&current, &error));
                    break;
                }
            }
        }
        drop(fs);
        close(sftp).await;
        result
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), HostError> {
        let (sftp, _lease) = self.sftp().await?;
        let mut fs = sftp.fs();
        let mut result = fs.rename(from, to).await;
        if result.is_err() {
            // SFTP v3 rename refuses to replace an existing target.
            let _ = fs.remove_file(to).await;
            result = fs.rename(from, to).await;
        }
        drop(fs);
        close(sftp).await;
        result.map_err(|error| file_error(to, &error))
    }

    async fn exists(&self, path: &str) -> Result<bool, HostError> {
        let (sftp, _lease) = self.sftp().await?;
        let mut fs = sftp.fs();
        let exists = fs.metadata(path).await.is_ok();
        drop(fs);
        close(sftp).await;
        Ok(exists)
    }

    async fn open_shell(&self) -> Result<ShellProcess, HostError> {
        let lease = self.pool.acquire().await?;
        let mut child = lease
            .shared()
            .arc_raw_command("script -qfc '/bin/sh -l' /dev/null")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .await
            .map_err(|error| HostError::Transient(error.to_string()))?;

        let stdin = child
            .stdin()
            .take()
            .ok_or_else(|| HostError::Transient("shell stdin unavailable".to_string()))?;
        let stdout = child
            .stdout()
            .take()
            .ok_or_else(|| HostError::Transient("shell stdout unavailable".to_string()))?;

        Ok(ShellProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            guard: Box::new((child, lease)),
        })
    }
}
