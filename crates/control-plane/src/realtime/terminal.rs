use std::io;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::message::{ServerMessage, TerminalSize};
use crate::host::{Host, HostError, ShellProcess};

pub const OUTPUT_ACTION: &str = "terminal_output";
pub const EXIT_ACTION: &str = "terminal_exit";

const READ_BUFFER: usize = 8 * 1024;

/// An interactive shell on the tenant's host. Output is pushed to the
/// connection as `terminal_output` frames; dropping the terminal ends the
/// shell.
pub struct Terminal {
    id: String,
    stdin: Box<dyn AsyncWrite + Send + Unpin>,
    reader: JoinHandle<()>,
    _guard: Box<dyn Send>,
}

impl Terminal {
    /// # Errors
    /// Returns the host error when no shell can be started.
    pub async fn open(id: &str, host: &dyn Host, outbound: mpsc::Sender<ServerMessage>) -> Result<Self, HostError> {
        let ShellProcess {
            stdin,
            mut stdout,
            guard,
        } = host.open_shell().await?;

        let terminal_id = id.to_string();
        let reader = tokio::spawn(async move {
            let mut buffer = vec![0_u8; READ_BUFFER];
            let mut pending = Vec::new();
            loop {
                let read = match stdout.read(&mut buffer).await {
                    Ok(0) | Err(_) => break,
                    Ok(read) => read,
                };
                pending.extend_from_slice(&buffer[..read]);
                let output = take_utf8(&mut pending);
                if output.is_empty() {
                    continue;
                }
                let frame = ServerMessage::new(OUTPUT_ACTION, json!({ "terminal_id": terminal_id, "output": output }));
                if outbound.send(frame).await.is_err() {
                    return;
                }
            }
            let _ = outbound
                .send(ServerMessage::new(EXIT_ACTION, json!({ "terminal_id": terminal_id })))
                .await;
        });

        Ok(Self {
            id: id.to_string(),
            stdin,
            reader,
            _guard: guard,
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// # Errors
    /// Returns the I/O error when the shell's stdin is gone.
    pub async fn write(&mut self, input: &str) -> io::Result<()> {
        self.stdin.write_all(input.as_bytes()).await?;
        self.stdin.flush().await
    }

    /// The shell channel carries no window-change requests, so the new size
    /// is applied with `stty` inside the shell.
    ///
    /// # Errors
    /// Rejects a zero dimension and returns the I/O error when the shell's
    /// stdin is gone.
    pub async fn resize(&mut self, size: TerminalSize) -> io::Result<()> {
        if size.rows == 0 || size.cols == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "rows and cols must be positive"));
        }
        self.write(&format!("stty rows {} cols {}\n", size.rows, size.cols)).await
    }
}

impl Drop for Terminal {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Drains the longest valid UTF-8 prefix; an incomplete trailing sequence
/// stays buffered for the next read. Invalid bytes are replaced.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    let valid = match std::str::from_utf8(pending) {
        Ok(_) => pending.len(),
        Err(error) if error.error_len().is_none() => error.valid_up_to(),
        Err(_) => pending.len(),
    };
    let rest = pending.split_off(valid);
    let output = String::from_utf8_lossy(pending).into_owned();
    *pending = rest;
    output
}
