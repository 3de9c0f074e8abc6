//! Live-sync: source edits streamed from a developer machine into the
//! staging directory a dev service bind-mounts.
//!
//! Every client path is validated before it touches the host. Files are
//! buffered until all chunks arrive, verified against their SHA-256, then
//! written in one atomic host write.

pub mod dev_service;
pub mod path;
pub mod protocol;
pub mod receiver;


use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::AuthService;
use crate::db::{ApplicationRecord, DbClient, PermissionAction};
use crate::error::AppError;
use crate::host::{Host, HostProvider};
use crate::repository::staging_path;
use crate::telemetry;

use self::dev_service::{DevServiceManager, EnsureOutcome};
use self::protocol::{ClientMessage, FileChange, FileOperation, ProtocolError, ServerFrame};
use self::receiver::{sha256_hex, Transfers};

pub const READ_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_BUFFER: usize = 64;
const FILE_MODE: u32 = 0o644;

/// What to send back for one client frame.
#[derive(Debug, Default)]
pub struct Reply {
    pub frames: Vec<ServerFrame>,
    pub close: bool,
}

impl Reply {
    fn frame(frame: ServerFrame) -> Self {
        Self {
            frames: vec![frame],
            close: false,
        }
    }

    fn failure(error: &ProtocolError, path: Option<&str>) -> Self {
        Self {
            frames: vec![ServerFrame::from_error(error, path)],
            close: error.closes_session(),
        }
    }
}

/// One connected client syncing one application.
pub struct LiveSyncSession {
    application: ApplicationRecord,
    staging_dir: String,
    host: Arc<dyn Host>,
    dev: Arc<DevServiceManager>,
    transfers: Transfers,
}

impl LiveSyncSession {
    #[must_use]
    pub fn new(
        application: ApplicationRecord,
        staging_root: &str,
        host: Arc<dyn Host>,
        dev: Arc<DevServiceManager>,
    ) -> Self {
        let staging_dir = staging_path(
            staging_root,
            &application.user_id,
            application.environment,
            &application.id,
            application.base_path.as_deref(),
        );
        Self {
            application,
            staging_dir,
            host,
            dev,
            transfers: Transfers::default(),
        }
    }

    #[must_use]
    pub fn staging_dir(&self) -> &str {
        &self.staging_dir
    }

    pub async fn handle_text(&mut self, text: &str) -> Reply {
        match ClientMessage::parse(text) {
            Ok(message) => self.handle(message).await,
            Err(error) => Reply::failure(&error, None),
        }
    }

    pub async fn handle(&mut self, message: ClientMessage) -> Reply {
        match message {
            ClientMessage::Ping => Reply::frame(ServerFrame::pong()),
            ClientMessage::FileChange(change) => self.begin_file(change).await,
            ClientMessage::FileDelete(delete) => self.delete(&delete.path).await,
            ClientMessage::FileContent(chunk) => {
                let path = chunk.path.clone();
                if let Err(error) = path::validate_relative_path(&path) {
                    return Reply::failure(&error, Some(&path));
                }
                match self.transfers.accept(chunk) {
                    Ok(None) => Reply::default(),
                    Ok(Some(contents)) => {
                        let checksum = sha256_hex(&contents);
                        self.store(&path, &contents, &checksum).await
                    }
                    Err(error) => Reply::failure(&error, Some(&path)),
                }
            }
        }
    }

    async fn begin_file(&mut self, change: FileChange) -> Reply {
        if let Err(error) = path::validate_relative_path(&change.path) {
            return Reply::failure(&error, Some(&change.path));
        }
        if change.operation == FileOperation::Delete {
            return self.delete(&change.path).await;
        }

        self.transfers.reset(&change.path);
        if change.size > 0 {
            return Reply::default();
        }

        // Empty files have no chunks to wait for.
        let checksum = sha256_hex(&[]);
        if !change.checksum.is_empty() && !change.checksum.eq_ignore_ascii_case(&checksum) {
            return Reply::failure(&ProtocolError::ChecksumMismatch(change.path.clone()), Some(&change.path));
        }
        self.store(&change.path, &[], &checksum).await
    }

    async fn store(&mut self, relative: &str, contents: &[u8], checksum: &str) -> Reply {
        let target = match path::resolve(&self.staging_dir, relative) {
            Ok(target) => target,
            Err(error) => return Reply::failure(&error, Some(relative)),
        };
        if let Err(error) = self.host.write_file(&target, contents, FILE_MODE).await {
            warn!(application_id = %self.application.id, path = %relative, %error, "live-sync write failed");
            return Reply::failure(&ProtocolError::WriteFailed(error.to_string()), Some(relative));
        }
        debug!(application_id = %self.application.id, path = %relative, bytes = contents.len(), "file synced");

        let mut reply = Reply::frame(ServerFrame::ack(relative, checksum));
        if let Some(alert) = self.ensure_dev_service().await {
            reply.frames.push(alert);
        }
        reply
    }

    async fn delete(&mut self, relative: &str) -> Reply {
        let target = match path::resolve(&self.staging_dir, relative) {
            Ok(target) => target,
            Err(error) => return Reply::failure(&error, Some(relative)),
        };
        self.transfers.reset(relative);
        match self.host.remove_file(&target).await {
            Ok(()) => Reply::frame(ServerFrame::ack(relative, "")),
            Err(error) => Reply::failure(&ProtocolError::WriteFailed(error.to_string()), Some(relative)),
        }
    }

    async fn ensure_dev_service(&self) -> Option<ServerFrame> {
        match self.dev.ensure_started(&self.application).await {
            Ok(EnsureOutcome::Requested { failures }) if failures >= self.dev.settings().alert_after_failures => {
                Some(ServerFrame::error(
                    "dev_service_failed",
                    &format!("dev service failed to start {failures} times; retrying"),
                    None,
                ))
            }
            Ok(_) => None,
            Err(error) => {
                warn!(application_id = %self.application.id, %error, "dev service check failed");
                None
            }
        }
    }
}

/// Resolves the handshake of `/ws/live/{application_id}?token=`.
#[derive(Clone)]
pub struct LiveSyncGateway {
    db: DbClient,
    auth: AuthService,
    hosts: Arc<dyn HostProvider>,
    dev: Arc<DevServiceManager>,
}

impl LiveSyncGateway {
    #[must_use]
    pub fn new(db: DbClient, auth: AuthService, hosts: Arc<dyn HostProvider>, dev: Arc<DevServiceManager>) -> Self {
        Self { db, auth, hosts, dev }
    }

    #[must_use]
    pub fn dev_services(&self) -> &Arc<DevServiceManager> {
        &self.dev
    }

    /// Authenticates the API key, loads the application and checks the
    /// caller may deploy it.
    ///
    /// # Errors
    /// Auth failures, an unknown application, or an unreachable host.
    pub async fn open_session(&self, application_id: &str, token: Option<&str>) -> Result<LiveSyncSession, AppError> {
        let token = token.filter(|token| !token.is_empty()).ok_or(AppError::AuthMissing)?;
        let principal = self.auth.authenticate_api_key(token).await?;
        let application = self
            .db
            .get_application(application_id)
            .await?
            .ok_or_else(|| AppError::not_found("application not found"))?;
        let context = self.auth.scope(principal, &application.organization_id).await?;
        context.require("deploy", PermissionAction::Update)?;

        let host = self.hosts.host_for(&application.organization_id).await?;
        Ok(LiveSyncSession::new(
            application,
            &self.dev.settings().staging_root,
            host,
            Arc::clone(&self.dev),
        ))
    }
}

/// Drives one live-sync socket. A single task owns the sink; reads time out
/// after [`READ_TIMEOUT`] of silence.
pub async fn run_socket(socket: WebSocket, mut session: LiveSyncSession) {
    telemetry::websocket_connections("live_sync", 1.0);
    let application_id = session.application.id.clone();
    info!(%application_id, "live-sync session opened");

    let (mut sink, mut stream) = socket.split();
    let (outbound, mut queued) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
    let writer = tokio::spawn(async move {
        while let Some(message) = queued.recv().await {
            let closing = matches!(message, Message::Close(_));
            match tokio::time::timeout(WRITE_TIMEOUT, sink.send(message)).await {
                Ok(Ok(())) if !closing => {}
                _ => break,
            }
        }
    });

    'session: loop {
        let message = match tokio::time::timeout(READ_TIMEOUT, stream.next()).await {
            Err(_) => {
                info!(%application_id, "live-sync session idle, closing");
                break;
            }
            Ok(None | Some(Err(_)) | Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Ok(message))) => message,
        };

        let reply = match message {
            Message::Text(text) => session.handle_text(&text).await,
            Message::Binary(_) => Reply::failure(
                &ProtocolError::InvalidFrame("binary frames are not supported".to_string()),
                None,
            ),
            Message::Ping(_) | Message::Pong(_) | Message::Close(_) => continue,
        };

        for frame in reply.frames {
            if outbound.send(Message::Text(frame.to_json())).await.is_err() {
                break 'session;
            }
        }
        if reply.close {
            break;
        }
    }

    let _ = outbound.send(Message::Close(None)).await;
    drop(outbound);
    let _ = writer.await;
    telemetry::websocket_connections("live_sync", -1.0);
    info!(%application_id, "live-sync session closed");
}
