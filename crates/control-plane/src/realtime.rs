//! The multiplex socket at `/ws`: topic subscriptions, host terminals and
//! periodic monitors over one connection.
//!
//! Client frames are handled in receive order by the connection's reader.
//! Everything sent to the client, replies and pushed frames alike, goes
//! through one bounded queue drained by a single writer task.

pub mod hub;
pub mod message;
pub mod monitor;
pub mod terminal;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::http::HeaderMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tower_sessions::Session;
use tracing::{debug, info, warn};

use crate::auth::{AuthContext, AuthService};
use crate::change_bus::TopicKey;
use crate::db::{ApplicationRecord, DbClient, PermissionAction};
use crate::docker::ContainerRuntime;
use crate::error::AppError;
use crate::host::HostProvider;
use crate::telemetry;

use self::hub::{ConnectionId, Hub};
use self::message::{ClientMessage, DashboardRequest, MessageError, ServerMessage};
use self::monitor::{MonitorConfig, MonitorHandle, MonitorTarget};
use self::terminal::Terminal;

pub const READ_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_BUFFER: usize = 256;

/// Change-bus tables a client may subscribe to, with the permission
/// resource guarding each.
const TOPICS: [(&str, &str); 3] = [
    ("deployments", "deploy"),
    ("deployment_logs", "deploy"),
    ("healthcheck_results", "healthcheck"),
];

#[derive(Clone)]
pub struct RealtimeGateway {
    db: DbClient,
    auth: AuthService,
    hosts: Arc<dyn HostProvider>,
    runtime: Arc<dyn ContainerRuntime>,
    hub: Hub,
}

impl RealtimeGateway {
    #[must_use]
    pub fn new(
        db: DbClient,
        auth: AuthService,
        hosts: Arc<dyn HostProvider>,
        runtime: Arc<dyn ContainerRuntime>,
        hub: Hub,
    ) -> Self {
        Self {
            db,
            auth,
            hosts,
            runtime,
            hub,
        }
    }

    #[must_use]
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Resolves the caller of `/ws?token=&organization-id=`. A token is an
    /// API key; without one the session cookie is used.
    ///
    /// # Errors
    /// `Validation` without an organization, otherwise the auth failures of
    /// [`AuthService`].
    pub async fn authorize(
        &self,
        token: Option<&str>,
        organization_id: Option<&str>,
        headers: &HeaderMap,
        session: &Session,
    ) -> Result<AuthContext, AppError> {
        let organization_id = organization_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AppError::Validation("organization-id is required".to_string()))?;

        let principal = match token.map(str::trim).filter(|token| !token.is_empty()) {
            Some(token) => self.auth.authenticate_api_key(token).await?,
            None => self.auth.authenticate(headers, session).await?,
        };
        self.auth.scope(principal, organization_id).await
    }

    async fn authorize_topic(&self, context: &AuthContext, topic: &str, resource_id: &str) -> Result<(), AppError> {
        let (_, resource) = TOPICS
            .iter()
            .find(|(name, _)| *name == topic)
            .ok_or_else(|| AppError::Validation(format!("unknown topic '{topic}'")))?;
        self.application_for(context, resource_id, resource).await.map(|_| ())
    }

    /// An application of the caller's organization, readable under `resource`.
    async fn application_for(
        &self,
        context: &AuthContext,
        application_id: &str,
        resource: &str,
    ) -> Result<ApplicationRecord, AppError> {
        context.require(resource, PermissionAction::Read)?;
        self.db
            .get_application(application_id)
            .await?
            .filter(|application| application.organization_id == context.organization_id)
            .ok_or_else(|| AppError::not_found("application not found"))
    }

    #[must_use]
    pub fn open_session(&self, context: AuthContext, outbound: mpsc::Sender<ServerMessage>) -> RealtimeSession {
        let id = self.hub.register(outbound.clone());
        RealtimeSession {
            id,
            context,
            gateway: self.clone(),
            outbound,
            terminals: HashMap::new(),
            dashboard: None,
            application_monitors: HashMap::new(),
        }
    }
}

/// Per-connection state. Dropped state is torn down by [`RealtimeSession::close`].
pub struct RealtimeSession {
    id: ConnectionId,
    context: AuthContext,
    gateway: RealtimeGateway,
    outbound: mpsc::Sender<ServerMessage>,
    terminals: HashMap<String, Terminal>,
    dashboard: Option<MonitorHandle>,
    application_monitors: HashMap<String, MonitorHandle>,
}

impl RealtimeSession {
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub fn terminal_count(&self) -> usize {
        self.terminals.len()
    }

    #[must_use]
    pub fn has_dashboard_monitor(&self) -> bool {
        self.dashboard.is_some()
    }

    /// Handles one client frame and returns the direct replies.
    pub async fn handle_text(&mut self, text: &str) -> Vec<ServerMessage> {
        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(error) => return vec![ServerMessage::error(&error.0)],
        };
        match self.handle(message).await {
            Ok(replies) => replies,
            Err(error) => vec![ServerMessage::error(&error.to_string())],
        }
    }

    async fn handle(&mut self, message: ClientMessage) -> Result<Vec<ServerMessage>, AppError> {
        match message {
            ClientMessage::Ping => Ok(vec![ServerMessage::pong()]),
            ClientMessage::Subscribe { topic, resource_id } => {
                self.gateway.authorize_topic(&self.context, &topic, &resource_id).await?;
                self.gateway
                    .hub
                    .subscribe(self.id, TopicKey::new(topic.as_str(), resource_id.as_str()));
                Ok(vec![
                    ServerMessage::new("subscribed", json!({ "resource_id": resource_id })).with_topic(&topic),
                ])
            }
            ClientMessage::Unsubscribe { topic, resource_id } => {
                self.gateway
                    .hub
                    .unsubscribe(self.id, &TopicKey::new(topic.as_str(), resource_id.as_str()));
                Ok(vec![
                    ServerMessage::new("unsubscribed", json!({ "resource_id": resource_id })).with_topic(&topic),
                ])
            }
            ClientMessage::Terminal(input) => {
                self.context.require("container", PermissionAction::Update)?;
                if !self.terminals.contains_key(&input.terminal_id) {
                    let host = self.gateway.hosts.host_for(&self.context.organization_id).await?;
                    let terminal = Terminal::open(&input.terminal_id, host.as_ref(), self.outbound.clone()).await?;
                    info!(connection = self.id, terminal_id = %input.terminal_id, "terminal opened");
                    self.terminals.insert(input.terminal_id.clone(), terminal);
                }
                if !input.value.is_empty() {
                    let written = self.terminal(&input.terminal_id)?.write(&input.value).await;
                    if let Err(error) = written {
                        return Err(self.terminal_gone(&input.terminal_id, &error));
                    }
                }
                Ok(Vec::new())
            }
            ClientMessage::TerminalResize(resize) => {
                let result = self.terminal(&resize.terminal_id)?.resize(resize.size).await;
                if let Err(error) = result {
                    if error.kind() == std::io::ErrorKind::InvalidInput {
                        return Err(AppError::Validation(error.to_string()));
                    }
                    return Err(self.terminal_gone(&resize.terminal_id, &error));
                }
                Ok(Vec::new())
            }
            ClientMessage::CloseTerminal { terminal_id } => {
                self.terminals.remove(&terminal_id);
                Ok(vec![ServerMessage::new(
                    terminal::EXIT_ACTION,
                    json!({ "terminal_id": terminal_id }),
                )])
            }
            ClientMessage::DashboardMonitor(request) => self.start_dashboard(&request),
            ClientMessage::StopDashboardMonitor => {
                if let Some(monitor) = self.dashboard.take() {
                    monitor.stop().await;
                }
                Ok(vec![ServerMessage::new("dashboard_monitor_stopped", json!({}))])
            }
            ClientMessage::MonitorApplication(request) => {
                let application = self
                    .gateway
                    .application_for(&self.context, &request.application_id, "deploy")
                    .await?;
                let current = self
                    .application_monitors
                    .get(&application.id)
                    .map_or_else(MonitorConfig::default, MonitorHandle::config);
                let interval = monitor::checked_interval(request.interval, current.interval).map_err(invalid)?;
                let config = MonitorConfig {
                    interval,
                    ..current
                };

                if let Some(running) = self.application_monitors.get(&application.id) {
                    running.update(config);
                } else {
                    let target = MonitorTarget::Application {
                        organization_id: self.context.organization_id.clone(),
                        application_id: application.id.clone(),
                        runtime: Arc::clone(&self.gateway.runtime),
                    };
                    let handle = monitor::spawn(target, config, self.outbound.clone());
                    self.application_monitors.insert(application.id.clone(), handle);
                }
                Ok(Vec::new())
            }
            ClientMessage::StopApplicationMonitor { application_id } => {
                if let Some(monitor) = self.application_monitors.remove(&application_id) {
                    monitor.stop().await;
                }
                Ok(Vec::new())
            }
        }
    }

    fn start_dashboard(&mut self, request: &DashboardRequest) -> Result<Vec<ServerMessage>, AppError> {
        self.context.require("container", PermissionAction::Read)?;
        let current = self
            .dashboard
            .as_ref()
            .map_or_else(MonitorConfig::default, MonitorHandle::config);
        let config = monitor::merge_config(&current, request.interval, request.operations.as_deref()).map_err(invalid)?;

        match &self.dashboard {
            Some(running) => running.update(config),
            None => {
                let target = MonitorTarget::Dashboard {
                    organization_id: self.context.organization_id.clone(),
                    runtime: Arc::clone(&self.gateway.runtime),
                    hosts: Arc::clone(&self.gateway.hosts),
                };
                self.dashboard = Some(monitor::spawn(target, config, self.outbound.clone()));
            }
        }
        Ok(Vec::new())
    }

    fn terminal(&mut self, terminal_id: &str) -> Result<&mut Terminal, AppError> {
        self.terminals
            .get_mut(terminal_id)
            .ok_or_else(|| AppError::not_found(format!("terminal {terminal_id} is not open")))
    }

    fn terminal_gone(&mut self, terminal_id: &str, error: &std::io::Error) -> AppError {
        self.terminals.remove(terminal_id);
        AppError::not_found(format!("terminal {terminal_id} closed: {error}"))
    }

    /// Unsubscribes everything and ends terminals and monitors.
    pub async fn close(mut self) {
        self.gateway.hub.remove_connection(self.id);
        self.terminals.clear();
        if let Some(monitor) = self.dashboard.take() {
            monitor.stop().await;
        }
        for (_, monitor) in self.application_monitors.drain() {
            monitor.stop().await;
        }
    }
}

fn invalid(error: MessageError) -> AppError {
    AppError::Validation(error.0)
}

/// Drives one multiplex socket until the client leaves or goes quiet for
/// [`READ_TIMEOUT`].
pub async fn run_socket(socket: WebSocket, gateway: RealtimeGateway, context: AuthContext) {
    telemetry::websocket_connections("realtime", 1.0);
    let (mut sink, mut stream) = socket.split();
    let (outbound, mut queued) = mpsc::channel::<ServerMessage>(OUTBOUND_BUFFER);
    let mut session = gateway.open_session(context, outbound.clone());
    let connection = session.id();
    info!(connection, user_id = %session.context.user_id(), "realtime connection opened");

    let writer = tokio::spawn(async move {
        while let Some(message) = queued.recv().await {
            let frame = Message::Text(message.to_json());
            match tokio::time::timeout(WRITE_TIMEOUT, sink.send(frame)).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    debug!(connection, %error, "realtime write failed");
                    break;
                }
                Err(_) => {
                    warn!(connection, "realtime write timed out");
                    break;
                }
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    loop {
        let message = match tokio::time::timeout(READ_TIMEOUT, stream.next()).await {
            Err(_) => {
                info!(connection, "realtime connection idle, closing");
                break;
            }
            Ok(None | Some(Err(_)) | Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Ok(message))) => message,
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Binary(_) => {
                if outbound.send(ServerMessage::error("binary frames are not supported")).await.is_err() {
                    break;
                }
                continue;
            }
            Message::Ping(_) | Message::Pong(_) | Message::Close(_) => continue,
        };
        let mut closed = false;
        for reply in session.handle_text(&text).await {
            if outbound.send(reply).await.is_err() {
                closed = true;
                break;
            }
        }
        if closed || writer.is_finished() {
            break;
        }
    }

    session.close().await;
    drop(outbound);
    let _ = writer.await;
    telemetry::websocket_connections("realtime", -1.0);
    info!(connection, "realtime connection closed");
}
