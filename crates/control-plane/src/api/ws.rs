//! Websocket upgrades. Callers are authorized before the upgrade so a bad
//! token answers with a normal error envelope.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use serde::Deserialize;
use tower_sessions::Session;

use crate::error::AppError;
use crate::{live_sync, realtime};

use super::{AppState, Params};

#[derive(Debug, Deserialize)]
pub(super) struct RealtimeQuery {
    token: Option<String>,
    #[serde(rename = "organization-id")]
    organization_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct LiveSyncQuery {
    token: Option<String>,
}

pub(super) async fn realtime(
    State(state): State<AppState>,
    Params(query): Params<RealtimeQuery>,
    headers: HeaderMap,
    session: Session,
    upgrade: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let context = state
        .realtime
        .authorize(
            query.token.as_deref(),
            query.organization_id.as_deref(),
            &headers,
            &session,
        )
        .await?;
    let gateway = state.realtime.clone();
    Ok(upgrade.on_upgrade(move |socket| realtime::run_socket(socket, gateway, context)))
}

pub(super) async fn live_sync(
    State(state): State<AppState>,
    Path(application_id): Path<String>,
    Params(query): Params<LiveSyncQuery>,
    upgrade: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let session = state
        .live_sync
        .open_session(&application_id, query.token.as_deref())
        .await?;
    Ok(upgrade.on_upgrade(move |socket| live_sync::run_socket(socket, session)))
}
