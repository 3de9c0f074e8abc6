//! Healthchecks, tenant containers and extensions.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::auth::AuthContext;
use crate::db::{
    new_id, ExtensionExecutionRecord, ExtensionRecord, HealthcheckKind, HealthcheckRecord, HealthcheckResultRecord,
    NewHealthcheck, PermissionAction,
};
use crate::docker::{label_filter, ContainerPort, ContainerSummary, LABEL_ORGANIZATION_ID};
use crate::error::{ApiResult, AppError};

use super::{respond, required, AppState, Body, IdBody, IdQuery, Params};

const DEFAULT_INTERVAL_SECONDS: u32 = 30;
const DEFAULT_TIMEOUT_SECONDS: u32 = 5;
const DEFAULT_THRESHOLD: u32 = 3;
const DEFAULT_LOG_TAIL: u32 = 200;
const MAX_LOG_TAIL: u32 = 5_000;
const LOGS_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
pub(super) struct HealthcheckRequest {
    application_id: Option<String>,
    kind: Option<String>,
    target: Option<String>,
    interval_seconds: Option<u32>,
    timeout_seconds: Option<u32>,
    threshold: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub(super) struct LogsQuery {
    id: Option<String>,
    tail: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct CreateExtensionRequest {
    spec: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub(super) struct RunExtensionRequest {
    extension_id: Option<String>,
    #[serde(default)]
    variables: BTreeMap<String, Value>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub(super) enum Executions {
    One(ExtensionExecutionRecord),
    Page(Vec<ExtensionExecutionRecord>),
}

pub(super) async fn create_healthcheck(
    State(state): State<AppState>,
    context: AuthContext,
    Body(request): Body<HealthcheckRequest>,
) -> ApiResult<HealthcheckRecord> {
    context.require("healthcheck", PermissionAction::Create)?;
    let application_id = required("application_id", request.application_id.as_deref())?;
    state
        .db
        .get_application_in_organization(&context.organization_id, application_id)
        .await?
        .ok_or_else(|| AppError::not_found("application not found"))?;

    let kind = match request.kind.as_deref() {
        Some(raw) => raw
            .parse::<HealthcheckKind>()
            .map_err(|error| AppError::validation(error.to_string()))?,
        None => HealthcheckKind::Http,
    };
    let target = required("target", request.target.as_deref())?;
    let interval_seconds = request.interval_seconds.unwrap_or(DEFAULT_INTERVAL_SECONDS);
    let timeout_seconds = request.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS);
    let threshold = request.threshold.unwrap_or(DEFAULT_THRESHOLD);
    if !(10..=3_600).contains(&interval_seconds) {
        return Err(AppError::validation("interval_seconds must be between 10 and 3600"));
    }
    if !(1..=60).contains(&timeout_seconds) || timeout_seconds >= interval_seconds {
        return Err(AppError::validation(
            "timeout_seconds must be between 1 and 60 and below the interval",
        ));
    }
    if !(1..=10).contains(&threshold) {
        return Err(AppError::validation("threshold must be between 1 and 10"));
    }

    let healthcheck = NewHealthcheck {
        id: new_id(),
        application_id: application_id.to_string(),
        kind,
        target: target.to_string(),
        interval_seconds,
        timeout_seconds,
        threshold,
    };
    let audit = context.audit(
        "healthcheck",
        PermissionAction::Create,
        Some(&healthcheck.id),
        json!({ "application_id": application_id, "kind": kind, "target": target }),
    );
    let record = state.db.create_healthcheck(&healthcheck, &audit).await?;
    respond("healthcheck created", record)
}

pub(super) async fn list_healthchecks(
    State(state): State<AppState>,
    context: AuthContext,
) -> ApiResult<Vec<HealthcheckRecord>> {
    context.require("healthcheck", PermissionAction::Read)?;
    let healthchecks = state.db.list_healthchecks(&context.organization_id).await?;
    respond("healthchecks", healthchecks)
}

pub(super) async fn delete_healthcheck(
    State(state): State<AppState>,
    context: AuthContext,
    Params(query): Params<IdQuery>,
) -> ApiResult<()> {
    context.require("healthcheck", PermissionAction::Delete)?;
    let healthcheck_id = query.id()?;
    let audit = context.audit("healthcheck", PermissionAction::Delete, Some(healthcheck_id), json!({}));
    if !state
        .db
        .delete_healthcheck(&context.organization_id, healthcheck_id, &audit)
        .await?
    {
        return Err(AppError::not_found(format!("healthcheck {healthcheck_id} not found")));
    }
    respond("healthcheck deleted", ())
}

pub(super) async fn healthcheck_results(
    State(state): State<AppState>,
    context: AuthContext,
    Params(query): Params<IdQuery>,
) -> ApiResult<Vec<HealthcheckResultRecord>> {
    context.require("healthcheck", PermissionAction::Read)?;
    let healthcheck = state
        .db
        .get_healthcheck(&context.organization_id, query.id()?)
        .await?
        .ok_or_else(|| AppError::not_found("healthcheck not found"))?;
    let results = state
        .db
        .list_healthcheck_results(&healthcheck.id, query.paging.page()?)
        .await?;
    respond("healthcheck results", results)
}

/// Containers labelled with the caller's organization.
pub(super) async fn list_containers(
    State(state): State<AppState>,
    context: AuthContext,
) -> ApiResult<Vec<ContainerSummary>> {
    context.require("container", PermissionAction::Read)?;
    let containers = state.runtime.containers_for(&context.organization_id).await?;
    let listed = containers
        .list_containers(&label_filter(LABEL_ORGANIZATION_ID, &context.organization_id))
        .await?;
    respond("containers", listed)
}

/// The tenant's daemon, once the container is known to belong to the tenant.
async fn owned_container(
    state: &AppState,
    context: &AuthContext,
    container: &str,
) -> Result<Arc<dyn ContainerPort>, AppError> {
    let containers = state.runtime.containers_for(&context.organization_id).await?;
    let summary = containers.inspect_container(container).await?;
    if summary.labels.get(LABEL_ORGANIZATION_ID) != Some(&context.organization_id) {
        return Err(AppError::not_found(format!("container {container} not found")));
    }
    Ok(containers)
}

pub(super) async fn start_container(
    State(state): State<AppState>,
    context: AuthContext,
    Body(request): Body<IdBody>,
) -> ApiResult<()> {
    context.require("container", PermissionAction::Update)?;
    owned_container(&state, &context, &request.id)
        .await?
        .start_container(&request.id)
        .await?;
    respond("container started", ())
}

pub(super) async fn stop_container(
    State(state): State<AppState>,
    context: AuthContext,
    Body(request): Body<IdBody>,
) -> ApiResult<()> {
    context.require("container", PermissionAction::Update)?;
    owned_container(&state, &context, &request.id)
        .await?
        .stop_container(&request.id)
        .await?;
    respond("container stopped", ())
}

pub(super) async fn restart_container(
    State(state): State<AppState>,
    context: AuthContext,
    Body(request): Body<IdBody>,
) -> ApiResult<()> {
    context.require("container", PermissionAction::Update)?;
    owned_container(&state, &context, &request.id)
        .await?
        .restart_container(&request.id)
        .await?;
    respond("container restarted", ())
}

pub(super) async fn remove_container(
    State(state): State<AppState>,
    context: AuthContext,
    Body(request): Body<IdBody>,
) -> ApiResult<()> {
    context.require("container", PermissionAction::Delete)?;
    owned_container(&state, &context, &request.id)
        .await?
        .remove_container(&request.id)
        .await?;
    respond("container removed", ())
}

/// Recent log lines; never follows.
pub(super) async fn container_logs(
    State(state): State<AppState>,
    context: AuthContext,
    Params(query): Params<LogsQuery>,
) -> ApiResult<Vec<String>> {
    context.require("container", PermissionAction::Read)?;
    let container = required("id", query.id.as_deref())?;
    let tail = match query.tail.as_deref().map(str::trim).filter(|tail| !tail.is_empty()) {
        Some(raw) => raw
            .parse::<u32>()
            .ok()
            .filter(|tail| *tail >= 1)
            .ok_or_else(|| AppError::validation("tail must be a whole number of at least 1"))?
            .min(MAX_LOG_TAIL),
        None => DEFAULT_LOG_TAIL,
    };

    let containers = owned_container(&state, &context, container).await?;
    let cancel = CancellationToken::new();
    let mut receiver = containers.container_logs(container, tail, false, cancel.clone()).await?;
    let deadline = tokio::time::Instant::now() + LOGS_TIMEOUT;
    let mut lines = Vec::new();
    while let Ok(Some(line)) = tokio::time::timeout_at(deadline, receiver.recv()).await {
        lines.push(line);
    }
    cancel.cancel();
    respond("container logs", lines)
}

pub(super) async fn prune_images(State(state): State<AppState>, context: AuthContext) -> ApiResult<Value> {
    context.require("container", PermissionAction::Delete)?;
    let containers = state.runtime.containers_for(&context.organization_id).await?;
    let reclaimed = containers.prune_dangling_images().await?;
    respond("dangling images pruned", json!({ "reclaimed_bytes": reclaimed }))
}

/// Accepts the extension document as YAML/JSON text or as a JSON object.
pub(super) async fn create_extension(
    State(state): State<AppState>,
    context: AuthContext,
    Body(request): Body<CreateExtensionRequest>,
) -> ApiResult<ExtensionRecord> {
    context.require("extension", PermissionAction::Create)?;
    let spec = match request.spec {
        Some(Value::String(text)) => text,
        Some(object @ Value::Object(_)) => serde_json::to_string(&object).map_err(anyhow::Error::from)?,
        Some(_) | None => return Err(AppError::validation("spec must be YAML/JSON text or an object")),
    };
    let extension = state.extensions.create(&context, &spec).await?;
    respond("extension created", extension)
}

pub(super) async fn list_extensions(
    State(state): State<AppState>,
    context: AuthContext,
) -> ApiResult<Vec<ExtensionRecord>> {
    context.require("extension", PermissionAction::Read)?;
    let extensions = state.extensions.list(&context.organization_id).await?;
    respond("extensions", extensions)
}

pub(super) async fn run_extension(
    State(state): State<AppState>,
    context: AuthContext,
    Body(request): Body<RunExtensionRequest>,
) -> ApiResult<ExtensionExecutionRecord> {
    context.require("extension", PermissionAction::Update)?;
    let extension_id = required("extension_id", request.extension_id.as_deref())?;
    let execution = state
        .extensions
        .run(&context, extension_id, &request.variables)
        .await?;
    respond("extension run queued", execution)
}

/// One execution with `?id=`, otherwise a page of them.
pub(super) async fn list_executions(
    State(state): State<AppState>,
    context: AuthContext,
    Params(query): Params<IdQuery>,
) -> ApiResult<Executions> {
    context.require("extension", PermissionAction::Read)?;
    if let Some(execution_id) = query.id.as_deref().filter(|id| !id.trim().is_empty()) {
        let execution = state
            .extensions
            .execution(&context.organization_id, execution_id.trim())
            .await?;
        return respond("extension execution", Executions::One(execution));
    }
    let executions = state
        .extensions
        .executions(&context.organization_id, query.paging.page()?)
        .await?;
    respond("extension executions", Executions::Page(executions))
}
