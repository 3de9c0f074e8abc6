//! `/deploy/*`: application records and the deployments that run them.

use std::collections::BTreeMap;

use axum::extract::State;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::auth::AuthContext;
use crate::db::{
    new_id, ApplicationRecord, ApplicationUpdate, BuildPack, DeploymentLogRecord, DeploymentRecord,
    DeploymentTrigger, Environment, NewApplication, PermissionAction, StringMap,
};
use crate::deployment::naming::slugify;
use crate::deployment::DeployOptions;
use crate::error::{is_unique_violation, ApiResult, AppError};
use crate::live_sync::path::validate_relative_path;
use crate::proxy::domain;
use crate::repository::{validate_ref, validate_repository_url};

use super::{respond, required, AppState, Body, IdBody, IdQuery, PageQuery, Params};

const DEFAULT_BRANCH: &str = "main";

/// Body of both create and update; update ignores `name` and `environment`.
#[derive(Debug, Default, Deserialize)]
pub(super) struct ApplicationRequest {
    id: Option<String>,
    name: Option<String>,
    family_id: Option<String>,
    repository: Option<String>,
    branch: Option<String>,
    build_pack: Option<String>,
    dockerfile_path: Option<String>,
    base_path: Option<String>,
    port: Option<u32>,
    domain: Option<String>,
    environment: Option<String>,
    framework: Option<String>,
    pre_run_command: Option<String>,
    post_run_command: Option<String>,
    build_variables: Option<BTreeMap<String, String>>,
    environment_variables: Option<BTreeMap<String, String>>,
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Serialize)]
pub(super) struct QueuedApplication {
    application: ApplicationRecord,
    deployment: DeploymentRecord,
}

#[derive(Debug, Deserialize)]
pub(super) struct RedeployRequest {
    #[serde(alias = "application_id")]
    id: String,
    #[serde(flatten)]
    options: DeployOptions,
}

#[derive(Debug, Deserialize)]
pub(super) struct RollbackRequest {
    #[serde(alias = "application_id")]
    id: String,
    deployment_id: Option<String>,
}

pub(super) async fn create_application(
    State(state): State<AppState>,
    context: AuthContext,
    Body(request): Body<ApplicationRequest>,
) -> ApiResult<QueuedApplication> {
    context.require("deploy", PermissionAction::Create)?;
    let application = new_application(&state, &context, request).await?;

    let audit = context.audit(
        "deploy",
        PermissionAction::Create,
        Some(&application.id),
        json!({
            "name": application.name,
            "repository": application.repository,
            "environment": application.environment,
        }),
    );
    let record = state
        .db
        .create_application(&application, &audit)
        .await
        .map_err(|error| {
            if is_unique_violation(&error) {
                AppError::conflict(format!(
                    "application '{}' already exists in {}",
                    application.name, application.environment
                ))
            } else {
                AppError::Internal(error)
            }
        })?;

    let deployment = state
        .deployments
        .queue(&record, DeploymentTrigger::Create, None, DeployOptions::default())
        .await?;
    respond(
        "application created",
        QueuedApplication {
            application: record,
            deployment,
        },
    )
}

async fn new_application(
    state: &AppState,
    context: &AuthContext,
    request: ApplicationRequest,
) -> Result<NewApplication, AppError> {
    let name = slugify(required("name", request.name.as_deref())?).map_err(AppError::Validation)?;
    let repository = required("repository", request.repository.as_deref())?.to_string();
    validate_repository_url(&repository).map_err(|error| AppError::validation(error.to_string()))?;
    let branch = request
        .branch
        .as_deref()
        .map(str::trim)
        .filter(|branch| !branch.is_empty())
        .unwrap_or(DEFAULT_BRANCH)
        .to_string();
    validate_ref(&branch).map_err(|error| AppError::validation(error.to_string()))?;

    let port = request
        .port
        .ok_or_else(|| AppError::validation("port is required"))
        .and_then(checked_port)?;
    let environment = match request.environment.as_deref() {
        Some(raw) => parse_field::<Environment>("environment", raw)?,
        None => Environment::Production,
    };
    let build_pack = match request.build_pack.as_deref() {
        Some(raw) => parse_field::<BuildPack>("build_pack", raw)?,
        None => BuildPack::Dockerfile,
    };

    if let Some(family_id) = request.family_id.as_deref() {
        state
            .db
            .get_application_in_organization(&context.organization_id, family_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("application family {family_id} not found")))?;
    }

    Ok(NewApplication {
        id: new_id(),
        organization_id: context.organization_id.clone(),
        user_id: context.user_id().to_string(),
        family_id: request.family_id,
        name,
        repository,
        branch,
        build_pack,
        dockerfile_path: checked_path("dockerfile_path", request.dockerfile_path)?,
        base_path: checked_path("base_path", request.base_path)?,
        port,
        domain: checked_domain(state, request.domain).await?,
        environment,
        framework: request.framework.filter(|framework| !framework.trim().is_empty()),
        pre_run_command: request.pre_run_command.unwrap_or_default(),
        post_run_command: request.post_run_command.unwrap_or_default(),
        build_variables: checked_variables("build_variables", request.build_variables)?.unwrap_or_default(),
        environment_variables: checked_variables("environment_variables", request.environment_variables)?
            .unwrap_or_default(),
        labels: StringMap(request.labels.unwrap_or_default()),
    })
}

/// Changes stored fields only; the next deployment picks them up.
pub(super) async fn update_application(
    State(state): State<AppState>,
    context: AuthContext,
    Body(request): Body<ApplicationRequest>,
) -> ApiResult<ApplicationRecord> {
    context.require("deploy", PermissionAction::Update)?;
    let application = application_in(&state, &context, required("id", request.id.as_deref())?).await?;

    if let Some(repository) = request.repository.as_deref() {
        validate_repository_url(repository).map_err(|error| AppError::validation(error.to_string()))?;
    }
    if let Some(branch) = request.branch.as_deref() {
        validate_ref(branch).map_err(|error| AppError::validation(error.to_string()))?;
    }
    let update = ApplicationUpdate {
        build_pack: request
            .build_pack
            .as_deref()
            .map(|raw| parse_field::<BuildPack>("build_pack", raw))
            .transpose()?,
        port: request.port.map(checked_port).transpose()?,
        dockerfile_path: checked_path("dockerfile_path", request.dockerfile_path)?,
        base_path: checked_path("base_path", request.base_path)?,
        domain: checked_domain(&state, request.domain).await?,
        build_variables: checked_variables("build_variables", request.build_variables)?,
        environment_variables: checked_variables("environment_variables", request.environment_variables)?,
        labels: request.labels.map(StringMap),
        repository: request.repository,
        branch: request.branch,
        framework: request.framework,
        pre_run_command: request.pre_run_command,
        post_run_command: request.post_run_command,
    };

    let audit = context.audit(
        "deploy",
        PermissionAction::Update,
        Some(&application.id),
        json!({ "updated": true }),
    );
    let updated = state
        .db
        .update_application(&context.organization_id, &application.id, &update, &audit)
        .await?
        .ok_or_else(|| AppError::not_found("application not found"))?;
    respond("application updated", updated)
}

pub(super) async fn delete_application(
    State(state): State<AppState>,
    context: AuthContext,
    Body(request): Body<IdBody>,
) -> ApiResult<()> {
    context.require("deploy", PermissionAction::Delete)?;
    let application = application_in(&state, &context, &request.id).await?;

    let audit = context.audit(
        "deploy",
        PermissionAction::Delete,
        Some(&application.id),
        json!({ "name": application.name }),
    );
    state.deployments.delete_application(&application, &audit).await?;
    state.live_sync.dev_services().forget(&application.id);
    respond("application deleted", ())
}

pub(super) async fn list_applications(
    State(state): State<AppState>,
    context: AuthContext,
    Params(query): Params<PageQuery>,
) -> ApiResult<Vec<ApplicationRecord>> {
    context.require("deploy", PermissionAction::Read)?;
    let applications = state
        .db
        .list_applications(&context.organization_id, query.page()?)
        .await?;
    respond("applications", applications)
}

pub(super) async fn get_application(
    State(state): State<AppState>,
    context: AuthContext,
    Params(query): Params<IdQuery>,
) -> ApiResult<ApplicationRecord> {
    context.require("deploy", PermissionAction::Read)?;
    let application = application_in(&state, &context, query.id()?).await?;
    respond("application", application)
}

pub(super) async fn redeploy(
    State(state): State<AppState>,
    context: AuthContext,
    Body(request): Body<RedeployRequest>,
) -> ApiResult<DeploymentRecord> {
    context.require("deploy", PermissionAction::Update)?;
    let application = application_in(&state, &context, &request.id).await?;
    if let Some(commit) = request.options.target_commit.as_deref() {
        validate_ref(commit).map_err(|error| AppError::validation(error.to_string()))?;
    }
    let deployment = state
        .deployments
        .queue(&application, DeploymentTrigger::Redeploy, None, request.options)
        .await?;
    respond("redeploy queued", deployment)
}

pub(super) async fn rollback(
    State(state): State<AppState>,
    context: AuthContext,
    Body(request): Body<RollbackRequest>,
) -> ApiResult<DeploymentRecord> {
    context.require("deploy", PermissionAction::Update)?;
    let application = application_in(&state, &context, &request.id).await?;
    let deployment = state
        .deployments
        .rollback(&application, request.deployment_id.as_deref())
        .await?;
    respond("rollback queued", deployment)
}

pub(super) async fn restart(
    State(state): State<AppState>,
    context: AuthContext,
    Body(request): Body<IdBody>,
) -> ApiResult<DeploymentRecord> {
    context.require("deploy", PermissionAction::Update)?;
    let application = application_in(&state, &context, &request.id).await?;
    let deployment = state.deployments.restart(&application).await?;
    respond("restart queued", deployment)
}

pub(super) async fn list_deployments(
    State(state): State<AppState>,
    context: AuthContext,
    Params(query): Params<IdQuery>,
) -> ApiResult<Vec<DeploymentRecord>> {
    context.require("deploy", PermissionAction::Read)?;
    let application = application_in(&state, &context, query.id()?).await?;
    let deployments = state
        .db
        .list_deployments(&application.id, query.paging.page()?)
        .await?;
    respond("deployments", deployments)
}

pub(super) async fn deployment_logs(
    State(state): State<AppState>,
    context: AuthContext,
    Params(query): Params<IdQuery>,
) -> ApiResult<Vec<DeploymentLogRecord>> {
    context.require("deploy", PermissionAction::Read)?;
    let deployment = deployment_in(&state, &context, query.id()?).await?;
    let logs = state
        .db
        .list_deployment_logs(&deployment.id, query.paging.page()?)
        .await?;
    respond("deployment logs", logs)
}

pub(super) async fn cancel_deployment(
    State(state): State<AppState>,
    context: AuthContext,
    Body(request): Body<IdBody>,
) -> ApiResult<DeploymentRecord> {
    context.require("deploy", PermissionAction::Update)?;
    let deployment = deployment_in(&state, &context, &request.id).await?;
    let deployment = state.deployments.cancel(&deployment.id).await?;
    respond("cancellation requested", deployment)
}

async fn application_in(
    state: &AppState,
    context: &AuthContext,
    application_id: &str,
) -> Result<ApplicationRecord, AppError> {
    state
        .db
        .get_application_in_organization(&context.organization_id, application_id)
        .await?
        .ok_or_else(|| AppError::not_found("application not found"))
}

async fn deployment_in(
    state: &AppState,
    context: &AuthContext,
    deployment_id: &str,
) -> Result<DeploymentRecord, AppError> {
    let deployment = state
        .db
        .get_deployment(deployment_id)
        .await?
        .ok_or_else(|| AppError::not_found("deployment not found"))?;
    application_in(state, context, &deployment.application_id)
        .await
        .map_err(|_| AppError::not_found("deployment not found"))?;
    Ok(deployment)
}

fn parse_field<T>(field: &str, raw: &str) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|error| AppError::validation(format!("{field}: {error}")))
}

fn checked_port(port: u32) -> Result<u16, AppError> {
    u16::try_from(port)
        .ok()
        .filter(|port| *port > 0)
        .ok_or_else(|| AppError::validation("port must be between 1 and 65535"))
}

fn checked_path(field: &str, path: Option<String>) -> Result<Option<String>, AppError> {
    let Some(path) = path.filter(|path| !path.trim().is_empty()) else {
        return Ok(None);
    };
    validate_relative_path(path.trim()).map_err(|error| AppError::validation(format!("{field}: {error}")))?;
    Ok(Some(path.trim().to_string()))
}

async fn checked_domain(state: &AppState, raw: Option<String>) -> Result<Option<String>, AppError> {
    let Some(raw) = raw.filter(|raw| !raw.trim().is_empty()) else {
        return Ok(None);
    };
    let name = domain::normalize(&raw)?;
    domain::ensure_points_here(&name, &state.allowed_domain_ips).await?;
    Ok(Some(name))
}

fn checked_variables(
    field: &str,
    variables: Option<BTreeMap<String, String>>,
) -> Result<Option<StringMap>, AppError> {
    let Some(variables) = variables else {
        return Ok(None);
    };
    if let Some(key) = variables
        .keys()
        .find(|key| key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
    {
        return Err(AppError::validation(format!("{field}: '{key}' is not a valid variable name")));
    }
    Ok(Some(StringMap(variables)))
}
