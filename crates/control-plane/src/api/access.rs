//! Roles, permissions, API keys, feature flags and the audit trail.

use axum::extract::State;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::auth::AuthContext;
use crate::db::{
    ApiKeyRecord, AuditLogRecord, FeatureFlagRecord, PermissionAction, PermissionRecord, RoleRecord,
};
use crate::deployment::naming::slugify;
use crate::error::{is_unique_violation, ApiResult, AppError};

use super::{respond, required, AppState, Body, IdQuery, PageQuery, Params, FEATURES};

/// Resources a permission can name.
pub const RESOURCES: &[&str] = &[
    "deploy",
    "domain",
    "container",
    "organization",
    "role",
    "api_key",
    "repository",
    "feature_flags",
    "healthcheck",
    "extension",
    "audit",
    "user",
];

#[derive(Debug, Serialize)]
pub(super) struct RoleView {
    #[serde(flatten)]
    role: RoleRecord,
    permissions: Vec<PermissionRecord>,
}

#[derive(Debug, Deserialize)]
pub(super) struct CreateRoleRequest {
    name: Option<String>,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct PermissionRequest {
    role_id: Option<String>,
    resource: Option<String>,
    action: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct CreateApiKeyRequest {
    #[serde(default)]
    label: String,
}

#[derive(Debug, Serialize)]
pub(super) struct IssuedApiKey {
    key: ApiKeyRecord,
    /// Shown once.
    token: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct FeatureFlagRequest {
    feature_name: Option<String>,
    enabled: Option<bool>,
}

pub(super) async fn list_roles(State(state): State<AppState>, context: AuthContext) -> ApiResult<Vec<RoleView>> {
    context.require("role", PermissionAction::Read)?;
    let mut views = Vec::new();
    for role in state.db.list_roles(&context.organization_id).await? {
        let permissions = state.db.role_permissions(&role.id).await?;
        views.push(RoleView { role, permissions });
    }
    respond("roles", views)
}

pub(super) async fn create_role(
    State(state): State<AppState>,
    context: AuthContext,
    Body(request): Body<CreateRoleRequest>,
) -> ApiResult<RoleRecord> {
    context.require("role", PermissionAction::Create)?;
    let name = slugify(required("name", request.name.as_deref())?).map_err(AppError::Validation)?;

    let audit = context.audit("role", PermissionAction::Create, None, json!({ "name": name }));
    let role = state
        .db
        .create_role(&context.organization_id, &name, request.description.trim(), &audit)
        .await
        .map_err(|error| {
            if is_unique_violation(&error) {
                AppError::conflict(format!("role '{name}' already exists"))
            } else {
                AppError::Internal(error)
            }
        })?;
    respond("role created", role)
}

pub(super) async fn delete_role(
    State(state): State<AppState>,
    context: AuthContext,
    Params(query): Params<IdQuery>,
) -> ApiResult<()> {
    context.require("role", PermissionAction::Delete)?;
    let role = organization_role(&state, &context, query.id()?).await?;

    let audit = context.audit("role", PermissionAction::Delete, Some(&role.id), json!({ "name": role.name }));
    if !state.db.delete_role(&context.organization_id, &role.id, &audit).await? {
        return Err(AppError::not_found(format!("role {} not found", role.id)));
    }
    state.auth.invalidate_organization(&context.organization_id);
    respond("role deleted", ())
}

pub(super) async fn grant_permission(
    State(state): State<AppState>,
    context: AuthContext,
    Body(request): Body<PermissionRequest>,
) -> ApiResult<()> {
    context.require("role", PermissionAction::Update)?;
    let (role, resource, action) = permission_target(&state, &context, &request).await?;

    let audit = context.audit(
        "role",
        PermissionAction::Update,
        Some(&role.id),
        json!({ "granted": format!("{resource}:{action}") }),
    );
    state
        .db
        .grant_permission(&role.id, resource, action.as_str(), &audit)
        .await?;
    state.auth.invalidate_organization(&context.organization_id);
    respond("permission granted", ())
}

pub(super) async fn revoke_permission(
    State(state): State<AppState>,
    context: AuthContext,
    Body(request): Body<PermissionRequest>,
) -> ApiResult<()> {
    context.require("role", PermissionAction::Update)?;
    let (role, resource, action) = permission_target(&state, &context, &request).await?;

    let audit = context.audit(
        "role",
        PermissionAction::Update,
        Some(&role.id),
        json!({ "revoked": format!("{resource}:{action}") }),
    );
    let revoked = state
        .db
        .revoke_permission(&role.id, resource, action.as_str(), &audit)
        .await?;
    if !revoked {
        return Err(AppError::not_found(format!("role does not hold {resource}:{action}")));
    }
    state.auth.invalidate_organization(&context.organization_id);
    respond("permission revoked", ())
}

async fn permission_target<'a>(
    state: &AppState,
    context: &AuthContext,
    request: &'a PermissionRequest,
) -> Result<(RoleRecord, &'a str, PermissionAction), AppError> {
    let role_id = required("role_id", request.role_id.as_deref())?;
    let resource = required("resource", request.resource.as_deref())?;
    if !RESOURCES.contains(&resource) {
        return Err(AppError::validation(format!("unknown resource '{resource}'")));
    }
    let action = required("action", request.action.as_deref())?
        .parse::<PermissionAction>()
        .map_err(|error| AppError::validation(error.to_string()))?;
    let role = organization_role(state, context, role_id).await?;
    Ok((role, resource, action))
}

/// A role owned by the caller's organization. Global roles are read-only.
async fn organization_role(state: &AppState, context: &AuthContext, role_id: &str) -> Result<RoleRecord, AppError> {
    let role = state
        .db
        .get_role(role_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("role {role_id} not found")))?;
    match role.organization_id.as_deref() {
        Some(owner) if owner == context.organization_id => Ok(role),
        None => Err(AppError::Forbidden("global roles cannot be changed".to_string())),
        Some(_) => Err(AppError::not_found(format!("role {role_id} not found"))),
    }
}

pub(super) async fn create_api_key(
    State(state): State<AppState>,
    context: AuthContext,
    Body(request): Body<CreateApiKeyRequest>,
) -> ApiResult<IssuedApiKey> {
    context.require("api_key", PermissionAction::Create)?;
    let (key, token) = state.auth.issue_api_key(&context, request.label.trim()).await?;
    respond("API key created", IssuedApiKey { key, token })
}

pub(super) async fn list_api_keys(
    State(state): State<AppState>,
    context: AuthContext,
) -> ApiResult<Vec<ApiKeyRecord>> {
    context.require("api_key", PermissionAction::Read)?;
    let keys = state
        .db
        .list_api_keys(&context.organization_id, context.user_id())
        .await?;
    respond("API keys", keys)
}

pub(super) async fn revoke_api_key(
    State(state): State<AppState>,
    context: AuthContext,
    Params(query): Params<IdQuery>,
) -> ApiResult<()> {
    context.require("api_key", PermissionAction::Delete)?;
    let key_id = query.id()?;
    let audit = context.audit("api_key", PermissionAction::Delete, Some(key_id), json!({}));
    if !state
        .db
        .revoke_api_key(&context.organization_id, key_id, &audit)
        .await?
    {
        return Err(AppError::not_found(format!("API key {key_id} not found")));
    }
    respond("API key revoked", ())
}

/// Every known feature, with the stored value or the enabled default.
pub(super) async fn list_feature_flags(
    State(state): State<AppState>,
    context: AuthContext,
) -> ApiResult<Vec<FeatureFlagRecord>> {
    context.require("feature_flags", PermissionAction::Read)?;
    let stored = state.db.list_feature_flags(&context.organization_id).await?;
    let flags = FEATURES
        .iter()
        .map(|feature| FeatureFlagRecord {
            organization_id: context.organization_id.clone(),
            feature_name: (*feature).to_string(),
            enabled: stored
                .iter()
                .find(|flag| flag.feature_name == *feature)
                .is_none_or(|flag| flag.enabled),
        })
        .collect();
    respond("feature flags", flags)
}

pub(super) async fn set_feature_flag(
    State(state): State<AppState>,
    context: AuthContext,
    Body(request): Body<FeatureFlagRequest>,
) -> ApiResult<FeatureFlagRecord> {
    context.require("feature_flags", PermissionAction::Update)?;
    let feature = required("feature_name", request.feature_name.as_deref())?;
    if !FEATURES.contains(&feature) {
        return Err(AppError::validation(format!("unknown feature '{feature}'")));
    }
    let enabled = request
        .enabled
        .ok_or_else(|| AppError::validation("enabled is required"))?;

    let audit = context.audit(
        "feature_flags",
        PermissionAction::Update,
        Some(feature),
        json!({ "enabled": enabled }),
    );
    state
        .db
        .set_feature_flag(&context.organization_id, feature, enabled, &audit)
        .await?;
    respond(
        "feature flag updated",
        FeatureFlagRecord {
            organization_id: context.organization_id.clone(),
            feature_name: feature.to_string(),
            enabled,
        },
    )
}

pub(super) async fn audit_logs(
    State(state): State<AppState>,
    context: AuthContext,
    Params(query): Params<PageQuery>,
) -> ApiResult<Vec<AuditLogRecord>> {
    context.require("audit", PermissionAction::Read)?;
    let logs = state
        .db
        .list_audit_logs(&context.organization_id, query.page()?)
        .await?;
    respond("audit logs", logs)
}
