use axum::extract::State;
use serde::Deserialize;
use serde_json::json;

use crate::auth::{AuthContext, Principal};
use crate::db::{OrganizationRecord, PermissionAction, UserType};
use crate::deployment::naming::slugify;
use crate::error::{is_unique_violation, ApiResult, AppError};

use super::{respond, required, AppState, Body};

#[derive(Debug, Deserialize)]
pub(super) struct CreateOrganizationRequest {
    name: Option<String>,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct MemberRequest {
    user_id: Option<String>,
    role_id: Option<String>,
}

pub(super) async fn list_organizations(
    State(state): State<AppState>,
    principal: Principal,
) -> ApiResult<Vec<OrganizationRecord>> {
    let organizations = state
        .db
        .list_organizations_for_user(principal.user_id())
        .await?;
    respond("organizations", organizations)
}

/// Any non-viewer may found an organization and becomes its admin.
pub(super) async fn create_organization(
    State(state): State<AppState>,
    principal: Principal,
    Body(request): Body<CreateOrganizationRequest>,
) -> ApiResult<OrganizationRecord> {
    if principal.user.user_type == UserType::Viewer {
        return Err(AppError::Forbidden("missing permission organization:create".to_string()));
    }
    let name = required("name", request.name.as_deref())?;
    let slug = slugify(name).map_err(AppError::Validation)?;

    let organization = state
        .db
        .create_organization(name, &slug, request.description.trim(), principal.user_id())
        .await
        .map_err(|error| {
            if is_unique_violation(&error) {
                AppError::conflict(format!("organization '{slug}' already exists"))
            } else {
                AppError::Internal(error)
            }
        })?;
    respond("organization created", organization)
}

pub(super) async fn add_member(
    State(state): State<AppState>,
    context: AuthContext,
    Body(request): Body<MemberRequest>,
) -> ApiResult<serde_json::Value> {
    context.require("organization", PermissionAction::Update)?;
    let user_id = required("user_id", request.user_id.as_deref())?;
    let role_id = required("role_id", request.role_id.as_deref())?;

    if state.db.get_user(user_id).await?.is_none() {
        return Err(AppError::not_found(format!("user {user_id} not found")));
    }
    let role = state
        .db
        .get_role(role_id)
        .await?
        .filter(|role| {
            role.organization_id
                .as_deref()
                .is_none_or(|owner| owner == context.organization_id)
        })
        .ok_or_else(|| AppError::not_found(format!("role {role_id} not found")))?;

    let audit = context.audit(
        "organization",
        PermissionAction::Update,
        Some(user_id),
        json!({ "member_added": user_id, "role": role.name }),
    );
    let membership_id = state
        .db
        .add_member(&context.organization_id, user_id, &role.id, &audit)
        .await
        .map_err(|error| {
            if is_unique_violation(&error) {
                AppError::conflict("user already holds that role")
            } else {
                AppError::Internal(error)
            }
        })?;
    state.auth.invalidate_organization(&context.organization_id);

    respond(
        "member added",
        json!({ "id": membership_id, "user_id": user_id, "role_id": role.id }),
    )
}

pub(super) async fn remove_member(
    State(state): State<AppState>,
    context: AuthContext,
    Body(request): Body<MemberRequest>,
) -> ApiResult<()> {
    context.require("organization", PermissionAction::Update)?;
    let user_id = required("user_id", request.user_id.as_deref())?;
    if user_id == context.user_id() {
        return Err(AppError::validation("you cannot remove yourself from an organization"));
    }

    let audit = context.audit(
        "organization",
        PermissionAction::Update,
        Some(user_id),
        json!({ "member_removed": user_id }),
    );
    let removed = state
        .db
        .remove_member(&context.organization_id, user_id, &audit)
        .await?;
    if !removed {
        return Err(AppError::not_found(format!("user {user_id} is not a member")));
    }
    state.auth.invalidate_organization(&context.organization_id);
    respond("member removed", ())
}
