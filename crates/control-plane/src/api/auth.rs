use anyhow::anyhow;
use axum::extract::State;
use serde::{Deserialize, Serialize};
use tower_sessions::Session;
use tracing::info;

use crate::auth::{hash_password, verify_password, Principal, SESSION_USER_ID_KEY};
use crate::db::{new_id, NewUser, OrganizationRecord, UserRecord, UserType};
use crate::deployment::naming::slugify;
use crate::error::{ApiResult, AppError};

use super::{respond, required, AppState, Body};

#[derive(Debug, Deserialize)]
pub(super) struct SetupRequest {
    username: Option<String>,
    email: Option<String>,
    password: Option<String>,
    organization: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct LoginRequest {
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Serialize)]
pub(super) struct SessionView {
    user: UserRecord,
    organizations: Vec<OrganizationRecord>,
}

fn session_error(error: tower_sessions::session::Error) -> AppError {
    AppError::Internal(anyhow!("session store: {error}"))
}

/// Creates the first admin and their organization. Only allowed while no
/// user exists.
pub(super) async fn setup(
    State(state): State<AppState>,
    session: Session,
    Body(request): Body<SetupRequest>,
) -> ApiResult<SessionView> {
    if state.db.users_count().await? > 0 {
        return Err(AppError::conflict("setup has already been completed"));
    }

    let username = required("username", request.username.as_deref())?.to_string();
    let password_hash = hash_password(request.password.as_deref().unwrap_or_default())?;
    let organization_name = request
        .organization
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or("Default")
        .to_string();
    let slug = slugify(&organization_name).map_err(AppError::Validation)?;

    let user_id = new_id();
    state
        .db
        .insert_user(&NewUser {
            id: user_id.clone(),
            external_id: format!("local:{username}"),
            email: request.email.unwrap_or_default(),
            username,
            password_hash,
            user_type: UserType::Admin,
        })
        .await?;
    let organization = state
        .db
        .create_organization(&organization_name, &slug, "", &user_id)
        .await?;

    session.cycle_id().await.map_err(session_error)?;
    session
        .insert(SESSION_USER_ID_KEY, user_id.clone())
        .await
        .map_err(session_error)?;

    let user = state
        .db
        .get_user(&user_id)
        .await?
        .ok_or_else(|| AppError::Internal(anyhow!("user {user_id} vanished after setup")))?;
    info!(user_id = %user.id, organization_id = %organization.id, "initial admin created");
    respond(
        "setup complete",
        SessionView {
            user,
            organizations: vec![organization],
        },
    )
}

pub(super) async fn login(
    State(state): State<AppState>,
    session: Session,
    Body(request): Body<LoginRequest>,
) -> ApiResult<SessionView> {
    let invalid = || AppError::AuthInvalid("invalid username or password".to_string());
    let username = required("username", request.username.as_deref())?;
    let user = state
        .db
        .find_user_by_username(username)
        .await?
        .ok_or_else(invalid)?;
    if !verify_password(request.password.as_deref().unwrap_or_default(), &user.password_hash) {
        return Err(invalid());
    }

    session.cycle_id().await.map_err(session_error)?;
    session
        .insert(SESSION_USER_ID_KEY, user.id.clone())
        .await
        .map_err(session_error)?;

    let organizations = state.db.list_organizations_for_user(&user.id).await?;
    respond("logged in", SessionView { user, organizations })
}

pub(super) async fn logout(session: Session) -> ApiResult<()> {
    session.flush().await.map_err(session_error)?;
    respond("logged out", ())
}

pub(super) async fn me(State(state): State<AppState>, principal: Principal) -> ApiResult<SessionView> {
    let organizations = state
        .db
        .list_organizations_for_user(principal.user_id())
        .await?;
    respond(
        "current user",
        SessionView {
            user: principal.user,
            organizations,
        },
    )
}
