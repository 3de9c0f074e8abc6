use axum::extract::State;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::auth::AuthContext;
use crate::db::{new_id, DomainRecord, PermissionAction, RepoCredentialRecord};
use crate::error::{is_unique_violation, ApiResult, AppError};
use crate::proxy::domain;

use super::{respond, required, AppState, Body, IdQuery, PageQuery, Params};

#[derive(Debug, Deserialize)]
pub(super) struct CreateDomainRequest {
    name: Option<String>,
}

#[derive(Deserialize)]
pub(super) struct RepoCredentialRequest {
    app_id: Option<String>,
    installation_id: Option<String>,
    private_key_pem: Option<String>,
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    client_secret: String,
    #[serde(default)]
    webhook_secret: String,
}

/// The stored credential without its secrets.
#[derive(Debug, Serialize)]
pub(super) struct RepoCredentialView {
    app_id: String,
    installation_id: String,
    client_id: String,
    has_client_secret: bool,
    has_webhook_secret: bool,
    updated_at: DateTime<Utc>,
}

pub(super) async fn create_domain(
    State(state): State<AppState>,
    context: AuthContext,
    Body(request): Body<CreateDomainRequest>,
) -> ApiResult<DomainRecord> {
    context.require("domain", PermissionAction::Create)?;
    let name = domain::normalize(required("name", request.name.as_deref())?)?;
    domain::ensure_points_here(&name, &state.allowed_domain_ips).await?;

    let audit = context.audit("domain", PermissionAction::Create, None, json!({ "name": name }));
    let record = state
        .db
        .create_domain(&context.organization_id, context.user_id(), &name, &audit)
        .await
        .map_err(|error| {
            if is_unique_violation(&error) {
                AppError::conflict(format!("domain {name} is already registered"))
            } else {
                AppError::Internal(error)
            }
        })?;
    respond("domain created", record)
}

pub(super) async fn list_domains(
    State(state): State<AppState>,
    context: AuthContext,
    Params(query): Params<PageQuery>,
) -> ApiResult<Vec<DomainRecord>> {
    context.require("domain", PermissionAction::Read)?;
    let domains = state
        .db
        .list_domains(&context.organization_id, query.page()?)
        .await?;
    respond("domains", domains)
}

pub(super) async fn delete_domain(
    State(state): State<AppState>,
    context: AuthContext,
    Params(query): Params<IdQuery>,
) -> ApiResult<DomainRecord> {
    context.require("domain", PermissionAction::Delete)?;
    let domain_id = query.id()?;
    let audit = context.audit("domain", PermissionAction::Delete, Some(domain_id), json!({}));
    let deleted = state
        .db
        .delete_domain(&context.organization_id, domain_id, &audit)
        .await?
        .ok_or_else(|| AppError::not_found(format!("domain {domain_id} not found")))?;
    respond("domain deleted", deleted)
}

/// Stores the organization's repository app credential, encrypting the
/// private key and both secrets.
pub(super) async fn put_repository_credentials(
    State(state): State<AppState>,
    context: AuthContext,
    Body(request): Body<RepoCredentialRequest>,
) -> ApiResult<RepoCredentialView> {
    context.require("repository", PermissionAction::Update)?;
    let app_id = required("app_id", request.app_id.as_deref())?;
    let installation_id = required("installation_id", request.installation_id.as_deref())?;
    let private_key = required("private_key_pem", request.private_key_pem.as_deref())?;
    if !private_key.contains("PRIVATE KEY") {
        return Err(AppError::validation("private_key_pem must be a PEM private key"));
    }

    let record = RepoCredentialRecord {
        id: new_id(),
        organization_id: context.organization_id.clone(),
        app_id: app_id.to_string(),
        installation_id: installation_id.to_string(),
        private_key_encrypted: state.secrets.encrypt(private_key)?,
        client_id: request.client_id.trim().to_string(),
        client_secret_encrypted: state.secrets.encrypt(&request.client_secret)?,
        webhook_secret_encrypted: state.secrets.encrypt(&request.webhook_secret)?,
        updated_at: Utc::now(),
    };
    let audit = context.audit(
        "repository",
        PermissionAction::Update,
        None,
        json!({ "app_id": record.app_id, "installation_id": record.installation_id }),
    );
    state.db.upsert_repo_credential(&record, &audit).await?;

    respond(
        "repository credentials saved",
        RepoCredentialView {
            app_id: record.app_id,
            installation_id: record.installation_id,
            client_id: record.client_id,
            has_client_secret: !request.client_secret.is_empty(),
            has_webhook_secret: !request.webhook_secret.is_empty(),
            updated_at: record.updated_at,
        },
    )
}

pub(super) async fn get_repository_credentials(
    State(state): State<AppState>,
    context: AuthContext,
) -> ApiResult<RepoCredentialView> {
    context.require("repository", PermissionAction::Read)?;
    let record = state
        .db
        .get_repo_credential(&context.organization_id)
        .await?
        .ok_or_else(|| AppError::not_found("no repository credentials configured"))?;
    let has_client_secret = !state.secrets.decrypt(&record.client_secret_encrypted)?.is_empty();
    let has_webhook_secret = !state.secrets.decrypt(&record.webhook_secret_encrypted)?.is_empty();

    respond(
        "repository credentials",
        RepoCredentialView {
            app_id: record.app_id,
            installation_id: record.installation_id,
            client_id: record.client_id,
            has_client_secret,
            has_webhook_secret,
            updated_at: record.updated_at,
        },
    )
}
