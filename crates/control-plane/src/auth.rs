//! Who is calling, and what they may do inside the organization they name.
//!
//! Requests authenticate with either a session cookie or an
//! `Authorization: Bearer nxp_...` API key. Organization-scoped routes then
//! require `X-Organization-Id`, an active membership, and a
//! `(resource, action)` permission checked by the handler.

pub mod api_key;
pub mod cache;
mod middleware;

use std::sync::Arc;

use anyhow::anyhow;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{header, HeaderMap};
use chrono::Utc;
use tower_sessions::Session;
use tracing::warn;

use crate::config::ControlPlaneConfig;
use crate::db::{
    new_id, ApiKeyRecord, DbClient, EffectivePermissions, NewAuditLog, PermissionAction, UserRecord,
};
use crate::error::AppError;

use self::cache::PermissionCache;

pub use middleware::{feature_gate, require_organization, require_user};

pub const SESSION_USER_ID_KEY: &str = "user_id";
pub const ORGANIZATION_HEADER: &str = "x-organization-id";
const MIN_PASSWORD_LENGTH: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credential {
    Session,
    ApiKey { key_id: String, organization_id: String },
}

/// An authenticated user, before any organization is chosen.
#[derive(Clone, Debug)]
pub struct Principal {
    pub user: UserRecord,
    pub credential: Credential,
}

impl Principal {
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user.id
    }
}

/// A principal scoped to one organization with its effective permissions.
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub principal: Principal,
    pub organization_id: String,
    pub access: Arc<EffectivePermissions>,
}

impl AuthContext {
    #[must_use]
    pub fn user_id(&self) -> &str {
        self.principal.user_id()
    }

    #[must_use]
    pub fn can(&self, resource: &str, action: PermissionAction) -> bool {
        self.access
            .permissions
            .contains(&(resource.to_string(), action.to_string()))
    }

    /// # Errors
    /// Returns `Forbidden` naming the missing `resource:action` pair.
    pub fn require(&self, resource: &str, action: PermissionAction) -> Result<(), AppError> {
        if self.can(resource, action) {
            return Ok(());
        }
        Err(AppError::Forbidden(format!("missing permission {resource}:{action}")))
    }

    /// Audit entry attributed to this caller in this organization.
    #[must_use]
    pub fn audit(
        &self,
        resource: &str,
        action: PermissionAction,
        target_id: Option<&str>,
        payload_snapshot: serde_json::Value,
    ) -> NewAuditLog {
        NewAuditLog {
            actor_user_id: self.user_id().to_string(),
            organization_id: self.organization_id.clone(),
            resource: resource.to_string(),
            action: action.to_string(),
            target_id: target_id.map(ToString::to_string),
            payload_snapshot,
        }
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for AuthContext {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Self>()
            .cloned()
            .ok_or(AppError::AuthMissing)
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Principal {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Self>()
            .cloned()
            .ok_or(AppError::AuthMissing)
    }
}

#[derive(Clone)]
pub struct AuthService {
    db: DbClient,
    cache: Arc<PermissionCache>,
}

impl AuthService {
    #[must_use]
    pub fn new(db: DbClient, cache: PermissionCache) -> Self {
        Self {
            db,
            cache: Arc::new(cache),
        }
    }

    #[must_use]
    pub fn from_config(db: DbClient, config: &ControlPlaneConfig) -> Self {
        Self::new(
            db,
            PermissionCache::new(config.auth_cache_ttl(), config.auth_cache_capacity()),
        )
    }

    #[must_use]
    pub fn cache(&self) -> &PermissionCache {
        &self.cache
    }

    /// Bearer key when an `Authorization` header is present, otherwise the
    /// session's user.
    ///
    /// # Errors
    /// `AuthMissing` without credentials, `AuthInvalid` for bad ones.
    pub async fn authenticate(&self, headers: &HeaderMap, session: &Session) -> Result<Principal, AppError> {
        if let Some(authorization) = headers.get(header::AUTHORIZATION) {
            let token = authorization
                .to_str()
                .ok()
                .and_then(|value| value.strip_prefix("Bearer "))
                .map(str::trim)
                .ok_or_else(|| AppError::AuthInvalid("expected a Bearer API key".to_string()))?;
            return self.authenticate_api_key(token).await;
        }

        let user_id = session
            .get::<String>(SESSION_USER_ID_KEY)
            .await
            .map_err(|error| AppError::Internal(anyhow!("session store: {error}")))?
            .ok_or(AppError::AuthMissing)?;
        self.session_principal(&user_id).await
    }

    /// # Errors
    /// `AuthInvalid` if the user no longer exists.
    pub async fn session_principal(&self, user_id: &str) -> Result<Principal, AppError> {
        let user = self
            .db
            .get_user(user_id)
            .await?
            .ok_or_else(|| AppError::AuthInvalid("session user no longer exists".to_string()))?;
        Ok(Principal {
            user,
            credential: Credential::Session,
        })
    }

    /// Looks the key up by prefix and verifies the secret against its hash.
    ///
    /// # Errors
    /// `AuthInvalid` for malformed, unknown, revoked or wrong keys.
    pub async fn authenticate_api_key(&self, presented: &str) -> Result<Principal, AppError> {
        let invalid = || AppError::AuthInvalid("invalid API key".to_string());
        let (prefix, secret) = api_key::parse(presented).ok_or_else(invalid)?;
        let key = self.db.find_api_key_by_prefix(prefix).await?.ok_or_else(invalid)?;
        if !api_key::prefixes_match(&key.prefix, prefix) || !api_key::verify_secret(secret, &key.hashed_secret) {
            return Err(invalid());
        }

        let user = self.db.get_user(&key.user_id).await?.ok_or_else(invalid)?;

        let db = self.db.clone();
        let key_id = key.id.clone();
        tokio::spawn(async move {
            if let Err(error) = db.touch_api_key(&key_id).await {
                warn!(%key_id, error = %format!("{error:#}"), "failed to record API key use");
            }
        });

        Ok(Principal {
            user,
            credential: Credential::ApiKey {
                key_id: key.id,
                organization_id: key.organization_id,
            },
        })
    }

    /// Binds a principal to an organization.
    ///
    /// # Errors
    /// `Forbidden` when an API key names another organization or the user
    /// holds no role in this one.
    pub async fn scope(&self, principal: Principal, organization_id: &str) -> Result<AuthContext, AppError> {
        if let Credential::ApiKey {
            organization_id: key_organization,
            ..
        } = &principal.credential
        {
            if key_organization != organization_id {
                return Err(AppError::Forbidden(
                    "API key belongs to another organization".to_string(),
                ));
            }
        }

        let access = self.cache.load(&self.db, principal.user_id(), organization_id).await?;
        if access.roles.is_empty() {
            return Err(AppError::Forbidden(
                "not a member of this organization".to_string(),
            ));
        }

        Ok(AuthContext {
            principal,
            organization_id: organization_id.to_string(),
            access,
        })
    }

    /// # Errors
    /// Returns an error if the feature lookup fails.
    pub async fn require_feature(&self, organization_id: &str, feature: &str) -> Result<(), AppError> {
        if self.db.is_feature_enabled(organization_id, feature).await? {
            return Ok(());
        }
        Err(AppError::FeatureDisabled(feature.to_string()))
    }

    /// Issues a key bound to the caller's organization; the plaintext is
    /// returned once and never stored.
    ///
    /// # Errors
    /// Returns an error if hashing or the insert fails.
    pub async fn issue_api_key(&self, context: &AuthContext, label: &str) -> Result<(ApiKeyRecord, String), AppError> {
        let generated = api_key::generate()?;
        let record = ApiKeyRecord {
            id: new_id(),
            user_id: context.user_id().to_string(),
            organization_id: context.organization_id.clone(),
            prefix: generated.prefix.clone(),
            hashed_secret: generated.hashed_secret.clone(),
            label: label.to_string(),
            last_used_at: None,
            revoked_at: None,
            created_at: Utc::now(),
        };
        let audit = context.audit(
            "api_key",
            PermissionAction::Create,
            Some(&record.id),
            serde_json::json!({ "label": label, "prefix": record.prefix }),
        );
        self.db.insert_api_key(&record, &audit).await?;
        Ok((record, generated.plaintext))
    }

    pub fn invalidate_organization(&self, organization_id: &str) {
        self.cache.invalidate_organization(organization_id);
    }
}

/// Reads `X-Organization-Id`; absent or blank is a validation error.
///
/// # Errors
/// Returns `Validation` when the header is missing or empty.
pub fn organization_header(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get(ORGANIZATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| AppError::validation("X-Organization-Id header is required"))
}

/// # Errors
/// Returns `Validation` for short passwords and an internal error if hashing fails.
pub fn hash_password(password: &str) -> Result<String, AppError> {
    if password.len() < MIN_PASSWORD_LENGTH {
        return Err(AppError::validation(format!(
            "password must be at least {MIN_PASSWORD_LENGTH} characters"
        )));
    }
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|error| AppError::Internal(anyhow!("failed to hash password: {error}")))?;
    Ok(hash.to_string())
}

#[must_use]
pub fn verify_password(password: &str, password_hash: &str) -> bool {
    PasswordHash::new(password_hash).is_ok_and(|parsed| {
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::db::UserType;
    use crate::testing::{audit, seed_user, temp_db};

    async fn service_with_org() -> (AuthService, String, String) {
        let db = temp_db().await;
        let owner = seed_user(&db, "owner", UserType::Admin).await;
        let organization = db
            .create_organization("Acme", "acme", "", &owner)
            .await
            .expect("organization");
        let service = AuthService::new(db, PermissionCache::new(Duration::from_secs(60), 100));
        (service, owner, organization.id)
    }

    #[tokio::test]
    async fn viewers_are_denied_writes_with_the_missing_pair() {
        let (service, owner, organization_id) = service_with_org().await;
        let viewer = seed_user(&service.db, "viewer", UserType::Viewer).await;
        service
            .db
            .add_member(&organization_id, &viewer, "role-viewer", &audit(&owner, &organization_id, "organization", "update"))
            .await
            .expect("add member");

        let principal = service.session_principal(&viewer).await.expect("principal");
        let context = service.scope(principal, &organization_id).await.expect("scope");

        assert!(context.require("deploy", PermissionAction::Read).is_ok());
        let denied = context
            .require("deploy", PermissionAction::Create)
            .expect_err("viewer cannot deploy");
        assert_eq!(denied.to_string(), "missing permission deploy:create");
    }

    #[tokio::test]
    async fn non_members_are_forbidden() {
        let (service, _owner, organization_id) = service_with_org().await;
        let stranger = seed_user(&service.db, "stranger", UserType::Member).await;

        let principal = service.session_principal(&stranger).await.expect("principal");
        let error = service
            .scope(principal, &organization_id)
            .await
            .expect_err("not a member");
        assert!(matches!(error, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn api_keys_authenticate_only_within_their_organization() {
        let (service, owner, organization_id) = service_with_org().await;
        let principal = service.session_principal(&owner).await.expect("principal");
        let context = service.scope(principal, &organization_id).await.expect("scope");

        let (record, plaintext) = service.issue_api_key(&context, "ci").await.expect("issue");
        assert_ne!(record.hashed_secret, plaintext);

        let by_key = service.authenticate_api_key(&plaintext).await.expect("authenticate");
        assert_eq!(by_key.user_id(), owner);
        assert!(service.scope(by_key.clone(), &organization_id).await.is_ok());

        let elsewhere = service.scope(by_key, "another-org").await.expect_err("wrong org");
        assert!(matches!(elsewhere, AppError::Forbidden(_)));

        let tampered = format!("{plaintext}x");
        assert!(matches!(
            service.authenticate_api_key(&tampered).await,
            Err(AppError::AuthInvalid(_))
        ));
    }

    #[tokio::test]
    async fn revoked_keys_stop_working() {
        let (service, owner, organization_id) = service_with_org().await;
        let principal = service.session_principal(&owner).await.expect("principal");
        let context = service.scope(principal, &organization_id).await.expect("scope");
        let (record, plaintext) = service.issue_api_key(&context, "ci").await.expect("issue");

        service
            .db
            .revoke_api_key(&organization_id, &record.id, &audit(&owner, &organization_id, "api_key", "delete"))
            .await
            .expect("revoke");

        assert!(service.authenticate_api_key(&plaintext).await.is_err());
    }

    #[test]
    fn organization_header_must_be_present_and_non_blank() {
        let mut headers = HeaderMap::new();
        assert!(matches!(organization_header(&headers), Err(AppError::Validation(_))));

        headers.insert(ORGANIZATION_HEADER, "  ".parse().expect("header"));
        assert!(matches!(organization_header(&headers), Err(AppError::Validation(_))));

        headers.insert(ORGANIZATION_HEADER, " org-1 ".parse().expect("header"));
        assert_eq!(organization_header(&headers).expect("header"), "org-1");
    }

    #[test]
    fn passwords_hash_and_verify() {
        assert!(matches!(hash_password("short"), Err(AppError::Validation(_))));
        let hash = hash_password("correct horse").expect("hash");
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("wrong horse", &hash));
    }
}
