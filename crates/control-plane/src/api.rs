//! The `/api/v1` HTTP surface, plus `/health`, `/metrics` and the two
//! websocket endpoints.
//!
//! Every route under `/api/v1` answers with the [`Envelope`] shape. Routes
//! that act inside an organization run behind `require_organization`, and
//! each route group that maps to a feature flag adds a `feature_gate` layer.
//! Handlers check their own `(resource, action)` permission first.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRequest, FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tower_sessions::SessionManagerLayer;
use tower_sessions_sqlx_store::SqliteStore;

use crate::auth::{feature_gate, require_organization, require_user, AuthService};
use crate::crypto::SecretBox;
use crate::db::{DbClient, Page};
use crate::deployment::DeploymentService;
use crate::docker::ContainerRuntime;
use crate::error::{ApiResult, AppError, Envelope};
use crate::extension::ExtensionService;
use crate::live_sync::LiveSyncGateway;
use crate::realtime::RealtimeGateway;
use crate::request_logging;

mod access;
mod applications;
mod auth;
mod domains;
mod operations;
mod organizations;
mod ws;

#[cfg(test)]
mod tests;

pub const API_PREFIX: &str = "/api/v1";

/// Feature names a route group can be switched off by.
pub const FEATURES: &[&str] = &["deploy", "domain", "monitoring", "container", "extensions", "audit"];

#[derive(Clone)]
pub struct AppState {
    pub db: DbClient,
    pub auth: AuthService,
    pub deployments: DeploymentService,
    pub extensions: ExtensionService,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub secrets: SecretBox,
    pub realtime: RealtimeGateway,
    pub live_sync: LiveSyncGateway,
    pub allowed_domain_ips: Arc<Vec<String>>,
    pub metrics: Option<PrometheusHandle>,
}

#[must_use]
pub fn router(state: AppState, session_layer: SessionManagerLayer<SqliteStore>) -> Router {
    let auth = state.auth.clone();
    let gated = |feature: &'static str, routes: Router<AppState>| {
        routes.route_layer(middleware::from_fn_with_state((auth.clone(), feature), feature_gate))
    };

    let deploy = Router::new()
        .route(
            "/deploy/application",
            get(applications::get_application)
                .post(applications::create_application)
                .put(applications::update_application)
                .delete(applications::delete_application),
        )
        .route("/deploy/applications", get(applications::list_applications))
        .route("/deploy/application/redeploy", post(applications::redeploy))
        .route("/deploy/application/rollback", post(applications::rollback))
        .route("/deploy/application/restart", post(applications::restart))
        .route("/deploy/application/deployments", get(applications::list_deployments))
        .route("/deploy/deployment/logs", get(applications::deployment_logs))
        .route("/deploy/deployment/cancel", post(applications::cancel_deployment));

    let domain = Router::new().route(
        "/domains",
        get(domains::list_domains)
            .post(domains::create_domain)
            .delete(domains::delete_domain),
    );

    let monitoring = Router::new()
        .route(
            "/healthchecks",
            get(operations::list_healthchecks)
                .post(operations::create_healthcheck)
                .delete(operations::delete_healthcheck),
        )
        .route("/healthchecks/results", get(operations::healthcheck_results));

    let container = Router::new()
        .route("/containers", get(operations::list_containers))
        .route("/containers/start", post(operations::start_container))
        .route("/containers/stop", post(operations::stop_container))
        .route("/containers/restart", post(operations::restart_container))
        .route("/containers/remove", post(operations::remove_container))
        .route("/containers/logs", get(operations::container_logs))
        .route("/containers/images/prune", post(operations::prune_images));

    let extensions = Router::new()
        .route(
            "/extensions",
            get(operations::list_extensions).post(operations::create_extension),
        )
        .route("/extensions/run", post(operations::run_extension))
        .route("/extensions/executions", get(operations::list_executions));

    let audit = Router::new().route("/audit-logs", get(access::audit_logs));

    let organization_scoped = Router::new()
        .route(
            "/organizations/members",
            post(organizations::add_member).delete(organizations::remove_member),
        )
        .route(
            "/roles",
            get(access::list_roles)
                .post(access::create_role)
                .delete(access::delete_role),
        )
        .route(
            "/roles/permissions",
            post(access::grant_permission).delete(access::revoke_permission),
        )
        .route(
            "/api-keys",
            get(access::list_api_keys)
                .post(access::create_api_key)
                .delete(access::revoke_api_key),
        )
        .route(
            "/repository-credentials",
            get(domains::get_repository_credentials).put(domains::put_repository_credentials),
        )
        .route(
            "/feature-flags",
            get(access::list_feature_flags).put(access::set_feature_flag),
        )
        .merge(gated("deploy", deploy))
        .merge(gated("domain", domain))
        .merge(gated("monitoring", monitoring))
        .merge(gated("container", container))
        .merge(gated("extensions", extensions))
        .merge(gated("audit", audit))
        .route_layer(middleware::from_fn_with_state(state.auth.clone(), require_organization));

    let user_scoped = Router::new()
        .route("/auth/me", get(auth::me))
        .route(
            "/organizations",
            get(organizations::list_organizations).post(organizations::create_organization),
        )
        .route_layer(middleware::from_fn_with_state(state.auth.clone(), require_user));

    let api = Router::new()
        .route("/auth/setup", post(auth::setup))
        .route("/auth/login", post(auth::login))
        .route("/auth/logout", post(auth::logout))
        .merge(user_scoped)
        .merge(organization_scoped);

    Router::new()
        .nest(API_PREFIX, api)
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .route("/ws", get(ws::realtime))
        .route("/ws/live/:application_id", get(ws::live_sync))
        .fallback(not_found)
        .layer(middleware::from_fn(request_logging::log_request))
        .layer(session_layer)
        .with_state(state)
}

/// Builds the session layer over the control plane's own database.
///
/// # Errors
/// Returns an error if the session table cannot be created.
pub async fn session_layer(db: &DbClient, secure: bool) -> anyhow::Result<SessionManagerLayer<SqliteStore>> {
    let store = SqliteStore::new(db.pool());
    store.migrate().await?;
    Ok(SessionManagerLayer::new(store).with_secure(secure))
}

pub(crate) fn respond<T: Serialize>(message: impl Into<String>, data: T) -> ApiResult<T> {
    Ok(Json(Envelope::success(message, data)))
}

async fn health(State(state): State<AppState>) -> ApiResult<serde_json::Value> {
    state
        .db
        .users_count()
        .await
        .map_err(|error| AppError::TransientInfrastructure(format!("database unavailable: {error}")))?;
    respond(
        "ok",
        serde_json::json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }),
    )
}

#[allow(clippy::unused_async)]
async fn render_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, "metrics recorder is not installed".to_string()),
    }
}

#[allow(clippy::unused_async)]
async fn not_found() -> AppError {
    AppError::not_found("route not found")
}

/// JSON body whose rejection renders as a validation envelope.
pub struct Body<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for Body<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
{
    type Rejection = AppError;

    async fn from_request(request: Request, state: &S) -> Result<Self, Self::Rejection> {
        Json::<T>::from_request(request, state)
            .await
            .map(|Json(value)| Self(value))
            .map_err(|rejection| AppError::validation(rejection.body_text()))
    }
}

/// Query string whose rejection renders as a validation envelope.
pub struct Params<T>(pub T);

#[async_trait]
impl<S, T> FromRequestParts<S> for Params<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        axum::extract::Query::<T>::from_request_parts(parts, state)
            .await
            .map(|axum::extract::Query(value)| Self(value))
            .map_err(|rejection: QueryRejection| AppError::validation(rejection.body_text()))
    }
}

/// `?page=&page_size=`, both strings on the wire.
#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<String>,
    pub page_size: Option<String>,
}

impl PageQuery {
    /// # Errors
    /// `Validation` for values that are not whole numbers of at least one.
    pub fn page(&self) -> Result<Page, AppError> {
        let defaults = Page::default();
        Ok(Page {
            page: parse_bounded("page", self.page.as_deref(), defaults.page)?,
            page_size: parse_bounded("page_size", self.page_size.as_deref(), defaults.page_size)?
                .min(Page::MAX_PAGE_SIZE),
        })
    }
}

fn parse_bounded(name: &str, raw: Option<&str>, default: u32) -> Result<u32, AppError> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Ok(default);
    };
    match raw.parse::<u32>() {
        Ok(value) if value >= 1 => Ok(value),
        _ => Err(AppError::validation(format!("{name} must be a whole number of at least 1"))),
    }
}

/// `?id=` plus paging, for single-resource reads and child lists.
#[derive(Debug, Default, Deserialize)]
pub struct IdQuery {
    pub id: Option<String>,
    #[serde(flatten)]
    pub paging: PageQuery,
}

impl IdQuery {
    /// # Errors
    /// `Validation` when `id` is absent or blank.
    pub fn id(&self) -> Result<&str, AppError> {
        required("id", self.id.as_deref())
    }
}

/// `{"id": ...}` body of the action routes.
#[derive(Debug, Deserialize)]
pub struct IdBody {
    pub id: String,
}

/// A trimmed, non-empty value or a validation error naming the field.
pub(crate) fn required<'a>(field: &str, value: Option<&'a str>) -> Result<&'a str, AppError> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AppError::validation(format!("{field} is required")))
}
