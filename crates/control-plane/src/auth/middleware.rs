use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tower_sessions::Session;

use crate::error::AppError;

use super::{organization_header, AuthContext, AuthService};

/// Authenticates the caller and stores the `Principal` on the request.
pub async fn require_user(
    State(auth): State<AuthService>,
    session: Session,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let principal = auth.authenticate(request.headers(), &session).await?;
    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}

/// Authenticates the caller, then scopes them to `X-Organization-Id` and
/// stores the resulting `AuthContext`.
pub async fn require_organization(
    State(auth): State<AuthService>,
    session: Session,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let principal = auth.authenticate(request.headers(), &session).await?;
    let organization_id = organization_header(request.headers())?;
    let context = auth.scope(principal, &organization_id).await?;

    request.extensions_mut().insert(context.principal.clone());
    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}

/// Rejects the request when the organization has the feature switched off.
/// Runs inside `require_organization`.
pub async fn feature_gate(
    State((auth, feature)): State<(AuthService, &'static str)>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let organization_id = request
        .extensions()
        .get::<AuthContext>()
        .map(|context| context.organization_id.clone())
        .ok_or(AppError::AuthMissing)?;
    auth.require_feature(&organization_id, feature).await?;
    Ok(next.run(request).await)
}
