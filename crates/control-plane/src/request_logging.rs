use std::time::Instant;

use axum::body::{to_bytes, Body};
use axum::extract::MatchedPath;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use tracing::{info, warn};

use crate::api::API_PREFIX;
use crate::telemetry;

const BODY_READ_LIMIT_BYTES: usize = 1_048_576;
const SHORT_BODY_MAX_CHARS: usize = 160;

/// Bodies on these routes carry passwords, keys or secrets.
const REDACTED_ROUTES: &[&str] = &["/auth/", "/api-keys", "/repository-credentials"];

/// Logs one line per request with the handler name, status and latency.
pub async fn log_request(request: Request<Body>, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().as_str().to_string();
    let route = request.extensions().get::<MatchedPath>().map_or_else(
        || request.uri().path().to_string(),
        |matched_path| matched_path.as_str().to_string(),
    );

    let (parts, body) = request.into_parts();
    let (body_bytes, short_body) = match to_bytes(body, BODY_READ_LIMIT_BYTES).await {
        Ok(bytes) => {
            let shortened = if is_redacted(&route) && !bytes.is_empty() {
                "<redacted>".to_string()
            } else {
                shorten_request_body(&String::from_utf8_lossy(&bytes))
            };
            (bytes, shortened)
        }
        Err(_) => (
            axum::body::Bytes::new(),
            "<request-body-unavailable>".to_string(),
        ),
    };

    let handler = handler_name(&method, &route);
    let response = next.run(Request::from_parts(parts, Body::from(body_bytes))).await;

    let status = response.status().as_u16();
    let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    telemetry::http_request(handler, status, latency_ms);
    if response.status().is_server_error() {
        warn!(%method, %route, handler, status, latency_ms, body = %short_body, "request failed");
    } else {
        info!(%method, %route, handler, status, latency_ms, body = %short_body, "request");
    }
    response
}

fn is_redacted(route: &str) -> bool {
    REDACTED_ROUTES.iter().any(|fragment| route.contains(fragment))
}

fn shorten_request_body(raw_body: &str) -> String {
    if raw_body.is_empty() {
        return "-".to_string();
    }

    let single_line = raw_body
        .replace(['\r', '\n', '\t'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    if single_line.chars().count() <= SHORT_BODY_MAX_CHARS {
        return single_line;
    }

    let mut shortened = single_line
        .chars()
        .take(SHORT_BODY_MAX_CHARS)
        .collect::<String>();
    shortened.push_str("...");
    shortened
}

fn handler_name(method: &str, route: &str) -> &'static str {
    let api_route = route.strip_prefix(API_PREFIX).unwrap_or(route);
    match (method, api_route) {
        ("POST", "/auth/setup") => "auth.setup",
        ("POST", "/auth/login") => "auth.login",
        ("POST", "/auth/logout") => "auth.logout",
        ("GET", "/auth/me") => "auth.me",
        ("GET", "/organizations") => "organizations.list_organizations",
        ("POST", "/organizations") => "organizations.create_organization",
        ("POST", "/organizations/members") => "organizations.add_member",
        ("DELETE", "/organizations/members") => "organizations.remove_member",
        ("GET", "/roles") => "access.list_roles",
        ("POST", "/roles") => "access.create_role",
        ("DELETE", "/roles") => "access.delete_role",
        ("POST", "/roles/permissions") => "access.grant_permission",
        ("DELETE", "/roles/permissions") => "access.revoke_permission",
        ("GET", "/api-keys") => "access.list_api_keys",
        ("POST", "/api-keys") => "access.create_api_key",
        ("DELETE", "/api-keys") => "access.revoke_api_key",
        ("GET", "/feature-flags") => "access.list_feature_flags",
        ("PUT", "/feature-flags") => "access.set_feature_flag",
        ("GET", "/audit-logs") => "access.audit_logs",
        ("GET", "/repository-credentials") => "domains.get_repository_credentials",
        ("PUT", "/repository-credentials") => "domains.put_repository_credentials",
        ("GET", "/deploy/application") => "applications.get_application",
        ("POST", "/deploy/application") => "applications.create_application",
        ("PUT", "/deploy/application") => "applications.update_application",
        ("DELETE", "/deploy/application") => "applications.delete_application",
        ("GET", "/deploy/applications") => "applications.list_applications",
        ("POST", "/deploy/application/redeploy") => "applications.redeploy",
        ("POST", "/deploy/application/rollback") => "applications.rollback",
        ("POST", "/deploy/application/restart") => "applications.restart",
        ("GET", "/deploy/application/deployments") => "applications.list_deployments",
        ("GET", "/deploy/deployment/logs") => "applications.deployment_logs",
        ("POST", "/deploy/deployment/cancel") => "applications.cancel_deployment",
        ("GET", "/domains") => "domains.list_domains",
        ("POST", "/domains") => "domains.create_domain",
        ("DELETE", "/domains") => "domains.delete_domain",
        ("GET", "/healthchecks") => "operations.list_healthchecks",
        ("POST", "/healthchecks") => "operations.create_healthcheck",
        ("DELETE", "/healthchecks") => "operations.delete_healthcheck",
        ("GET", "/healthchecks/results") => "operations.healthcheck_results",
        ("GET", "/containers") => "operations.list_containers",
        ("POST", "/containers/start") => "operations.start_container",
        ("POST", "/containers/stop") => "operations.stop_container",
        ("POST", "/containers/restart") => "operations.restart_container",
        ("POST", "/containers/remove") => "operations.remove_container",
        ("GET", "/containers/logs") => "operations.container_logs",
        ("POST", "/containers/images/prune") => "operations.prune_images",
        ("GET", "/extensions") => "operations.list_extensions",
        ("POST", "/extensions") => "operations.create_extension",
        ("POST", "/extensions/run") => "operations.run_extension",
        ("GET", "/extensions/executions") => "operations.list_executions",
        ("GET", "/health") => "api.health",
        ("GET", "/metrics") => "api.render_metrics",
        ("GET", "/ws") => "ws.realtime",
        ("GET", "/ws/live/:application_id") => "ws.live_sync",
        _ => "unknown.unknown_handler",
    }
}
