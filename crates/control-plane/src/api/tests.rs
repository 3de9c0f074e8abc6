use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body as HttpBody};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use super::*;
use crate::auth::cache::PermissionCache;
use crate::auth::ORGANIZATION_HEADER;
use crate::db::{Page, UserType};
use crate::deployment::{DeploymentEngine, EnginePorts, EngineSettings};
use crate::jobs::{JobQueue, CREATE_DEPLOYMENT_QUEUE};
use crate::live_sync::dev_service::{DevServiceManager, DevServiceSettings};
use crate::proxy::memory::MemoryProxy;
use crate::proxy::ProxyManager;
use crate::realtime::hub::Hub;
use crate::testing::{
    audit, seed_user, temp_db, FakeContainers, FakeFetcher, FakeHost, FakeHostProvider, FakeRuntime,
    ScriptedProber,
};

struct TestApp {
    db: DbClient,
    state: AppState,
    router: Router,
}

async fn test_app() -> TestApp {
    let db = temp_db().await;
    let auth = AuthService::new(db.clone(), PermissionCache::new(Duration::from_secs(60), 16));
    let jobs = JobQueue::new(db.clone(), 3);
    let hosts = Arc::new(FakeHostProvider::new(Arc::new(FakeHost::new())));
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(FakeRuntime::new(Arc::new(FakeContainers::new())));
    let proxy = Arc::new(ProxyManager::new(Arc::new(MemoryProxy::default())));
    let engine = Arc::new(DeploymentEngine::new(
        db.clone(),
        EnginePorts {
            hosts: hosts.clone(),
            runtime: runtime.clone(),
            proxy: proxy.clone(),
            fetcher: Arc::new(FakeFetcher::new("abc1234def5678")),
            prober: Arc::new(ScriptedProber::always(true)),
        },
        SecretBox::ephemeral(),
        EngineSettings::default(),
    ));
    let dev = Arc::new(DevServiceManager::new(
        db.clone(),
        runtime.clone(),
        proxy,
        jobs.clone(),
        DevServiceSettings::default(),
    ));

    let state = AppState {
        db: db.clone(),
        auth: auth.clone(),
        deployments: DeploymentService::new(db.clone(), jobs.clone(), engine),
        extensions: ExtensionService::new(db.clone(), jobs),
        runtime: runtime.clone(),
        secrets: SecretBox::ephemeral(),
        realtime: RealtimeGateway::new(db.clone(), auth.clone(), hosts.clone(), runtime, Hub::new()),
        live_sync: LiveSyncGateway::new(db.clone(), auth, hosts, dev),
        allowed_domain_ips: Arc::new(Vec::new()),
        metrics: None,
    };
    let sessions = session_layer(&db, false).await.expect("session layer");
    let router = router(state.clone(), sessions);
    TestApp { db, state, router }
}

fn cookie_from_set_cookie(set_cookie: &header::HeaderValue) -> String {
    let raw = set_cookie.to_str().expect("set-cookie utf8");
    raw.split(';').next().expect("cookie pair").to_string()
}

fn json_request(method: Method, uri: &str, body: &Value) -> Request<HttpBody> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(HttpBody::from(body.to_string()))
        .expect("request")
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

impl TestApp {
    async fn send(&self, request: Request<HttpBody>) -> axum::response::Response {
        self.router.clone().oneshot(request).await.expect("response")
    }

    /// Runs setup and returns the session cookie and the organization id.
    async fn setup_admin(&self) -> (String, String) {
        let response = self
            .send(json_request(
                Method::POST,
                "/api/v1/auth/setup",
                &json!({
                    "username": "admin",
                    "email": "admin@example.test",
                    "password": "correct horse battery",
                    "organization": "Acme"
                }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let cookie = cookie_from_set_cookie(
            response.headers().get(header::SET_COOKIE).expect("session cookie"),
        );
        let body = body_json(response).await;
        let organization_id = body["data"]["organizations"][0]["id"]
            .as_str()
            .expect("organization id")
            .to_string();
        (cookie, organization_id)
    }

    /// A viewer in `organization_id` and a Bearer token for them.
    async fn viewer_token(&self, organization_id: &str) -> String {
        let viewer = seed_user(&self.db, "viewer", UserType::Viewer).await;
        self.db
            .add_member(
                organization_id,
                &viewer,
                "role-viewer",
                &audit(&viewer, organization_id, "organization", "update"),
            )
            .await
            .expect("add viewer");
        let principal = self.state.auth.session_principal(&viewer).await.expect("principal");
        let context = self
            .state
            .auth
            .scope(principal, organization_id)
            .await
            .expect("scope");
        let (_, token) = self.state.auth.issue_api_key(&context, "ci").await.expect("issue key");
        token
    }
}

fn with_session(mut request: Request<HttpBody>, cookie: &str, organization_id: &str) -> Request<HttpBody> {
    let headers = request.headers_mut();
    headers.insert(header::COOKIE, cookie.parse().expect("cookie header"));
    headers.insert(ORGANIZATION_HEADER, organization_id.parse().expect("org header"));
    request
}

fn get(uri: &str) -> Request<HttpBody> {
    Request::builder()
        .uri(uri)
        .body(HttpBody::empty())
        .expect("request")
}

#[tokio::test]
async fn setup_then_session_cookie_authenticates_me() {
    let app = test_app().await;
    let (cookie, _) = app.setup_admin().await;

    let mut request = get("/api/v1/auth/me");
    request
        .headers_mut()
        .insert(header::COOKIE, cookie.parse().expect("cookie"));
    let response = app.send(request).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "success");
    assert_eq!(body["data"]["user"]["username"], "admin");
}

#[tokio::test]
async fn second_setup_is_a_conflict() {
    let app = test_app().await;
    app.setup_admin().await;

    let response = app
        .send(json_request(
            Method::POST,
            "/api/v1/auth/setup",
            &json!({ "username": "intruder", "password": "whatever-password" }),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response).await;
    assert_eq!(body["status"], "error");
}

#[tokio::test]
async fn login_with_wrong_password_is_unauthorized() {
    let app = test_app().await;
    app.setup_admin().await;

    let response = app
        .send(json_request(
            Method::POST,
            "/api/v1/auth/login",
            &json!({ "username": "admin", "password": "wrong" }),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .send(json_request(
            Method::POST,
            "/api/v1/auth/login",
            &json!({ "username": "admin", "password": "correct horse battery" }),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(header::SET_COOKIE).is_some());
}

#[tokio::test]
async fn unauthenticated_requests_are_rejected() {
    let app = test_app().await;
    let response = app.send(get("/api/v1/deploy/applications")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["status"], "error");
    assert!(body["data"].is_null());
}

#[tokio::test]
async fn organization_routes_require_the_organization_header() {
    let app = test_app().await;
    let (cookie, _) = app.setup_admin().await;

    let mut request = get("/api/v1/deploy/applications");
    request
        .headers_mut()
        .insert(header::COOKIE, cookie.parse().expect("cookie"));
    let response = app.send(request).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn viewer_cannot_create_an_application() {
    let app = test_app().await;
    let (_, organization_id) = app.setup_admin().await;
    let token = app.viewer_token(&organization_id).await;

    let mut request = json_request(
        Method::POST,
        "/api/v1/deploy/application",
        &json!({
            "name": "api",
            "repository": "https://github.com/acme/api",
            "port": 8080
        }),
    );
    request.headers_mut().insert(
        header::AUTHORIZATION,
        format!("Bearer {token}").parse().expect("auth header"),
    );
    request
        .headers_mut()
        .insert(ORGANIZATION_HEADER, organization_id.parse().expect("org header"));
    let response = app.send(request).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert!(body["message"]
        .as_str()
        .is_some_and(|message| message.contains("deploy:create")));

    let queued = app
        .db
        .queue_stats(CREATE_DEPLOYMENT_QUEUE)
        .await
        .expect("queue stats");
    assert_eq!(queued.depth, 0);
    let logs = app
        .db
        .list_audit_logs(&organization_id, Page::default())
        .await
        .expect("audit logs");
    assert!(logs.iter().all(|log| log.resource != "deploy"));
}

#[tokio::test]
async fn admin_creates_an_application_and_queues_a_deployment() {
    let app = test_app().await;
    let (cookie, organization_id) = app.setup_admin().await;

    let request = with_session(
        json_request(
            Method::POST,
            "/api/v1/deploy/application",
            &json!({
                "name": "api",
                "repository": "https://github.com/acme/api",
                "port": 8080
            }),
        ),
        &cookie,
        &organization_id,
    );
    let response = app.send(request).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["application"]["name"], "api");
    assert_eq!(body["data"]["deployment"]["status"], "queued");

    let queued = app
        .db
        .queue_stats(CREATE_DEPLOYMENT_QUEUE)
        .await
        .expect("queue stats");
    assert_eq!(queued.depth, 1);
}

#[tokio::test]
async fn disabled_feature_flag_blocks_its_routes() {
    let app = test_app().await;
    let (cookie, organization_id) = app.setup_admin().await;

    let request = with_session(
        json_request(
            Method::PUT,
            "/api/v1/feature-flags",
            &json!({ "feature_name": "domain", "enabled": false }),
        ),
        &cookie,
        &organization_id,
    );
    assert_eq!(app.send(request).await.status(), StatusCode::OK);

    let response = app
        .send(with_session(get("/api/v1/domains"), &cookie, &organization_id))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .send(with_session(get("/api/v1/deploy/applications"), &cookie, &organization_id))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn invalid_paging_is_a_validation_error() {
    let app = test_app().await;
    let (cookie, organization_id) = app.setup_admin().await;

    for uri in [
        "/api/v1/deploy/applications?page=0",
        "/api/v1/deploy/applications?page_size=abc",
    ] {
        let response = app
            .send(with_session(get(uri), &cookie, &organization_id))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
    }
}

#[tokio::test]
async fn malformed_json_renders_the_error_envelope() {
    let app = test_app().await;
    let (cookie, organization_id) = app.setup_admin().await;

    let mut request = with_session(
        json_request(Method::POST, "/api/v1/roles", &json!({})),
        &cookie,
        &organization_id,
    );
    *request.body_mut() = HttpBody::from("{not json");
    let response = app.send(request).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["status"], "error");
    assert!(body["message"].as_str().is_some_and(|message| !message.is_empty()));
}

#[tokio::test]
async fn global_roles_cannot_be_deleted() {
    let app = test_app().await;
    let (cookie, organization_id) = app.setup_admin().await;

    let request = with_session(
        Request::builder()
            .method(Method::DELETE)
            .uri("/api/v1/roles?id=role-viewer")
            .body(HttpBody::empty())
            .expect("request"),
        &cookie,
        &organization_id,
    );
    assert_eq!(app.send(request).await.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn health_and_unknown_routes() {
    let app = test_app().await;

    let response = app.send(get("/health")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["status"], "ok");

    let response = app.send(get("/api/v1/nope")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["status"], "error");

    let response = app.send(get("/metrics")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[test]
fn page_query_defaults_and_caps() {
    let page = PageQuery::default().page().expect("defaults");
    assert_eq!(page, Page::default());

    let page = PageQuery {
        page: Some("3".to_string()),
        page_size: Some("100000".to_string()),
    }
    .page()
    .expect("capped");
    assert_eq!(page.page, 3);
    assert_eq!(page.page_size, Page::MAX_PAGE_SIZE);

    assert!(PageQuery {
        page: Some("-1".to_string()),
        page_size: None,
    }
    .page()
    .is_err());
}
