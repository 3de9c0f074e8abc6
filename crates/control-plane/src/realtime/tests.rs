use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tower_sessions::{MemoryStore, Session};

use super::*;
use crate::auth::cache::PermissionCache;
use crate::change_bus::ChangeEvent;
use crate::db::UserType;
use crate::testing::{
    audit, new_application, seed_tenant, seed_user, temp_db, FakeContainers, FakeHost, FakeHostProvider,
    FakeRuntime,
};

struct Harness {
    db: DbClient,
    auth: AuthService,
    gateway: RealtimeGateway,
    owner: String,
    organization_id: String,
    application: ApplicationRecord,
}

async fn harness() -> Harness {
    let db = temp_db().await;
    let (owner, organization, application) =
        seed_tenant(&db, |org, user| new_application(org, user, "api")).await;
    let auth = AuthService::new(db.clone(), PermissionCache::new(Duration::from_secs(60), 16));
    let gateway = RealtimeGateway::new(
        db.clone(),
        auth.clone(),
        Arc::new(FakeHostProvider::new(Arc::new(FakeHost::new()))),
        Arc::new(FakeRuntime::new(Arc::new(FakeContainers::new()))),
        Hub::new(),
    );
    Harness {
        db,
        auth,
        gateway,
        owner,
        organization_id: organization.id,
        application,
    }
}

impl Harness {
    async fn context_for(&self, user_id: &str) -> AuthContext {
        let principal = self.auth.session_principal(user_id).await.expect("principal");
        self.auth.scope(principal, &self.organization_id).await.expect("scope")
    }

    async fn session_for(&self, user_id: &str) -> (RealtimeSession, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(64);
        let context = self.context_for(user_id).await;
        (self.gateway.open_session(context, tx), rx)
    }

    async fn viewer(&self) -> String {
        let viewer = seed_user(&self.db, "viewer", UserType::Viewer).await;
        self.db
            .add_member(
                &self.organization_id,
                &viewer,
                "role-viewer",
                &audit(&self.owner, &self.organization_id, "organization", "update"),
            )
            .await
            .expect("add viewer");
        viewer
    }
}

fn cookie_session() -> Session {
    Session::new(None, Arc::new(MemoryStore::default()), None)
}

async fn next_frame(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("frame in time")
        .expect("channel open")
}

#[tokio::test]
async fn ping_gets_pong() {
    let harness = harness().await;
    let (mut session, _rx) = harness.session_for(&harness.owner).await;

    let replies = session.handle_text(r#"{"action":"ping"}"#).await;
    assert_eq!(replies, vec![ServerMessage::pong()]);
}

#[tokio::test]
async fn subscriptions_receive_events_until_unsubscribed() {
    let harness = harness().await;
    let (mut session, mut rx) = harness.session_for(&harness.owner).await;
    let subscribe = json!({
        "action": "subscribe",
        "topic": "deployments",
        "data": { "resource_id": harness.application.id },
    })
    .to_string();

    let replies = session.handle_text(&subscribe).await;
    assert_eq!(replies[0].action, "subscribed");
    assert_eq!(harness.gateway.hub().topics_of(session.id()), 1);

    harness.gateway.hub().dispatch(ChangeEvent {
        table: "deployments".to_string(),
        action: "update".to_string(),
        application_id: harness.application.id.clone(),
        data: json!({ "status": "building" }),
    });
    let pushed = next_frame(&mut rx).await;
    assert_eq!(pushed.topic.as_deref(), Some("deployments"));
    assert_eq!(pushed.data["data"]["status"], "building");

    let unsubscribe = subscribe.replace("\"subscribe\"", "\"unsubscribe\"");
    let replies = session.handle_text(&unsubscribe).await;
    assert_eq!(replies[0].action, "unsubscribed");
    assert!(harness.gateway.hub().snapshot().is_empty());
}

#[tokio::test]
async fn subscriptions_are_limited_to_known_topics_of_the_organization() {
    let harness = harness().await;
    let (mut session, _rx) = harness.session_for(&harness.owner).await;

    let unknown = session
        .handle_text(r#"{"action":"subscribe","topic":"users","data":{"resource_id":"x"}}"#)
        .await;
    assert_eq!(unknown[0].action, "error");

    let foreign = session
        .handle_text(r#"{"action":"subscribe","topic":"deployments","data":{"resource_id":"not-ours"}}"#)
        .await;
    assert_eq!(foreign[0].action, "error");
    assert_eq!(foreign[0].data["message"], "application not found");
    assert!(harness.gateway.hub().snapshot().is_empty());
}

#[tokio::test]
async fn terminals_open_on_first_input_and_close_with_the_connection() {
    let harness = harness().await;
    let (mut session, mut rx) = harness.session_for(&harness.owner).await;

    let replies = session
        .handle_text(r#"{"action":"terminal","data":{"terminal_id":"main","value":"uptime\n"}}"#)
        .await;
    assert!(replies.is_empty());
    assert_eq!(session.terminal_count(), 1);

    let mut output = String::new();
    while output.len() < "uptime\n".len() {
        let frame = next_frame(&mut rx).await;
        assert_eq!(frame.action, terminal::OUTPUT_ACTION);
        output.push_str(frame.data["output"].as_str().expect("text"));
    }
    assert_eq!(output, "uptime\n");

    let resized = session
        .handle_text(r#"{"action":"terminal_resize","data":{"terminal_id":"main","rows":0,"cols":80}}"#)
        .await;
    assert_eq!(resized[0].action, "error");

    let missing = session
        .handle_text(r#"{"action":"terminal_resize","data":{"terminal_id":"other","rows":24,"cols":80}}"#)
        .await;
    assert_eq!(missing[0].data["message"], "terminal other is not open");

    session.close().await;
}

#[tokio::test]
async fn viewers_get_no_terminal() {
    let harness = harness().await;
    let viewer = harness.viewer().await;
    let (mut session, _rx) = harness.session_for(&viewer).await;

    let replies = session.handle_text(r#"{"action":"terminal","data":{"value":"id\n"}}"#).await;
    assert_eq!(replies[0].data["message"], "missing permission container:update");
    assert_eq!(session.terminal_count(), 0);
}

#[tokio::test]
async fn dashboard_monitors_validate_intervals_and_stop() {
    let harness = harness().await;
    let (mut session, mut rx) = harness.session_for(&harness.owner).await;

    let rejected = session
        .handle_text(r#"{"action":"dashboard_monitor","data":{"interval":7}}"#)
        .await;
    assert_eq!(rejected[0].action, "error");
    assert!(!session.has_dashboard_monitor());

    let started = session
        .handle_text(r#"{"action":"dashboard_monitor","data":{"interval":5,"operations":["get_system_stats"]}}"#)
        .await;
    assert!(started.is_empty());
    assert!(session.has_dashboard_monitor());
    let frame = next_frame(&mut rx).await;
    assert_eq!(frame.action, monitor::DASHBOARD_ACTION);
    assert_eq!(frame.data["operation"], "get_system_stats");

    let stopped = session.handle_text(r#"{"action":"stop_dashboard_monitor"}"#).await;
    assert_eq!(stopped[0].action, "dashboard_monitor_stopped");
    assert!(!session.has_dashboard_monitor());
}

#[tokio::test]
async fn application_monitors_need_an_application_of_the_organization() {
    let harness = harness().await;
    let (mut session, mut rx) = harness.session_for(&harness.owner).await;

    let foreign = session
        .handle_text(r#"{"action":"monitor_application","data":{"application_id":"elsewhere"}}"#)
        .await;
    assert_eq!(foreign[0].data["message"], "application not found");

    let request = json!({
        "action": "monitor_application",
        "data": { "application_id": harness.application.id, "interval": 1 },
    })
    .to_string();
    assert!(session.handle_text(&request).await.is_empty());
    let frame = next_frame(&mut rx).await;
    assert_eq!(frame.action, monitor::APPLICATION_ACTION);
    assert_eq!(frame.data["application_id"], harness.application.id.as_str());

    session.close().await;
}

#[tokio::test]
async fn closing_a_connection_drops_its_subscriptions() {
    let harness = harness().await;
    let (mut session, _rx) = harness.session_for(&harness.owner).await;
    for topic in ["deployments", "deployment_logs", "healthcheck_results"] {
        let subscribe = json!({
            "action": "subscribe",
            "topic": topic,
            "data": { "resource_id": harness.application.id },
        })
        .to_string();
        assert_eq!(session.handle_text(&subscribe).await[0].action, "subscribed");
    }
    assert_eq!(harness.gateway.hub().snapshot().len(), 3);

    session.close().await;
    assert!(harness.gateway.hub().snapshot().is_empty());
}

#[tokio::test]
async fn authorize_accepts_api_keys_and_requires_an_organization() {
    let harness = harness().await;
    let owner_context = harness.context_for(&harness.owner).await;
    let (_, key) = harness.auth.issue_api_key(&owner_context, "dashboard").await.expect("key");
    let headers = HeaderMap::new();

    let missing = harness
        .gateway
        .authorize(Some(&key), None, &headers, &cookie_session())
        .await;
    assert!(matches!(missing, Err(AppError::Validation(_))));

    let context = harness
        .gateway
        .authorize(Some(&key), Some(&harness.organization_id), &headers, &cookie_session())
        .await
        .expect("authorized");
    assert_eq!(context.user_id(), harness.owner);

    let anonymous = harness
        .gateway
        .authorize(None, Some(&harness.organization_id), &headers, &cookie_session())
        .await;
    assert!(matches!(anonymous, Err(AppError::AuthMissing)));
}
