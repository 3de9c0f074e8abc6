use std::collections::BTreeMap;
use std::time::Duration;

use super::*;

async fn temp_db() -> DbClient {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let db_path = tempdir.path().join("control-plane.db");
    // Leaked so the file outlives pooled connections for the whole test.
    std::mem::forget(tempdir);

    DbClient::initialize(&db_path.to_string_lossy())
        .await
        .expect("db init")
}

async fn seed_user(db: &DbClient, username: &str) -> String {
    let user_id = new_id();
    db.insert_user(&NewUser {
        id: user_id.clone(),
        external_id: format!("local:{username}"),
        email: format!("{username}@example.test"),
        username: username.to_string(),
        password_hash: "not-a-real-hash".to_string(),
        user_type: UserType::Admin,
    })
    .await
    .expect("insert user");
    user_id
}

fn audit(actor: &str, organization_id: &str, resource: &str, action: &str) -> NewAuditLog {
    NewAuditLog {
        actor_user_id: actor.to_string(),
        organization_id: organization_id.to_string(),
        resource: resource.to_string(),
        action: action.to_string(),
        target_id: None,
        payload_snapshot: serde_json::json!({}),
    }
}

fn new_application(organization_id: &str, user_id: &str, name: &str) -> NewApplication {
    NewApplication {
        id: new_id(),
        organization_id: organization_id.to_string(),
        user_id: user_id.to_string(),
        family_id: None,
        name: name.to_string(),
        repository: "https://git.example.test/acme/api".to_string(),
        branch: "main".to_string(),
        build_pack: BuildPack::Dockerfile,
        dockerfile_path: None,
        base_path: None,
        port: 8080,
        domain: Some(format!("{name}.example.test")),
        environment: Environment::Production,
        framework: None,
        pre_run_command: String::new(),
        post_run_command: String::new(),
        build_variables: StringMap::default(),
        environment_variables: StringMap::from(BTreeMap::from([(
            "RUST_LOG".to_string(),
            "info".to_string(),
        )])),
        labels: StringMap::default(),
    }
}

async fn seed_application(db: &DbClient) -> (String, String, ApplicationRecord) {
    let user_id = seed_user(db, "owner").await;
    let organization = db
        .create_organization("Acme", "acme", "", &user_id)
        .await
        .expect("create org");
    let application = db
        .create_application(
            &new_application(&organization.id, &user_id, "api"),
            &audit(&user_id, &organization.id, "deploy", "create"),
        )
        .await
        .expect("create application");
    (user_id, organization.id, application)
}

#[tokio::test]
async fn initialize_runs_migrations_and_enables_wal() {
    let db = temp_db().await;
    db.ensure_wal_mode().await.expect("wal mode");
    assert_eq!(db.users_count().await.expect("count"), 0);
}

#[tokio::test]
async fn application_names_are_unique_per_organization_and_environment() {
    let db = temp_db().await;
    let (user_id, organization_id, application) = seed_application(&db).await;

    let duplicate = db
        .create_application(
            &new_application(&organization_id, &user_id, "api"),
            &audit(&user_id, &organization_id, "deploy", "create"),
        )
        .await
        .expect_err("duplicate must fail");
    assert!(crate::error::is_unique_violation(&duplicate));

    let mut staging = new_application(&organization_id, &user_id, "api");
    staging.environment = Environment::Staging;
    db.create_application(&staging, &audit(&user_id, &organization_id, "deploy", "create"))
        .await
        .expect("other environment is fine");

    assert!(db
        .soft_delete_application(
            &organization_id,
            &application.id,
            &audit(&user_id, &organization_id, "deploy", "delete"),
        )
        .await
        .expect("delete"));
    db.create_application(
        &new_application(&organization_id, &user_id, "api"),
        &audit(&user_id, &organization_id, "deploy", "create"),
    )
    .await
    .expect("name is free after soft delete");
}

#[tokio::test]
async fn mutations_write_exactly_one_audit_row() {
    let db = temp_db().await;
    let (_, organization_id, application) = seed_application(&db).await;

    assert_eq!(
        db.count_audit_logs(&organization_id, "deploy", "create")
            .await
            .expect("count"),
        1
    );
    assert_eq!(application.status, ApplicationStatus::Created);
    assert_eq!(
        application.environment_variables.get("RUST_LOG").map(String::as_str),
        Some("info")
    );
}

#[tokio::test]
async fn deployment_transitions_are_monotonic() {
    let db = temp_db().await;
    let (_, _, application) = seed_application(&db).await;
    let deployment = db
        .create_deployment(&application.id, DeploymentTrigger::Create, None)
        .await
        .expect("create deployment");

    db.transition_deployment(&deployment.id, DeploymentStatus::Cloning)
        .await
        .expect("cloning");
    let building = db
        .transition_deployment(&deployment.id, DeploymentStatus::Building)
        .await
        .expect("building");
    assert!(building.started_at.is_some());

    let error = db
        .transition_deployment(&deployment.id, DeploymentStatus::Cloning)
        .await
        .expect_err("backwards move");
    assert!(error.downcast_ref::<InvalidTransition>().is_some());

    let failed = db
        .transition_deployment(&deployment.id, DeploymentStatus::Failed)
        .await
        .expect("failed");
    assert!(failed.ended_at.is_some());
}

#[tokio::test]
async fn promotion_keeps_a_single_live_deployment() {
    let db = temp_db().await;
    let (_, _, application) = seed_application(&db).await;

    let mut promoted = Vec::new();
    for _ in 0..2 {
        let deployment = db
            .create_deployment(&application.id, DeploymentTrigger::Create, None)
            .await
            .expect("create deployment");
        for status in [
            DeploymentStatus::Cloning,
            DeploymentStatus::Building,
            DeploymentStatus::Starting,
            DeploymentStatus::HealthCheck,
        ] {
            db.transition_deployment(&deployment.id, status)
                .await
                .expect("transition");
        }
        db.record_deployment_artifacts(
            &deployment.id,
            &DeploymentArtifacts {
                container_image: Some("acme/api:abc1234".to_string()),
                container_name: Some(format!("api-{}", &deployment.id[..8])),
                ..DeploymentArtifacts::default()
            },
        )
        .await
        .expect("artifacts");
        let previous = db
            .promote_deployment(&application.id, &deployment.id, DeploymentStatus::Live)
            .await
            .expect("promote");
        promoted.push((deployment.id.clone(), previous.map(|record| record.id)));
    }

    assert_eq!(promoted[0].1, None);
    assert_eq!(promoted[1].1.as_deref(), Some(promoted[0].0.as_str()));

    let deployments = db
        .list_deployments(&application.id, Page::default())
        .await
        .expect("list");
    let live: Vec<_> = deployments
        .iter()
        .filter(|deployment| deployment.status == DeploymentStatus::Live)
        .collect();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id, promoted[1].0);

    let application = db
        .get_application(&application.id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(application.status, ApplicationStatus::Running);
    assert_eq!(application.current_deployment_id.as_deref(), Some(promoted[1].0.as_str()));

    let target = db
        .find_rollback_target(&application.id, application.current_deployment_id.as_deref())
        .await
        .expect("target")
        .expect("has target");
    assert_eq!(target.id, promoted[0].0);
    assert_eq!(target.status, DeploymentStatus::Superseded);
}

#[tokio::test]
async fn deployment_logs_are_published_on_the_change_bus() {
    let db = temp_db().await;
    let (_, _, application) = seed_application(&db).await;
    let deployment = db
        .create_deployment(&application.id, DeploymentTrigger::Create, None)
        .await
        .expect("create deployment");

    let mut receiver = db.change_bus().subscribe("deployment_logs", &application.id);
    db.append_deployment_log(&application.id, &deployment.id, LogLevel::Info, "cloning repository")
        .await
        .expect("append");

    let event = receiver.recv().await.expect("event");
    assert_eq!(event.table, "deployment_logs");
    assert_eq!(event.data["message"], "cloning repository");

    let logs = db
        .list_deployment_logs(&deployment.id, Page::default())
        .await
        .expect("logs");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].level, LogLevel::Info);
}

#[tokio::test]
async fn effective_permissions_scope_roles_to_the_organization() {
    let db = temp_db().await;
    let owner = seed_user(&db, "owner").await;
    let dev = seed_user(&db, "dev").await;
    let org_a = db
        .create_organization("A", "org-a", "", &owner)
        .await
        .expect("org a");
    let org_b = db
        .create_organization("B", "org-b", "", &owner)
        .await
        .expect("org b");

    db.add_member(&org_a.id, &dev, "role-viewer", &audit(&owner, &org_a.id, "organization", "update"))
        .await
        .expect("member of a");

    let in_a = db.effective_permissions(&dev, &org_a.id).await.expect("perms a");
    assert!(in_a.roles.contains("viewer"));
    assert!(in_a.permissions.contains(&("deploy".to_string(), "read".to_string())));
    assert!(!in_a.permissions.contains(&("deploy".to_string(), "create".to_string())));

    // The global viewer role held in A grants nothing in B.
    let in_b = db.effective_permissions(&dev, &org_b.id).await.expect("perms b");
    assert!(in_b.permissions.is_empty());

    let scoped = db
        .create_role(&org_b.id, "deployer", "", &audit(&owner, &org_b.id, "role", "create"))
        .await
        .expect("scoped role");
    db.grant_permission(&scoped.id, "deploy", "create", &audit(&owner, &org_b.id, "role", "update"))
        .await
        .expect("grant");
    db.add_member(&org_b.id, &dev, &scoped.id, &audit(&owner, &org_b.id, "organization", "update"))
        .await
        .expect("member of b");

    let in_b = db.effective_permissions(&dev, &org_b.id).await.expect("perms b");
    assert!(in_b.roles.contains(&format!("orgid_{}_deployer", org_b.id)));
    assert!(in_b.permissions.contains(&("deploy".to_string(), "create".to_string())));
    assert!(!in_b.permissions.contains(&("deploy".to_string(), "read".to_string())));
}

#[tokio::test]
async fn users_with_memberships_cannot_be_deleted() {
    let db = temp_db().await;
    let owner = seed_user(&db, "owner").await;
    db.create_organization("A", "org-a", "", &owner)
        .await
        .expect("org");

    assert!(db.delete_user(&owner).await.is_err());
}

fn job(queue: &str, key: &str) -> NewJob {
    NewJob {
        id: None,
        queue: queue.to_string(),
        job_key: key.to_string(),
        payload: serde_json::json!({ "key": key }),
        max_attempts: 3,
    }
}

#[tokio::test]
async fn claims_serialize_jobs_with_the_same_key() {
    let db = temp_db().await;
    let lease = Duration::from_secs(60);
    let first = db.enqueue_job(&job("create-deployment", "deploy:a")).await.expect("first");
    let second = db.enqueue_job(&job("create-deployment", "deploy:a")).await.expect("second");
    let other = db.enqueue_job(&job("create-deployment", "deploy:b")).await.expect("other");

    let claimed = db
        .claim_next_job("create-deployment", "w1", lease)
        .await
        .expect("claim")
        .expect("job");
    assert_eq!(claimed.id, first.id);
    assert_eq!(claimed.attempts, 1);

    let claimed = db
        .claim_next_job("create-deployment", "w2", lease)
        .await
        .expect("claim")
        .expect("job");
    assert_eq!(claimed.id, other.id, "same key must wait for the running job");

    assert!(db
        .claim_next_job("create-deployment", "w3", lease)
        .await
        .expect("claim")
        .is_none());

    db.finish_job(&first.id, JobStatus::Succeeded, None)
        .await
        .expect("finish");
    let claimed = db
        .claim_next_job("create-deployment", "w3", lease)
        .await
        .expect("claim")
        .expect("job");
    assert_eq!(claimed.id, second.id);
}

#[tokio::test]
async fn rescheduled_jobs_keep_their_place_in_key_order() {
    let db = temp_db().await;
    let lease = Duration::from_secs(60);
    let first = db.enqueue_job(&job("live-dev", "dev:a")).await.expect("first");
    db.enqueue_job(&job("live-dev", "dev:a")).await.expect("second");

    db.claim_next_job("live-dev", "w1", lease)
        .await
        .expect("claim")
        .expect("job");
    db.reschedule_job(&first.id, chrono::Utc::now() + chrono::Duration::hours(1), "boom")
        .await
        .expect("reschedule");

    // The retry is not due yet and the later job may not overtake it.
    assert!(db
        .claim_next_job("live-dev", "w1", lease)
        .await
        .expect("claim")
        .is_none());

    let stats = db.queue_stats("live-dev").await.expect("stats");
    assert_eq!(stats.depth, 2);
    assert!(stats.oldest_created_at.is_some());
}

#[tokio::test]
async fn expired_leases_return_to_pending() {
    let db = temp_db().await;
    let queued = db.enqueue_job(&job("healthcheck-probe", "probe:a")).await.expect("job");
    db.claim_next_job("healthcheck-probe", "w1", Duration::ZERO)
        .await
        .expect("claim")
        .expect("job");
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert_eq!(db.requeue_expired_leases().await.expect("requeue"), 1);
    let record = db.get_job(&queued.id).await.expect("get").expect("exists");
    assert_eq!(record.status, JobStatus::Pending);
    assert!(record.lease_owner.is_none());
}

#[tokio::test]
async fn cancelling_pending_and_running_jobs() {
    let db = temp_db().await;
    let running = db.enqueue_job(&job("extension-execution", "ext:a")).await.expect("job");
    let pending = db.enqueue_job(&job("extension-execution", "ext:a")).await.expect("job");
    db.claim_next_job("extension-execution", "w1", Duration::from_secs(60))
        .await
        .expect("claim")
        .expect("job");

    let cancelled = db.cancel_jobs_for_key("ext:a").await.expect("cancel");
    assert_eq!(cancelled.len(), 2);

    let pending = db.get_job(&pending.id).await.expect("get").expect("exists");
    assert_eq!(pending.status, JobStatus::Cancelled);

    let running = db.get_job(&running.id).await.expect("get").expect("exists");
    assert_eq!(running.status, JobStatus::Running);
    assert!(db.is_job_cancel_requested(&running.id).await.expect("flag"));
}

#[tokio::test]
async fn feature_flags_default_to_enabled() {
    let db = temp_db().await;
    let owner = seed_user(&db, "owner").await;
    let organization = db
        .create_organization("A", "org-a", "", &owner)
        .await
        .expect("org");

    assert!(db.is_feature_enabled(&organization.id, "deploy").await.expect("flag"));
    db.set_feature_flag(
        &organization.id,
        "deploy",
        false,
        &audit(&owner, &organization.id, "feature_flags", "update"),
    )
    .await
    .expect("set");
    assert!(!db.is_feature_enabled(&organization.id, "deploy").await.expect("flag"));
}
