//! Process wiring: builds the ports from config, reconciles state left by a
//! previous run, starts the background loops and serves HTTP until a signal
//! arrives. Shutdown runs in reverse: the listener stops, workers drain up to
//! the configured deadline, then the loops exit.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::{self, AppState};
use crate::auth::AuthService;
use crate::config::ControlPlaneConfig;
use crate::crypto::SecretBox;
use crate::db::DbClient;
use crate::deployment::reconciler::reconcile_on_startup;
use crate::deployment::{DeploymentEngine, DeploymentJobHandler, DeploymentService, EnginePorts, EngineSettings};
use crate::docker::{ContainerRuntime, DockerManager};
use crate::extension::{ExtensionJobHandler, ExtensionService};
use crate::healthcheck::{HealthcheckScheduler, NetworkProber, ProbeJobHandler};
use crate::host::local::LocalHostProvider;
use crate::host::ssh::SshManager;
use crate::host::HostProvider;
use crate::jobs::{
    self, JobHandler, JobQueue, WorkerPool, WorkerSettings, CREATE_DEPLOYMENT_QUEUE, EXTENSION_EXECUTION_QUEUE,
    HEALTHCHECK_PROBE_QUEUE, LIVE_DEV_QUEUE,
};
use crate::live_sync::dev_service::{DevServiceJobHandler, DevServiceManager, DevServiceSettings};
use crate::live_sync::LiveSyncGateway;
use crate::proxy::caddy::CaddyProxy;
use crate::proxy::ProxyManager;
use crate::realtime::hub::Hub;
use crate::realtime::RealtimeGateway;
use crate::repository::{GitFetcher, TokenMinter};
use crate::telemetry;

/// Opens the database and applies migrations without serving.
///
/// # Errors
/// Returns an error if the database cannot be opened or migrated.
pub async fn migrate(config: &ControlPlaneConfig) -> Result<()> {
    let database_path = config.database_path();
    DbClient::initialize(&database_path).await?;
    info!(%database_path, "migrations applied");
    Ok(())
}

/// Runs the control plane until SIGINT or SIGTERM.
///
/// # Errors
/// Returns an error if startup fails or the listener dies.
pub async fn run(config: ControlPlaneConfig) -> Result<()> {
    let database_path = config.database_path();
    let db = DbClient::initialize(&database_path).await?;
    info!(%database_path, "database initialized");

    let shutdown = CancellationToken::new();
    let Started {
        state,
        engine,
        workers,
        loops,
    } = start(&config, db.clone(), &shutdown).await?;
    let sessions = api::session_layer(&db, config.secure_cookies()).await?;
    let app = api::router(state, sessions);

    let bind_address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!(%bind_address, "control plane listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("listener stopped, draining workers");
    shutdown.cancel();
    if !jobs::drain(workers, config.job_drain_deadline()).await {
        warn!("workers did not finish before the drain deadline");
    }
    if !engine.finish_retirements(config.job_drain_deadline()).await {
        warn!("superseded containers were not all removed before the drain deadline");
    }
    for handle in loops {
        if let Err(error) = handle.await {
            warn!(%error, "background task ended abnormally");
        }
    }
    info!("shutdown complete");
    Ok(())
}

struct Started {
    state: AppState,
    /// Kept for retiring superseded containers at shutdown.
    engine: Arc<DeploymentEngine>,
    /// Worker pool tasks, drained with a deadline.
    workers: Vec<JoinHandle<()>>,
    /// Hub pump, health check scheduler and ssh reaper.
    loops: Vec<JoinHandle<()>>,
}

fn secrets_from_config(config: &ControlPlaneConfig) -> Result<SecretBox> {
    match config.encryption_key() {
        Some(key) => SecretBox::from_base64_key(&key).context("invalid encryption key"),
        None => {
            warn!("no encryption key configured; stored secrets will not survive a restart");
            Ok(SecretBox::ephemeral())
        }
    }
}

/// Builds every port and service, reconciles leftovers from the previous
/// run and starts the background loops and worker pools.
async fn start(config: &ControlPlaneConfig, db: DbClient, shutdown: &CancellationToken) -> Result<Started> {
    let metrics = telemetry::init_metrics();
    let secrets = secrets_from_config(config)?;
    let mut loops = Vec::new();

    let hosts: Arc<dyn HostProvider> = match SshManager::from_config(config) {
        Some(manager) => {
            let manager = Arc::new(manager);
            loops.push(Arc::clone(&manager).spawn_reaper(shutdown.clone()));
            info!("remote host access over ssh");
            manager
        }
        None => Arc::new(LocalHostProvider),
    };
    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(DockerManager::from_config(config).context("invalid docker endpoint")?);
    let proxy = Arc::new(ProxyManager::new(Arc::new(CaddyProxy::new(
        &config.proxy_admin_url(),
        &config.proxy_server_name(),
    ))));

    match reconcile_on_startup(&db, &proxy).await {
        Ok(report) => info!(
            requeued_jobs = report.requeued_jobs,
            failed_deployments = report.failed_deployments,
            routes = report.routes,
            "startup reconcile finished"
        ),
        Err(error) => warn!(error = %format!("{error:#}"), "startup reconcile failed"),
    }

    let jobs = JobQueue::new(db.clone(), config.job_max_retries());
    let prober = Arc::new(NetworkProber::new());
    let engine = Arc::new(DeploymentEngine::new(
        db.clone(),
        EnginePorts {
            hosts: Arc::clone(&hosts),
            runtime: Arc::clone(&runtime),
            proxy: Arc::clone(&proxy),
            fetcher: Arc::new(GitFetcher::new(TokenMinter::default())),
            prober: prober.clone(),
        },
        secrets.clone(),
        EngineSettings::from_config(config),
    ));
    let dev_services = Arc::new(DevServiceManager::new(
        db.clone(),
        Arc::clone(&runtime),
        Arc::clone(&proxy),
        jobs.clone(),
        DevServiceSettings {
            staging_root: config.staging_root(),
            network: Some(config.upstream_network()),
            ..DevServiceSettings::default()
        },
    ));
    let scheduler = Arc::new(HealthcheckScheduler::new(
        db.clone(),
        prober,
        config.max_concurrent_probes(),
    ));
    loops.push(Arc::clone(&scheduler).spawn(shutdown.clone()));

    let hub = Hub::new();
    loops.push(tokio::spawn(hub.clone().run(db.change_bus().clone(), shutdown.clone())));

    let deployments: Arc<dyn JobHandler> = Arc::new(DeploymentJobHandler::new(Arc::clone(&engine)));
    let live_dev: Arc<dyn JobHandler> = Arc::new(DevServiceJobHandler::new(Arc::clone(&dev_services)));
    let extensions: Arc<dyn JobHandler> = Arc::new(ExtensionJobHandler::new(
        db.clone(),
        Arc::clone(&hosts),
        Arc::clone(&runtime),
        proxy,
    ));
    let probes: Arc<dyn JobHandler> = Arc::new(ProbeJobHandler::new(scheduler));
    let handlers = vec![
        (CREATE_DEPLOYMENT_QUEUE, deployments),
        (LIVE_DEV_QUEUE, live_dev),
        (EXTENSION_EXECUTION_QUEUE, extensions),
        (HEALTHCHECK_PROBE_QUEUE, probes),
    ];
    let workers = spawn_workers(handlers, &jobs, &WorkerSettings::from_config(config), shutdown);

    let auth = AuthService::from_config(db.clone(), config);
    let state = AppState {
        db: db.clone(),
        auth: auth.clone(),
        deployments: DeploymentService::new(db.clone(), jobs.clone(), Arc::clone(&engine)),
        extensions: ExtensionService::new(db.clone(), jobs),
        runtime: Arc::clone(&runtime),
        secrets,
        realtime: RealtimeGateway::new(db.clone(), auth.clone(), Arc::clone(&hosts), runtime, hub),
        live_sync: LiveSyncGateway::new(db, auth, hosts, dev_services),
        allowed_domain_ips: Arc::new(config.allowed_domain_ips()),
        metrics,
    };
    Ok(Started { state, engine, workers, loops })
}

fn spawn_workers(
    handlers: Vec<(&str, Arc<dyn JobHandler>)>,
    jobs: &JobQueue,
    settings: &WorkerSettings,
    shutdown: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut workers = Vec::new();
    for (queue, handler) in handlers {
        info!(queue, "starting worker pool");
        let pool = Arc::new(WorkerPool::new(queue, handler, jobs.clone(), settings.clone()));
        workers.extend(pool.spawn(shutdown));
    }
    workers
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(%error, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}
