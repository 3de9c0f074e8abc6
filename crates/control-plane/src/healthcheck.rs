//! Periodic HTTP/TCP probes for registered health checks.
//!
//! One task per enabled check, all sharing a semaphore that bounds how many
//! probes are in flight. Results are stored; crossing the failure threshold
//! marks the application degraded and recovering marks it healthy again,
//! each with a change event.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::change_bus::ChangeEvent;
use crate::db::{DbClient, HealthStatus, HealthcheckKind, HealthcheckRecord};
use crate::jobs::{JobContext, JobError, JobHandler};
use crate::telemetry;

const RESYNC_INTERVAL: Duration = Duration::from_secs(15);
const DETAIL_MAX_CHARS: usize = 200;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub ok: bool,
    pub latency_ms: u64,
    pub detail: String,
}

#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, kind: HealthcheckKind, target: &str, timeout: Duration) -> ProbeOutcome;
}

/// Probes over the network from the control plane. HTTP targets succeed on
/// any 2xx or 3xx; TCP targets on an accepted connection.
#[derive(Clone, Debug, Default)]
pub struct NetworkProber {
    client: reqwest::Client,
}

impl NetworkProber {
    #[must_use]
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn truncate(detail: &str) -> String {
    detail.chars().take(DETAIL_MAX_CHARS).collect()
}

#[must_use]
pub fn http_url(target: &str) -> String {
    if target.starts_with("http://") || target.starts_with("https://") {
        target.to_string()
    } else {
        format!("http://{target}")
    }
}

#[async_trait]
impl Prober for NetworkProber {
    async fn probe(&self, kind: HealthcheckKind, target: &str, timeout: Duration) -> ProbeOutcome {
        let started = Instant::now();
        match kind {
            HealthcheckKind::Http => {
                match self.client.get(http_url(target)).timeout(timeout).send().await {
                    Ok(response) => {
                        let status = response.status();
                        ProbeOutcome {
                            ok: status.is_success() || status.is_redirection(),
                            latency_ms: elapsed_ms(started),
                            detail: status.to_string(),
                        }
                    }
                    Err(error) => ProbeOutcome {
                        ok: false,
                        latency_ms: elapsed_ms(started),
                        detail: truncate(&error.to_string()),
                    },
                }
            }
            HealthcheckKind::Tcp => {
                let result = tokio::time::timeout(timeout, TcpStream::connect(target)).await;
                let (ok, detail) = match result {
                    Ok(Ok(_)) => (true, "connected".to_string()),
                    Ok(Err(error)) => (false, truncate(&error.to_string())),
                    Err(_) => (false, format!("no connection within {timeout:?}")),
                };
                ProbeOutcome {
                    ok,
                    latency_ms: elapsed_ms(started),
                    detail,
                }
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthTransition {
    Degraded,
    Recovered,
}

/// Consecutive-failure bookkeeping for one check.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HealthTracker {
    consecutive_failures: u32,
    degraded: bool,
}

impl HealthTracker {
    /// Degrades once failures exceed `threshold`; the next success recovers.
    pub fn observe(&mut self, ok: bool, threshold: u32) -> Option<HealthTransition> {
        if ok {
            self.consecutive_failures = 0;
            if self.degraded {
                self.degraded = false;
                return Some(HealthTransition::Recovered);
            }
            return None;
        }

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if !self.degraded && self.consecutive_failures > threshold {
            self.degraded = true;
            return Some(HealthTransition::Degraded);
        }
        None
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

fn check_timeout(check: &HealthcheckRecord) -> Duration {
    Duration::from_secs(u64::try_from(check.timeout_seconds).unwrap_or(5).max(1))
}

fn check_interval(check: &HealthcheckRecord) -> Duration {
    Duration::from_secs(u64::try_from(check.interval_seconds).unwrap_or(30).max(1))
}

type CheckSignature = (HealthcheckKind, String, i64, i64, i64);

fn signature(check: &HealthcheckRecord) -> CheckSignature {
    (
        check.kind,
        check.target.clone(),
        check.interval_seconds,
        check.timeout_seconds,
        check.threshold,
    )
}

pub struct HealthcheckScheduler {
    db: DbClient,
    prober: Arc<dyn Prober>,
    permits: Arc<Semaphore>,
    running: Mutex<HashMap<String, (CheckSignature, CancellationToken)>>,
}

impl HealthcheckScheduler {
    #[must_use]
    pub fn new(db: DbClient, prober: Arc<dyn Prober>, max_concurrent: usize) -> Self {
        Self {
            db,
            prober,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Runs one probe, stores the result and applies a health transition when
    /// a tracker is given.
    ///
    /// # Errors
    /// Returns an error if the result cannot be stored.
    pub async fn probe_once(
        &self,
        check: &HealthcheckRecord,
        tracker: Option<&mut HealthTracker>,
    ) -> Result<ProbeOutcome> {
        let outcome = {
            let _permit = self.permits.acquire().await?;
            self.prober
                .probe(check.kind, &check.target, check_timeout(check))
                .await
        };
        telemetry::probe_finished(check.kind.as_str(), outcome.ok, outcome.latency_ms);
        self.db
            .record_healthcheck_result(check, outcome.ok, outcome.latency_ms, &outcome.detail)
            .await?;

        let Some(tracker) = tracker else {
            return Ok(outcome);
        };
        let threshold = u32::try_from(check.threshold).unwrap_or(u32::MAX);
        if let Some(transition) = tracker.observe(outcome.ok, threshold) {
            self.apply_transition(check, transition, tracker.consecutive_failures())
                .await?;
        }
        Ok(outcome)
    }

    async fn apply_transition(
        &self,
        check: &HealthcheckRecord,
        transition: HealthTransition,
        consecutive_failures: u32,
    ) -> Result<()> {
        let (health, action) = match transition {
            HealthTransition::Degraded => (HealthStatus::Degraded, "degraded"),
            HealthTransition::Recovered => (HealthStatus::Healthy, "recovered"),
        };
        if !self.db.set_application_health(&check.application_id, health).await? {
            return Ok(());
        }

        match transition {
            HealthTransition::Degraded => warn!(
                application_id = %check.application_id,
                healthcheck_id = %check.id,
                consecutive_failures,
                "application degraded"
            ),
            HealthTransition::Recovered => info!(
                application_id = %check.application_id,
                healthcheck_id = %check.id,
                "application recovered"
            ),
        }
        self.db.change_bus().emit(&ChangeEvent {
            table: "applications".to_string(),
            action: action.to_string(),
            application_id: check.application_id.clone(),
            data: json!({
                "health_status": health.as_str(),
                "healthcheck_id": check.id,
                "consecutive_failures": consecutive_failures,
            }),
        });
        Ok(())
    }

    /// Starts tasks for new or changed checks and stops tasks for removed ones.
    ///
    /// # Errors
    /// Returns an error if the checks cannot be listed.
    pub async fn sync(self: &Arc<Self>, shutdown: &CancellationToken) -> Result<usize> {
        let checks = self.db.list_enabled_healthchecks().await?;
        let mut running = self.running.lock().await;

        let wanted: HashMap<String, HealthcheckRecord> = checks
            .into_iter()
            .map(|check| (check.id.clone(), check))
            .collect();

        running.retain(|check_id, (current, token)| {
            let keep = wanted
                .get(check_id)
                .is_some_and(|check| signature(check) == *current);
            if !keep {
                token.cancel();
            }
            keep
        });

        for (check_id, check) in wanted {
            if running.contains_key(&check_id) {
                continue;
            }
            let token = shutdown.child_token();
            running.insert(check_id, (signature(&check), token.clone()));
            tokio::spawn(self.clone().run_check(check, token));
        }

        Ok(running.len())
    }

    async fn run_check(self: Arc<Self>, check: HealthcheckRecord, cancel: CancellationToken) {
        debug!(healthcheck_id = %check.id, target = %check.target, "health check started");
        let mut tracker = HealthTracker::default();
        let mut ticker = tokio::time::interval(check_interval(&check));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(error) = self.probe_once(&check, Some(&mut tracker)).await {
                warn!(healthcheck_id = %check.id, error = %format!("{error:#}"), "health probe not recorded");
            }
        }
        debug!(healthcheck_id = %check.id, "health check stopped");
    }

    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.sync(&shutdown).await {
                    Ok(count) => debug!(checks = count, "health checks synced"),
                    Err(error) => warn!(error = %format!("{error:#}"), "health check sync failed"),
                }
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(RESYNC_INTERVAL) => {}
                }
            }
        })
    }
}

#[derive(Debug, Deserialize)]
struct ProbeJob {
    healthcheck_id: String,
    organization_id: String,
}

/// Runs an on-demand probe queued on `healthcheck-probe`.
pub struct ProbeJobHandler {
    scheduler: Arc<HealthcheckScheduler>,
}

impl ProbeJobHandler {
    #[must_use]
    pub fn new(scheduler: Arc<HealthcheckScheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl JobHandler for ProbeJobHandler {
    async fn handle(&self, context: &JobContext) -> Result<(), JobError> {
        let job: ProbeJob = context.payload()?;
        let Some(check) = self
            .scheduler
            .db
            .get_healthcheck(&job.organization_id, &job.healthcheck_id)
            .await?
        else {
            return Err(JobError::Terminal(format!(
                "health check {} no longer exists",
                job.healthcheck_id
            )));
        };
        self.scheduler.probe_once(&check, None).await?;
        Ok(())
    }
}
