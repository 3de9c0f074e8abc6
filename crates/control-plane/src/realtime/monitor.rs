//! Periodic stat streams pushed to one connection.
//!
//! A monitor is a task with its own cancellation token and a watch channel
//! carrying its configuration, so a repeated `dashboard_monitor` message
//! retunes the running task instead of starting a second one.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::message::{MessageError, ServerMessage};
use crate::docker::{label_filter, ContainerRuntime, LabelFilters, LABEL_APPLICATION_ID};
use crate::host::HostProvider;

/// Tick intervals a client may pick, in seconds.
pub const ALLOWED_INTERVALS: [u64; 6] = [1, 2, 5, 10, 30, 60];
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

pub const DASHBOARD_ACTION: &str = "dashboard_monitor";
pub const APPLICATION_ACTION: &str = "application_monitor";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DashboardOperation {
    GetContainers,
    GetSystemStats,
}

impl DashboardOperation {
    pub const ALL: [Self; 2] = [Self::GetContainers, Self::GetSystemStats];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GetContainers => "get_containers",
            Self::GetSystemStats => "get_system_stats",
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|operation| operation.as_str() == name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub operations: Vec<DashboardOperation>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            operations: DashboardOperation::ALL.to_vec(),
        }
    }
}

/// # Errors
/// Rejects intervals outside [`ALLOWED_INTERVALS`].
pub fn checked_interval(seconds: Option<u64>, current: Duration) -> Result<Duration, MessageError> {
    match seconds {
        None => Ok(current),
        Some(seconds) if ALLOWED_INTERVALS.contains(&seconds) => Ok(Duration::from_secs(seconds)),
        Some(seconds) => Err(MessageError(format!(
            "interval {seconds}s not allowed; pick one of {ALLOWED_INTERVALS:?}"
        ))),
    }
}

/// Applies a request on top of `current`; absent fields keep their value.
///
/// # Errors
/// Rejects unknown operations, an empty operation list and intervals
/// outside the whitelist.
pub fn merge_config(
    current: &MonitorConfig,
    interval: Option<u64>,
    operations: Option<&[String]>,
) -> Result<MonitorConfig, MessageError> {
    let interval = checked_interval(interval, current.interval)?;
    let operations = match operations {
        None => current.operations.clone(),
        Some(names) => {
            let mut parsed = Vec::with_capacity(names.len());
            for name in names {
                let operation = DashboardOperation::parse(name)
                    .ok_or_else(|| MessageError(format!("unknown monitor operation '{name}'")))?;
                if !parsed.contains(&operation) {
                    parsed.push(operation);
                }
            }
            if parsed.is_empty() {
                return Err(MessageError("monitor needs at least one operation".to_string()));
            }
            parsed
        }
    };
    Ok(MonitorConfig { interval, operations })
}

/// What a monitor samples on every tick.
#[derive(Clone)]
pub enum MonitorTarget {
    Dashboard {
        organization_id: String,
        runtime: Arc<dyn ContainerRuntime>,
        hosts: Arc<dyn HostProvider>,
    },
    Application {
        organization_id: String,
        application_id: String,
        runtime: Arc<dyn ContainerRuntime>,
    },
}

impl MonitorTarget {
    async fn sample(&self, config: &MonitorConfig) -> Vec<ServerMessage> {
        match self {
            Self::Dashboard {
                organization_id,
                runtime,
                hosts,
            } => {
                let mut messages = Vec::with_capacity(config.operations.len());
                for operation in &config.operations {
                    let result = match operation {
                        DashboardOperation::GetContainers => {
                            list_containers(runtime.as_ref(), organization_id, &LabelFilters::new()).await
                        }
                        DashboardOperation::GetSystemStats => system_stats(hosts.as_ref(), organization_id).await,
                    };
                    messages.push(ServerMessage::new(DASHBOARD_ACTION, outcome(operation.as_str(), result)));
                }
                messages
            }
            Self::Application {
                organization_id,
                application_id,
                runtime,
            } => {
                let result = application_stats(runtime.as_ref(), organization_id, application_id).await;
                let mut data = outcome("get_application_stats", result);
                data["application_id"] = Value::String(application_id.clone());
                vec![ServerMessage::new(APPLICATION_ACTION, data)]
            }
        }
    }
}

fn outcome(operation: &str, result: Result<Value, String>) -> Value {
    match result {
        Ok(data) => json!({ "operation": operation, "data": data }),
        Err(error) => json!({ "operation": operation, "error": error }),
    }
}

async fn list_containers(
    runtime: &dyn ContainerRuntime,
    organization_id: &str,
    filters: &LabelFilters,
) -> Result<Value, String> {
    let containers = runtime
        .containers_for(organization_id)
        .await
        .map_err(|error| error.to_string())?;
    let listed = containers
        .list_containers(filters)
        .await
        .map_err(|error| error.to_string())?;
    serde_json::to_value(listed).map_err(|error| error.to_string())
}

async fn system_stats(hosts: &dyn HostProvider, organization_id: &str) -> Result<Value, String> {
    let reader = hosts
        .system_reader_for(organization_id)
        .await
        .map_err(|error| error.to_string())?;
    let snapshot = reader.snapshot().await.map_err(|error| error.to_string())?;
    serde_json::to_value(snapshot).map_err(|error| error.to_string())
}

async fn application_stats(
    runtime: &dyn ContainerRuntime,
    organization_id: &str,
    application_id: &str,
) -> Result<Value, String> {
    let containers = runtime
        .containers_for(organization_id)
        .await
        .map_err(|error| error.to_string())?;
    let listed = containers
        .list_containers(&label_filter(LABEL_APPLICATION_ID, application_id))
        .await
        .map_err(|error| error.to_string())?;

    let mut stats = Vec::with_capacity(listed.len());
    for container in listed.iter().filter(|container| container.is_running()) {
        match containers.container_stats(&container.id).await {
            Ok(sample) => stats.push(sample),
            Err(error) => debug!(container = %container.name, %error, "skipping container stats"),
        }
    }
    serde_json::to_value(stats).map_err(|error| error.to_string())
}

pub struct MonitorHandle {
    cancel: CancellationToken,
    config: watch::Sender<MonitorConfig>,
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    #[must_use]
    pub fn config(&self) -> MonitorConfig {
        self.config.borrow().clone()
    }

    pub fn update(&self, config: MonitorConfig) {
        self.config.send_replace(config);
    }

    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Starts a monitor that samples once immediately and then on every tick.
#[must_use]
pub fn spawn(target: MonitorTarget, config: MonitorConfig, outbound: mpsc::Sender<ServerMessage>) -> MonitorHandle {
    let cancel = CancellationToken::new();
    let (config_tx, mut config_rx) = watch::channel(config);
    let token = cancel.clone();

    let task = tokio::spawn(async move {
        let mut current = config_rx.borrow_and_update().clone();
        let mut ticker = new_ticker(current.interval);
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                changed = config_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    current = config_rx.borrow_and_update().clone();
                    ticker = new_ticker(current.interval);
                }
                _ = ticker.tick() => {
                    for message in target.sample(&current).await {
                        if outbound.send(message).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    });

    MonitorHandle {
        cancel,
        config: config_tx,
        task: Some(task),
    }
}

fn new_ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::testing::{FakeContainers, FakeHost, FakeHostProvider, FakeRuntime};

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn intervals_come_from_the_whitelist() {
        let current = MonitorConfig::default();
        assert_eq!(
            merge_config(&current, Some(5), None).expect("five").interval,
            Duration::from_secs(5)
        );
        assert!(merge_config(&current, Some(3), None).is_err());
        assert!(merge_config(&current, Some(0), None).is_err());
        assert_eq!(merge_config(&current, None, None).expect("same"), current);
    }

    #[test]
    fn operations_are_validated_and_deduplicated() {
        let current = MonitorConfig::default();
        let merged = merge_config(
            &current,
            None,
            Some(names(&["get_system_stats", "get_system_stats"]).as_slice()),
        )
        .expect("merged");
        assert_eq!(merged.operations, vec![DashboardOperation::GetSystemStats]);

        assert!(merge_config(&current, None, Some(names(&["rm_rf"]).as_slice())).is_err());
        assert!(merge_config(&current, None, Some(Vec::new().as_slice())).is_err());
    }

    #[tokio::test]
    async fn dashboard_monitors_sample_immediately_and_stop_on_request() {
        let containers = Arc::new(FakeContainers::new());
        containers.add_container("web-1", "web:latest", BTreeMap::new(), true);
        let target = MonitorTarget::Dashboard {
            organization_id: "org-1".to_string(),
            runtime: Arc::new(FakeRuntime::new(containers)),
            hosts: Arc::new(FakeHostProvider::new(Arc::new(FakeHost::new()))),
        };
        let (tx, mut rx) = mpsc::channel(16);

        let handle = spawn(target, MonitorConfig::default(), tx);
        let first = rx.recv().await.expect("containers");
        assert_eq!(first.action, DASHBOARD_ACTION);
        assert_eq!(first.data["operation"], "get_containers");
        assert_eq!(first.data["data"][0]["name"], "web-1");

        let second = rx.recv().await.expect("system stats");
        assert_eq!(second.data["operation"], "get_system_stats");
        assert_eq!(second.data["data"]["hostname"], "fake-host");

        handle.stop().await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn updates_retune_the_running_monitor() {
        let containers = Arc::new(FakeContainers::new());
        let target = MonitorTarget::Dashboard {
            organization_id: "org-1".to_string(),
            runtime: Arc::new(FakeRuntime::new(containers)),
            hosts: Arc::new(FakeHostProvider::new(Arc::new(FakeHost::new()))),
        };
        let (tx, mut rx) = mpsc::channel(16);
        let handle = spawn(target, MonitorConfig::default(), tx);
        rx.recv().await.expect("first containers");
        rx.recv().await.expect("first stats");

        let updated = MonitorConfig {
            interval: Duration::from_secs(1),
            operations: vec![DashboardOperation::GetSystemStats],
        };
        handle.update(updated.clone());
        assert_eq!(handle.config(), updated);

        let next = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("ticks after the update")
            .expect("message");
        assert_eq!(next.data["operation"], "get_system_stats");
        handle.stop().await;
    }

    #[tokio::test]
    async fn application_monitors_report_running_containers_only() {
        let containers = Arc::new(FakeContainers::new());
        let labels = BTreeMap::from([(LABEL_APPLICATION_ID.to_string(), "app-1".to_string())]);
        containers.add_container("app-1-live", "app:1", labels.clone(), true);
        containers.add_container("app-1-old", "app:0", labels, false);
        containers.add_container("other", "other:1", BTreeMap::new(), true);

        let target = MonitorTarget::Application {
            organization_id: "org-1".to_string(),
            application_id: "app-1".to_string(),
            runtime: Arc::new(FakeRuntime::new(containers)),
        };
        let (tx, mut rx) = mpsc::channel(4);
        let handle = spawn(target, MonitorConfig::default(), tx);

        let message = rx.recv().await.expect("stats");
        assert_eq!(message.action, APPLICATION_ACTION);
        assert_eq!(message.data["application_id"], "app-1");
        let stats = message.data["data"].as_array().expect("array");
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0]["name"], "app-1-live");
        handle.stop().await;
    }
}
