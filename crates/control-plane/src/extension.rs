//! Declarative extensions: specs stored per organization and run step by
//! step against the tenant's host. Every completed step leaves a
//! compensation; when a later step fails or the run is cancelled the
//! compensations run newest first.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::AuthContext;
use crate::db::{DbClient, ExecutionStatus, ExtensionExecutionRecord, ExtensionRecord, Page, PermissionAction};
use crate::docker::{ContainerRuntime, DockerError};
use crate::error::{conflict_on_unique, AppError};
use crate::host::{HostError, HostProvider, DEFAULT_COMMAND_TIMEOUT};
use crate::jobs::{JobContext, JobError, JobHandler, JobQueue, EXTENSION_EXECUTION_QUEUE};
use crate::proxy::{ProxyError, ProxyManager};
use crate::telemetry;

pub mod spec;
pub mod steps;


use spec::{substitute, substitute_value, ExtensionSpec, StepKind, StepSpec};
use steps::{StepAction, StepEnv, StepOutcome};

const ROLLBACK_TIMEOUT: Duration = DEFAULT_COMMAND_TIMEOUT;

#[derive(Debug, thiserror::Error)]
pub enum ExtensionError {
    #[error("invalid extension spec: {0}")]
    InvalidSpec(String),
    #[error("{0}")]
    Variable(String),
    #[error("step {step}: {message}")]
    InvalidStep { step: String, message: String },
    #[error("{0}")]
    Unsupported(String),
    #[error("command exited with status {exit_code}: {output}")]
    CommandFailed { exit_code: i32, output: String },
    #[error("step timed out after {0:?}")]
    Timeout(Duration),
    #[error("execution cancelled")]
    Cancelled,
    #[error(transparent)]
    Host(#[from] HostError),
    #[error(transparent)]
    Docker(#[from] DockerError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

impl From<ExtensionError> for AppError {
    fn from(error: ExtensionError) -> Self {
        match error {
            ExtensionError::Host(error) => error.into(),
            ExtensionError::Docker(error) => error.into(),
            ExtensionError::Proxy(error) => error.into(),
            ExtensionError::InvalidSpec(_)
            | ExtensionError::Variable(_)
            | ExtensionError::InvalidStep { .. }
            | ExtensionError::Unsupported(_) => Self::Validation(error.to_string()),
            other => Self::Internal(anyhow::anyhow!(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
}

#[derive(Clone, Debug, Serialize)]
pub struct StepReport {
    pub name: String,
    pub kind: StepKind,
    pub status: StepStatus,
    pub output: String,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct CompensationReport {
    pub step: String,
    pub action: String,
    pub succeeded: bool,
    pub output: String,
}

/// Stored as the execution's output.
#[derive(Clone, Debug, Serialize)]
pub struct ExecutionReport {
    pub status: ExecutionStatus,
    pub steps: Vec<StepReport>,
    pub rollback: Vec<CompensationReport>,
    pub error: Option<String>,
    #[serde(skip)]
    pub cancelled: bool,
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Substitutes variables, parses the action and runs it under the step's
/// timeout.
async fn run_step(
    step: &StepSpec,
    variables: &BTreeMap<String, String>,
    env: &StepEnv<'_>,
) -> Result<StepOutcome, ExtensionError> {
    let properties = step
        .properties
        .iter()
        .map(|(key, value)| Ok((key.clone(), substitute_value(value, variables)?)))
        .collect::<Result<BTreeMap<_, _>, ExtensionError>>()?;
    let revert_cmd = step
        .revert_cmd
        .as_deref()
        .map(|command| substitute(command, variables))
        .transpose()?;
    let revert_action = step
        .revert_action
        .as_deref()
        .map(|action| substitute(action, variables))
        .transpose()?;

    let action = StepAction::parse(&step.name, step.kind, &properties, revert_action.as_deref())?;
    let timeout = step.timeout();
    tokio::time::timeout(timeout, action.run(env, timeout, revert_cmd.as_deref()))
        .await
        .map_err(|_| ExtensionError::Timeout(timeout))?
}

/// Runs every step in order. On the first failure, or on cancellation, the
/// compensations collected so far run in reverse; rollback itself is not
/// cancellable.
pub async fn execute(
    spec: &ExtensionSpec,
    variables: &BTreeMap<String, String>,
    env: &StepEnv<'_>,
    cancel: &CancellationToken,
) -> ExecutionReport {
    let mut report = ExecutionReport {
        status: ExecutionStatus::Succeeded,
        steps: Vec::with_capacity(spec.steps.len()),
        rollback: Vec::new(),
        error: None,
        cancelled: false,
    };
    let mut compensations = Vec::new();

    for step in &spec.steps {
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ExtensionError::Cancelled),
            result = run_step(step, variables, env) => result,
        };

        match result {
            Ok(outcome) => {
                info!(extension = %spec.name, step = %step.name, kind = step.kind.as_str(), "extension step succeeded");
                if let Some(compensation) = outcome.compensation {
                    compensations.push((step.name.clone(), compensation));
                }
                report.steps.push(StepReport {
                    name: step.name.clone(),
                    kind: step.kind,
                    status: StepStatus::Succeeded,
                    output: outcome.output,
                    error: None,
                    duration_ms: elapsed_ms(started),
                });
            }
            Err(error) => {
                warn!(extension = %spec.name, step = %step.name, %error, "extension step failed");
                report.cancelled = matches!(error, ExtensionError::Cancelled);
                report.error = Some(format!("step {}: {error}", step.name));
                report.steps.push(StepReport {
                    name: step.name.clone(),
                    kind: step.kind,
                    status: StepStatus::Failed,
                    output: String::new(),
                    error: Some(error.to_string()),
                    duration_ms: elapsed_ms(started),
                });
                break;
            }
        }
    }

    if report.error.is_none() {
        return report;
    }

    let mut all_undone = true;
    while let Some((step, compensation)) = compensations.pop() {
        let action = compensation.to_string();
        let result = tokio::time::timeout(ROLLBACK_TIMEOUT, compensation.apply(env, ROLLBACK_TIMEOUT))
            .await
            .unwrap_or(Err(ExtensionError::Timeout(ROLLBACK_TIMEOUT)));
        let (succeeded, output) = match result {
            Ok(output) => (true, output),
            Err(error) => {
                warn!(extension = %spec.name, %step, %action, %error, "compensation failed");
                all_undone = false;
                (false, error.to_string())
            }
        };
        report.rollback.push(CompensationReport {
            step,
            action,
            succeeded,
            output,
        });
    }

    report.status = if all_undone && !report.rollback.is_empty() {
        ExecutionStatus::RolledBack
    } else {
        ExecutionStatus::Failed
    };
    report
}

/// Payload of an `extension-execution` job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtensionJob {
    pub execution_id: String,
}

/// Runs of the same extension never overlap.
#[must_use]
pub fn extension_job_key(extension_id: &str) -> String {
    format!("extension:{extension_id}")
}

#[derive(Clone)]
pub struct ExtensionService {
    db: DbClient,
    jobs: JobQueue,
}

impl ExtensionService {
    #[must_use]
    pub fn new(db: DbClient, jobs: JobQueue) -> Self {
        Self { db, jobs }
    }

    /// Stores a spec after checking that it parses.
    ///
    /// # Errors
    /// `Validation` for an unusable spec, `Conflict` when the organization
    /// already has an extension with that name.
    pub async fn create(&self, context: &AuthContext, spec_text: &str) -> Result<ExtensionRecord, AppError> {
        let spec = ExtensionSpec::parse(spec_text)?;
        let audit = context.audit(
            "extension",
            PermissionAction::Create,
            None,
            json!({ "name": spec.name, "steps": spec.steps.len() }),
        );
        self.db
            .create_extension(&context.organization_id, &spec.name, &spec.description, spec_text, &audit)
            .await
            .map_err(|error| match error.downcast::<sqlx::Error>() {
                Ok(error) => conflict_on_unique(error, "an extension with this name already exists"),
                Err(error) => AppError::Internal(error),
            })
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn list(&self, organization_id: &str) -> Result<Vec<ExtensionRecord>, AppError> {
        Ok(self.db.list_extensions(organization_id).await?)
    }

    /// Records a pending execution with resolved variables and queues it.
    ///
    /// # Errors
    /// `NotFound` for an unknown extension, `Validation` for bad variables.
    pub async fn run(
        &self,
        context: &AuthContext,
        extension_id: &str,
        variables: &BTreeMap<String, Value>,
    ) -> Result<ExtensionExecutionRecord, AppError> {
        let extension = self
            .db
            .get_extension(&context.organization_id, extension_id)
            .await?
            .ok_or_else(|| AppError::not_found("extension not found"))?;
        let spec = ExtensionSpec::parse(&extension.spec)?;
        let resolved = spec.resolve_variables(variables)?;

        let audit = context.audit(
            "extension",
            PermissionAction::Update,
            Some(&extension.id),
            json!({ "run": extension.name }),
        );
        let execution = self
            .db
            .create_extension_execution(&extension, &json!(resolved), &audit)
            .await?;

        let payload = serde_json::to_value(ExtensionJob {
            execution_id: execution.id.clone(),
        })
        .map_err(anyhow::Error::from)?;
        if let Err(error) = self
            .jobs
            .enqueue(EXTENSION_EXECUTION_QUEUE, &extension_job_key(&extension.id), None, payload)
            .await
        {
            let message = format!("could not queue execution: {error:#}");
            self.db
                .update_extension_execution(&execution.id, ExecutionStatus::Failed, "", Some(&message))
                .await?;
            return Err(error.into());
        }

        info!(extension = %extension.name, execution_id = %execution.id, "extension execution queued");
        Ok(execution)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn executions(&self, organization_id: &str, page: Page) -> Result<Vec<ExtensionExecutionRecord>, AppError> {
        Ok(self.db.list_extension_executions(organization_id, page).await?)
    }

    /// # Errors
    /// `NotFound` when the execution belongs to another organization.
    pub async fn execution(&self, organization_id: &str, execution_id: &str) -> Result<ExtensionExecutionRecord, AppError> {
        self.db
            .get_extension_execution(execution_id)
            .await?
            .filter(|execution| execution.organization_id == organization_id)
            .ok_or_else(|| AppError::not_found("extension execution not found"))
    }
}

pub struct ExtensionJobHandler {
    db: DbClient,
    hosts: Arc<dyn HostProvider>,
    runtime: Arc<dyn ContainerRuntime>,
    proxy: Arc<ProxyManager>,
}

impl ExtensionJobHandler {
    #[must_use]
    pub fn new(
        db: DbClient,
        hosts: Arc<dyn HostProvider>,
        runtime: Arc<dyn ContainerRuntime>,
        proxy: Arc<ProxyManager>,
    ) -> Self {
        Self {
            db,
            hosts,
            runtime,
            proxy,
        }
    }

    async fn fail(&self, execution_id: &str, message: String) -> Result<(), JobError> {
        self.db
            .update_extension_execution(execution_id, ExecutionStatus::Failed, "", Some(&message))
            .await?;
        telemetry::extension_finished(ExecutionStatus::Failed.as_str(), 0);
        Err(JobError::Terminal(message))
    }
}

fn prepare(
    extension: &ExtensionRecord,
    execution: &ExtensionExecutionRecord,
) -> Result<(ExtensionSpec, BTreeMap<String, String>), ExtensionError> {
    let spec = ExtensionSpec::parse(&extension.spec)?;
    let stored: BTreeMap<String, Value> = serde_json::from_str(&execution.variables)
        .map_err(|error| ExtensionError::Variable(format!("stored variables are unreadable: {error}")))?;
    let variables = spec.resolve_variables(&stored)?;
    Ok((spec, variables))
}

#[async_trait]
impl JobHandler for ExtensionJobHandler {
    async fn handle(&self, context: &JobContext) -> Result<(), JobError> {
        let job: ExtensionJob = context.payload()?;
        let Some(execution) = self.db.get_extension_execution(&job.execution_id).await? else {
            return Err(JobError::Terminal(format!("extension execution {} not found", job.execution_id)));
        };
        if matches!(
            execution.status,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed | ExecutionStatus::RolledBack
        ) {
            return Ok(());
        }

        let Some(extension) = self
            .db
            .get_extension(&execution.organization_id, &execution.extension_id)
            .await?
        else {
            return self.fail(&execution.id, "extension was deleted".to_string()).await;
        };
        let (spec, variables) = match prepare(&extension, &execution) {
            Ok(prepared) => prepared,
            Err(error) => return self.fail(&execution.id, error.to_string()).await,
        };

        let organization_id = execution.organization_id.as_str();
        let host = match self.hosts.host_for(organization_id).await {
            Ok(host) => host,
            Err(error) if error.is_retryable() && !context.is_last_attempt() => {
                return Err(JobError::Retryable(error.to_string()));
            }
            Err(error) => return self.fail(&execution.id, error.to_string()).await,
        };
        let containers = match self.runtime.containers_for(organization_id).await {
            Ok(containers) => containers,
            Err(DockerError::Infrastructure(message)) if !context.is_last_attempt() => {
                return Err(JobError::Retryable(message));
            }
            Err(error) => return self.fail(&execution.id, error.to_string()).await,
        };

        self.db
            .update_extension_execution(&execution.id, ExecutionStatus::Running, "", None)
            .await?;
        info!(extension = %extension.name, execution_id = %execution.id, steps = spec.steps.len(), "extension execution started");

        let env = StepEnv {
            organization_id,
            extension_id: &extension.id,
            host: host.as_ref(),
            containers: containers.as_ref(),
            proxy: &self.proxy,
        };
        let report = execute(&spec, &variables, &env, &context.cancel_token()).await;

        let output = serde_json::to_string(&report).map_err(anyhow::Error::from)?;
        self.db
            .update_extension_execution(&execution.id, report.status, &output, report.error.as_deref())
            .await?;
        telemetry::extension_finished(report.status.as_str(), report.steps.len());
        info!(execution_id = %execution.id, status = report.status.as_str(), "extension execution finished");

        match (report.status, report.error) {
            (ExecutionStatus::Succeeded, _) => Ok(()),
            _ if report.cancelled => Err(JobError::Cancelled),
            (_, error) => Err(JobError::Terminal(error.unwrap_or_else(|| "extension failed".to_string()))),
        }
    }
}
