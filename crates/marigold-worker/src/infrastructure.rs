//! The contract between a worker and whatever actually executes a run.

use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;
use marigold_schemas::Run;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::error::InfrastructureError;

/// Everything the infrastructure needs to launch one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfiguration {
  pub run_id: Uuid,
  pub name: String,
  pub command: Vec<String>,
  #[serde(default)]
  pub env: BTreeMap<String, String>,
  #[serde(default)]
  pub labels: BTreeMap<String, String>,
}

impl JobConfiguration {
  /// A job for `run` with the standard environment and labels.
  pub fn for_run(run: &Run, command: Vec<String>) -> Self {
    let mut env = BTreeMap::new();
    env.insert("MARIGOLD_RUN_ID".to_string(), run.id.to_string());
    env.insert("MARIGOLD_RUN_NAME".to_string(), run.name.clone());

    let mut labels = BTreeMap::new();
    labels.insert("marigold.run-id".to_string(), run.id.to_string());
    if let Some(deployment_id) = run.deployment_id {
      labels.insert("marigold.deployment-id".to_string(), deployment_id.to_string());
    }
    Self {
      run_id: run.id,
      name: run.name.clone(),
      command,
      env,
      labels,
    }
  }
}

/// How a launched job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfrastructureResult {
  pub identifier: String,
  pub status_code: i32,
}

/// Reports that the job is up, with its infrastructure identifier.
///
/// Dropping it without calling [`started`](Self::started) tells the worker
/// the job never started.
pub struct StartedSignal(oneshot::Sender<String>);

impl StartedSignal {
  pub fn new() -> (Self, oneshot::Receiver<String>) {
    let (tx, rx) = oneshot::channel();
    (Self(tx), rx)
  }

  pub fn started(self, identifier: impl Into<String>) {
    // The worker may have stopped listening.
    let _ = self.0.send(identifier.into());
  }
}

#[async_trait]
pub trait Infrastructure: Send + Sync + 'static {
  /// Build the job for a claimed run.
  async fn prepare(&self, run: &Run) -> Result<JobConfiguration, InfrastructureError>;

  /// Launch the job, signal once it is running, and wait for it to exit.
  async fn run(
    &self,
    job: JobConfiguration,
    started: StartedSignal,
  ) -> Result<InfrastructureResult, InfrastructureError>;

  /// Stop a job by the identifier `run` reported.
  async fn kill(&self, identifier: &str) -> Result<(), InfrastructureError>;
}

/// Runs each job as a local child process.
pub struct ProcessInfrastructure {
  command: Vec<String>,
}

impl ProcessInfrastructure {
  pub fn new(command: Vec<String>) -> Self {
    Self { command }
  }
}

#[async_trait]
impl Infrastructure for ProcessInfrastructure {
  async fn prepare(&self, run: &Run) -> Result<JobConfiguration, InfrastructureError> {
    if self.command.is_empty() {
      return Err(InfrastructureError::Prepare("no command configured".to_string()));
    }
    Ok(JobConfiguration::for_run(run, self.command.clone()))
  }

  async fn run(
    &self,
    job: JobConfiguration,
    started: StartedSignal,
  ) -> Result<InfrastructureResult, InfrastructureError> {
    let Some((program, args)) = job.command.split_first() else {
      return Err(InfrastructureError::Launch("empty command".to_string()));
    };
    let mut child = Command::new(program)
      .args(args)
      .envs(&job.env)
      .stdin(Stdio::null())
      .spawn()
      .map_err(|e| InfrastructureError::Launch(format!("{}: {}", program, e)))?;

    let identifier = child.id().map(|pid| pid.to_string()).unwrap_or_default();
    debug!(run_id = %job.run_id, pid = %identifier, "process_started");
    started.started(identifier.clone());

    let status = child.wait().await?;
    Ok(InfrastructureResult {
      identifier,
      // Killed by a signal: report it as a failure.
      status_code: status.code().unwrap_or(-1),
    })
  }

  async fn kill(&self, identifier: &str) -> Result<(), InfrastructureError> {
    let status = Command::new("kill").arg(identifier).status().await?;
    if status.success() {
      Ok(())
    } else {
      Err(InfrastructureError::Kill(format!(
        "kill {} exited with {}",
        identifier, status
      )))
    }
  }
}
