//! The polling worker.
//!
//! Each poll claims ready runs by proposing PENDING, hands them to the
//! infrastructure, and keeps watching them in the background once the
//! infrastructure reports them started:
//!
//! ```text
//!   poll ──► PENDING ──► prepare ──► run ──► started ──► monitor exit code
//!             │ not ACCEPT            │ err      │ err           │ nonzero
//!             └ skip                  └ FAILED   └ CRASHED       └ CRASHED
//! ```

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::{Duration, Utc};
use marigold_config::WorkerSettings;
use marigold_orchestration::Outcome;
use marigold_schemas::{Run, State, StateType};
use marigold_work_queues::QueueSelector;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::client::{OrchestrationClient, PollRequest};
use crate::error::{InfrastructureError, WorkerError};
use crate::infrastructure::{Infrastructure, InfrastructureResult, StartedSignal};
use crate::limiter::Limiter;

type RunResult = Result<InfrastructureResult, InfrastructureError>;
type RunFuture = Pin<Box<dyn Future<Output = RunResult> + Send>>;

pub struct Worker {
  name: String,
  pool_name: Option<String>,
  selector: QueueSelector,
  settings: WorkerSettings,
  client: Arc<dyn OrchestrationClient>,
  infrastructure: Arc<dyn Infrastructure>,
  limiter: Option<Arc<Limiter>>,
  submitting: Mutex<HashSet<Uuid>>,
  monitors: tokio::sync::Mutex<JoinSet<()>>,
}

impl Worker {
  pub fn new(
    name: impl Into<String>,
    pool_name: Option<String>,
    selector: QueueSelector,
    settings: WorkerSettings,
    client: Arc<dyn OrchestrationClient>,
    infrastructure: Arc<dyn Infrastructure>,
  ) -> Self {
    let limiter = settings.limit.map(|limit| Arc::new(Limiter::new(limit)));
    Self {
      name: name.into(),
      pool_name,
      selector,
      settings,
      client,
      infrastructure,
      limiter,
      submitting: Mutex::new(HashSet::new()),
      monitors: tokio::sync::Mutex::new(JoinSet::new()),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn limiter(&self) -> Option<&Limiter> {
    self.limiter.as_deref()
  }

  /// Poll until `cancel` fires, heartbeating along the way.
  pub async fn start(&self, cancel: CancellationToken) -> Result<(), WorkerError> {
    info!(worker = %self.name, pool = ?self.pool_name, "starting worker");

    let heartbeat_every = std::time::Duration::from_secs(self.settings.heartbeat_seconds);
    let mut last_heartbeat: Option<Instant> = None;
    let mut interval = tokio::time::interval(self.settings.query_interval());

    loop {
      tokio::select! {
        _ = cancel.cancelled() => {
          info!(worker = %self.name, "worker cancelled");
          break;
        }
        _ = interval.tick() => {
          if last_heartbeat.is_none_or(|at| at.elapsed() >= heartbeat_every) {
            match self.client.heartbeat(self.pool_name.as_deref(), &self.name).await {
              Ok(()) => last_heartbeat = Some(Instant::now()),
              Err(e) => warn!(worker = %self.name, error = %e, "heartbeat_failed"),
            }
          }
          if let Err(e) = self.get_and_submit_runs().await {
            error!(worker = %self.name, error = %e, "poll_failed");
          }
        }
      }
    }

    self.wait_for_monitors().await;
    Ok(())
  }

  /// Claim and submit whatever is ready now. Returns the runs submitted.
  ///
  /// A limiter token is borrowed per submitted run and held until its job
  /// exits or the submission fails, so a full limiter stops the poll early.
  pub async fn get_and_submit_runs(&self) -> Result<Vec<Run>, WorkerError> {
    self.reap_monitors().await;

    let request = PollRequest {
      pool_name: self.pool_name.clone(),
      selector: self.selector.clone(),
      scheduled_before: Utc::now() + Duration::seconds(self.settings.prefetch_seconds),
      limit: None,
    };
    let runs = self.client.get_scheduled_runs(&request).await?;
    debug!(worker = %self.name, count = runs.len(), "runs_polled");

    let mut submitted = Vec::new();
    for run in runs {
      if self.submitting().contains(&run.id) {
        continue;
      }
      if let Some(limiter) = &self.limiter {
        if !limiter.try_acquire_on_behalf_of(run.id) {
          info!(
            worker = %self.name,
            "Flow run limit reached; {} flow runs in progress.",
            limiter.borrowed_tokens()
          );
          break;
        }
      }

      info!(run_id = %run.id, "Submitting flow run '{}'", run.id);
      self.submitting().insert(run.id);
      self.submit_run(&run).await;
      self.submitting().remove(&run.id);
      submitted.push(run);
    }
    Ok(submitted)
  }

  /// Number of background monitors not yet collected.
  pub async fn monitor_count(&self) -> usize {
    self.monitors.lock().await.len()
  }

  /// Collect monitors whose jobs already exited.
  async fn reap_monitors(&self) {
    let mut monitors = self.monitors.lock().await;
    while let Some(joined) = monitors.try_join_next() {
      if let Err(e) = joined {
        error!(error = %e, "monitor_task_failed");
      }
    }
  }

  /// Wait for every background monitor to finish.
  pub async fn wait_for_monitors(&self) {
    let mut monitors = self.monitors.lock().await;
    while let Some(joined) = monitors.join_next().await {
      if let Err(e) = joined {
        error!(error = %e, "monitor_task_failed");
      }
    }
  }

  /// Everything after the limiter token was borrowed. Unless the job is
  /// left running in the background, the token is given back on return.
  async fn submit_run(&self, run: &Run) {
    if !self.claim(run).await {
      self.release_token(run.id);
      return;
    }

    let job = match self.infrastructure.prepare(run).await {
      Ok(job) => job,
      Err(e) => {
        error!(
          run_id = %run.id,
          error = %e,
          "Failed to get infrastructure for flow run '{}'.",
          run.id
        );
        self
          .report_state(run.id, State::failed(format!("Submission failed. {}", e)))
          .await;
        self.release_token(run.id);
        return;
      }
    };

    let (signal, mut started) = StartedSignal::new();
    let infrastructure = self.infrastructure.clone();
    let mut execution: RunFuture = Box::pin(async move { infrastructure.run(job, signal).await });

    tokio::select! {
      biased;
      identifier = &mut started => match identifier {
        Ok(identifier) => {
          info!(
            run_id = %run.id,
            identifier = %identifier,
            "Completed submission of flow run '{}'",
            run.id
          );
          let client = self.client.clone();
          let limiter = self.limiter.clone();
          let run_id = run.id;
          self.monitors.lock().await.spawn(async move {
            report_exit(client.as_ref(), run_id, execution.await).await;
            if let Some(limiter) = limiter {
              limiter.release_on_behalf_of(run_id);
            }
          });
        }
        Err(_) => {
          let result = execution.await;
          self.not_started(run.id, result).await;
          self.release_token(run.id);
        }
      },
      result = &mut execution => {
        match started.try_recv() {
          Ok(identifier) => {
            info!(
              run_id = %run.id,
              identifier = %identifier,
              "Completed submission of flow run '{}'",
              run.id
            );
            report_exit(self.client.as_ref(), run.id, result).await;
          }
          Err(TryRecvError::Empty | TryRecvError::Closed) => self.not_started(run.id, result).await,
        }
        self.release_token(run.id);
      }
    }
  }

  /// Propose PENDING. Only an ACCEPT lets the submission go ahead.
  async fn claim(&self, run: &Run) -> bool {
    match self.client.propose_state(run.id, State::pending(), false).await {
      Ok(Outcome::Accept { .. }) => true,
      Ok(Outcome::Reject { state, .. }) if state.state_type == StateType::Pending => true,
      Ok(Outcome::Reject { state, .. }) => {
        info!(
          run_id = %run.id,
          "Aborted submission of flow run '{}': Server returned a non-pending state '{}'",
          run.id,
          state.state_type.as_str()
        );
        false
      }
      Ok(Outcome::Abort { reason }) | Ok(Outcome::Wait { reason, .. }) => {
        info!(
          run_id = %run.id,
          "Aborted submission of flow run '{}'. Server sent an abort signal: {}",
          run.id,
          reason
        );
        false
      }
      Err(e) => {
        error!(run_id = %run.id, error = %e, "Failed to update state of flow run '{}'", run.id);
        false
      }
    }
  }

  /// The infrastructure finished without ever reporting the run started.
  async fn not_started(&self, run_id: Uuid, result: RunResult) {
    match result {
      Err(e) => {
        error!(
          run_id = %run_id,
          error = %e,
          "Failed to submit flow run '{}' to infrastructure.",
          run_id
        );
        self
          .report_state(
            run_id,
            State::crashed(format!("Flow run could not be submitted to infrastructure:\n{}", e)),
          )
          .await;
      }
      Ok(_) => {
        error!(
          run_id = %run_id,
          "Infrastructure returned without reporting flow run '{}' as started or raising an \
           error. This behavior is not expected and generally indicates improper \
           implementation of infrastructure. The flow run will not be marked as failed, but an \
           issue may have occurred.",
          run_id
        );
      }
    }
  }

  async fn report_state(&self, run_id: Uuid, state: State) {
    if let Err(e) = self.client.propose_state(run_id, state, false).await {
      error!(run_id = %run_id, error = %e, "Failed to update state of flow run '{}'", run_id);
    }
  }

  fn release_token(&self, run_id: Uuid) {
    if let Some(limiter) = &self.limiter {
      limiter.release_on_behalf_of(run_id);
    }
  }

  fn submitting(&self) -> std::sync::MutexGuard<'_, HashSet<Uuid>> {
    self.submitting.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// Mark the run CRASHED if its job exited nonzero and nothing else finished it.
async fn report_exit(client: &dyn OrchestrationClient, run_id: Uuid, result: RunResult) {
  let result = match result {
    Ok(result) => result,
    Err(e) => {
      error!(
        run_id = %run_id,
        error = %e,
        "An error occurred while monitoring flow run '{}'. The flow run will not be marked as \
         failed, but an issue may have occurred.",
        run_id
      );
      return;
    }
  };
  if result.status_code == 0 {
    debug!(run_id = %run_id, identifier = %result.identifier, "job_exited");
    return;
  }

  match client.read_run(run_id).await {
    Ok(run) if run.state_type.is_some_and(StateType::is_terminal) => {
      debug!(run_id = %run_id, status_code = result.status_code, "job_exited_after_terminal_state");
      return;
    }
    Ok(_) => {}
    Err(e) => {
      error!(run_id = %run_id, error = %e, "Failed to read flow run '{}'", run_id);
      return;
    }
  }

  let message = format!(
    "Flow run infrastructure exited with non-zero status code {}.",
    result.status_code
  );
  match client
    .propose_state(run_id, State::crashed(message.clone()), false)
    .await
  {
    Ok(Outcome::Accept { .. } | Outcome::Reject { .. }) => {
      info!(run_id = %run_id, "Reported flow run '{}' as crashed: {}", run_id, message)
    }
    Ok(Outcome::Abort { reason } | Outcome::Wait { reason, .. }) => {
      warn!(
        run_id = %run_id,
        reason = %reason,
        "Flow run '{}' was not marked as crashed: {}",
        run_id,
        reason
      )
    }
    Err(e) => {
      error!(run_id = %run_id, error = %e, "Failed to update state of flow run '{}'", run_id)
    }
  }
}
