//! Sends autonomous task runs stuck in PENDING back to SCHEDULED.
//!
//! An autonomous task run (one with no enclosing flow run) is claimed by a
//! task worker with PENDING. If that worker dies before RUNNING, nothing else
//! would ever pick the run up again.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use marigold_config::TaskSchedulingSettings;
use marigold_orchestration::{NoopNotifier, OrchestrationEngine, Parameters, TransitionNotifier};
use marigold_schemas::{RunKind, State, StateType};
use marigold_store::RunFilter;
use tracing::{error, info, warn};

use crate::error::ServiceError;
use crate::loop_service::LoopService;

pub struct RescheduleStuckPendingTasks<N: TransitionNotifier + 'static = NoopNotifier> {
  engine: Arc<OrchestrationEngine<N>>,
  settings: TaskSchedulingSettings,
}

impl<N: TransitionNotifier + 'static> RescheduleStuckPendingTasks<N> {
  pub fn new(engine: Arc<OrchestrationEngine<N>>, settings: TaskSchedulingSettings) -> Self {
    Self { engine, settings }
  }

  /// Returns how many task runs were rescheduled.
  pub async fn reschedule_pending_runs(&self, now: DateTime<Utc>) -> Result<usize, ServiceError> {
    let store = self.engine.store();
    let filter = RunFilter {
      kind: Some(RunKind::Task),
      state_types: vec![StateType::Pending],
      autonomous_only: true,
      state_entered_before: Some(
        now - Duration::seconds(self.settings.pending_task_timeout_seconds),
      ),
      ..RunFilter::default()
    };
    let runs = store.read_runs(&filter).await?;

    let mut rescheduled = 0;
    for run in runs {
      info!(run_id = %run.id, "Rescheduling task run {}", run.id);

      let mut history = match store.read_run_states(run.id).await {
        Ok(history) => history,
        Err(e) => {
          error!(run_id = %run.id, error = %e, "task_run_history_read_failed");
          continue;
        }
      };
      history.sort_by_key(|s| s.timestamp);
      let Some(prior) = history
        .iter()
        .find(|s| s.state_type == StateType::Scheduled)
      else {
        warn!(run_id = %run.id, "No prior scheduled state found for task run {}", run.id);
        continue;
      };

      let mut state = State::scheduled(now);
      state.state_details.task_parameters_id = prior.state_details.task_parameters_id;

      match self
        .engine
        .propose_state(run.id, state, true, Parameters::new())
        .await
      {
        Ok(_) => rescheduled += 1,
        Err(e) => error!(run_id = %run.id, error = %e, "task_run_reschedule_failed"),
      }
    }

    info!(count = rescheduled, "Rescheduled {} pending task runs", rescheduled);
    Ok(rescheduled)
  }
}

#[async_trait]
impl<N: TransitionNotifier + 'static> LoopService for RescheduleStuckPendingTasks<N> {
  fn name(&self) -> &'static str {
    "TaskSchedulingTimeouts"
  }

  fn loop_seconds(&self) -> u64 {
    self.settings.loop_seconds
  }

  async fn run_once(&self) -> Result<(), ServiceError> {
    self.reschedule_pending_runs(Utc::now()).await.map(|_| ())
  }
}
