//! Marks SCHEDULED flow runs that missed their start time as "Late".

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use marigold_config::LateRunsSettings;
use marigold_orchestration::{
  NoopNotifier, OrchestrationEngine, Outcome, Parameters, TransitionNotifier, late_runs_policy,
};
use marigold_schemas::{RunKind, State, StateType};
use marigold_store::RunFilter;
use tracing::{debug, error, info};

use crate::error::ServiceError;
use crate::loop_service::LoopService;

/// Name of the SCHEDULED state a late run is moved into.
const LATE: &str = "Late";

pub struct MarkLateRuns<N: TransitionNotifier + 'static = NoopNotifier> {
  engine: Arc<OrchestrationEngine<N>>,
  settings: LateRunsSettings,
}

impl<N: TransitionNotifier + 'static> MarkLateRuns<N> {
  pub fn new(engine: Arc<OrchestrationEngine<N>>, settings: LateRunsSettings) -> Self {
    Self { engine, settings }
  }

  /// Returns how many runs were marked.
  pub async fn mark_late_runs(&self, now: DateTime<Utc>) -> Result<usize, ServiceError> {
    let filter = RunFilter {
      kind: Some(RunKind::Flow),
      state_types: vec![StateType::Scheduled],
      exclude_state_names: vec![LATE.to_string()],
      next_scheduled_before: Some(now - Duration::seconds(self.settings.after_seconds)),
      ..RunFilter::default()
    };
    let runs = self.engine.store().read_runs(&filter).await?;

    let mut marked = 0;
    for run in runs {
      let scheduled_time = run
        .next_scheduled_start_time
        .or_else(|| run.state.as_ref().and_then(State::scheduled_time))
        .unwrap_or(now);
      let outcome = self
        .engine
        .propose_state_with_policy(
          run.id,
          State::late(scheduled_time),
          false,
          Parameters::new(),
          late_runs_policy(self.engine.notifier()),
        )
        .await;
      match outcome {
        Ok(Outcome::Accept { .. }) => marked += 1,
        Ok(other) => {
          debug!(
            run_id = %run.id,
            reason = other.reason().unwrap_or_default(),
            "late_run_not_marked"
          );
        }
        Err(e) => error!(run_id = %run.id, error = %e, "late_run_mark_failed"),
      }
    }

    if marked > 0 {
      info!(count = marked, "Marked {} flow runs as late.", marked);
    }
    Ok(marked)
  }
}

#[async_trait]
impl<N: TransitionNotifier + 'static> LoopService for MarkLateRuns<N> {
  fn name(&self) -> &'static str {
    "MarkLateRuns"
  }

  fn loop_seconds(&self) -> u64 {
    self.settings.loop_seconds
  }

  async fn run_once(&self) -> Result<(), ServiceError> {
    self.mark_late_runs(Utc::now()).await.map(|_| ())
  }
}
