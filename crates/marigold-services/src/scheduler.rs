//! Keeps a rolling horizon of SCHEDULED runs for every scheduled deployment.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use marigold_config::SchedulerSettings;
use marigold_schemas::{Deployment, Run, ScheduleError};
use marigold_store::Store;
use tracing::{debug, error, info};

use crate::error::ServiceError;
use crate::loop_service::LoopService;

pub struct Scheduler {
  store: Arc<dyn Store>,
  settings: SchedulerSettings,
}

impl Scheduler {
  pub fn new(store: Arc<dyn Store>, settings: SchedulerSettings) -> Self {
    Self { store, settings }
  }

  /// Materialize upcoming runs for every schedulable deployment.
  ///
  /// Returns how many runs were inserted. A deployment whose schedule cannot
  /// be evaluated is logged and skipped.
  pub async fn schedule_deployments(&self, now: DateTime<Utc>) -> Result<usize, ServiceError> {
    let batch_size = self.settings.deployment_batch_size.max(1);
    let mut offset = 0;
    let mut inserted = 0;

    loop {
      let deployments = self
        .store
        .read_schedulable_deployments(offset, batch_size)
        .await?;
      let read = deployments.len();

      for deployment in &deployments {
        let runs = match self.runs_for_deployment(deployment, now) {
          Ok(runs) => runs,
          Err(e) => {
            error!(
              deployment_id = %deployment.id,
              deployment = %deployment.name,
              error = %e,
              "deployment_schedule_failed"
            );
            continue;
          }
        };
        if runs.is_empty() {
          continue;
        }
        match self.store.insert_scheduled_runs(&runs).await {
          Ok(count) => {
            debug!(deployment_id = %deployment.id, count, "scheduled_runs_inserted");
            inserted += count;
          }
          Err(e) => {
            error!(deployment_id = %deployment.id, error = %e, "scheduled_runs_insert_failed");
          }
        }
      }

      if read < batch_size {
        break;
      }
      offset += read;
    }

    info!(inserted, "Scheduled {} runs.", inserted);
    Ok(inserted)
  }

  /// The runs `deployment` should have from `now` on.
  ///
  /// Each active schedule contributes dates until both minimums are met
  /// (`min_runs` runs and `min_scheduled_hours` of coverage), never past
  /// `max_runs` or `max_scheduled_days`.
  pub fn runs_for_deployment(
    &self,
    deployment: &Deployment,
    now: DateTime<Utc>,
  ) -> Result<Vec<Run>, ScheduleError> {
    // Horizons past the calendar are unbounded.
    let end = Duration::try_days(self.settings.max_scheduled_days)
      .and_then(|days| now.checked_add_signed(days));
    let covered_until = Duration::try_hours(self.settings.min_scheduled_hours)
      .and_then(|hours| now.checked_add_signed(hours));

    let mut seen = HashSet::new();
    let mut runs = Vec::new();
    for schedule in deployment.schedules.iter().filter(|s| s.active) {
      let dates = schedule
        .schedule
        .occurrences(now, end, self.settings.max_runs)?;
      for (i, date) in dates.into_iter().enumerate() {
        if i >= self.settings.min_runs && covered_until.is_some_and(|until| date > until) {
          break;
        }
        // Two schedules landing on the same instant make one run.
        if seen.insert(date) {
          runs.push(deployment.scheduled_run(date));
        }
      }
    }
    Ok(runs)
  }
}

#[async_trait]
impl LoopService for Scheduler {
  fn name(&self) -> &'static str {
    "Scheduler"
  }

  fn loop_seconds(&self) -> u64 {
    self.settings.loop_seconds
  }

  async fn run_once(&self) -> Result<(), ServiceError> {
    self.schedule_deployments(Utc::now()).await.map(|_| ())
  }
}
