use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::run::{EmpiricalPolicy, Run};
use crate::schedule::Schedule;
use crate::states::State;

/// One schedule attached to a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentSchedule {
  pub id: Uuid,
  pub schedule: Schedule,
  /// Inactive schedules produce no new runs; already created runs stay.
  pub active: bool,
}

impl DeploymentSchedule {
  pub fn new(schedule: Schedule) -> Self {
    Self {
      id: Uuid::new_v4(),
      schedule,
      active: true,
    }
  }
}

/// A flow packaged for repeated execution through a work queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
  pub id: Uuid,
  pub name: String,
  pub flow_name: String,
  pub work_queue_id: Option<Uuid>,
  #[serde(default)]
  pub paused: bool,
  #[serde(default)]
  pub tags: Vec<String>,
  #[serde(default)]
  pub schedules: Vec<DeploymentSchedule>,
  /// Retry behaviour copied onto every run created from this deployment.
  #[serde(default)]
  pub empirical_policy: EmpiricalPolicy,
  pub created: DateTime<Utc>,
}

impl Deployment {
  pub fn new(name: impl Into<String>, flow_name: impl Into<String>) -> Self {
    Self {
      id: Uuid::new_v4(),
      name: name.into(),
      flow_name: flow_name.into(),
      work_queue_id: None,
      paused: false,
      tags: Vec::new(),
      schedules: Vec::new(),
      empirical_policy: EmpiricalPolicy::default(),
      created: Utc::now(),
    }
  }

  pub fn with_work_queue(mut self, work_queue_id: Uuid) -> Self {
    self.work_queue_id = Some(work_queue_id);
    self
  }

  pub fn with_schedule(mut self, schedule: Schedule) -> Self {
    self.schedules.push(DeploymentSchedule::new(schedule));
    self
  }

  pub fn has_active_schedule(&self) -> bool {
    self.schedules.iter().any(|s| s.active)
  }

  /// The key that makes a scheduled run unique for this deployment.
  pub fn idempotency_key(&self, scheduled_time: DateTime<Utc>) -> String {
    format!("scheduled {} {}", self.id, scheduled_time.to_rfc3339())
  }

  /// Build the SCHEDULED flow run the scheduler inserts for `scheduled_time`.
  pub fn scheduled_run(&self, scheduled_time: DateTime<Utc>) -> Run {
    let mut run = Run::flow(format!(
      "{}-{}",
      self.name,
      scheduled_time.format("%Y%m%d%H%M%S")
    ))
    .with_tags(self.tags.iter().cloned().chain(["auto-scheduled".to_string()]))
    .with_deployment(self.id, self.work_queue_id)
    .with_empirical_policy(self.empirical_policy.clone())
    .with_initial_state(State::scheduled(scheduled_time));
    run.idempotency_key = Some(self.idempotency_key(scheduled_time));
    run.auto_scheduled = true;
    run
  }
}
