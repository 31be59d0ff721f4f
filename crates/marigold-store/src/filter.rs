use chrono::{DateTime, Utc};
use marigold_schemas::{Run, RunKind, StateType};
use uuid::Uuid;

/// Criteria for [`Store::read_runs`](crate::Store::read_runs).
///
/// Every set field must match; empty lists place no restriction.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
  pub kind: Option<RunKind>,
  pub state_types: Vec<StateType>,
  pub exclude_state_names: Vec<String>,
  pub flow_run_id: Option<Uuid>,
  /// Only task runs that do not belong to a flow run.
  pub autonomous_only: bool,
  pub deployment_id: Option<Uuid>,
  pub work_queue_ids: Vec<Uuid>,
  pub next_scheduled_before: Option<DateTime<Utc>>,
  /// The current state was entered before this time.
  pub state_entered_before: Option<DateTime<Utc>>,
  pub limit: Option<usize>,
}

impl RunFilter {
  pub fn kind(mut self, kind: RunKind) -> Self {
    self.kind = Some(kind);
    self
  }

  pub fn state_types(mut self, state_types: impl IntoIterator<Item = StateType>) -> Self {
    self.state_types = state_types.into_iter().collect();
    self
  }

  pub fn limit(mut self, limit: usize) -> Self {
    self.limit = Some(limit);
    self
  }

  pub fn matches(&self, run: &Run) -> bool {
    if self.kind.is_some_and(|kind| kind != run.kind) {
      return false;
    }
    if !self.state_types.is_empty()
      && !run.state_type.is_some_and(|t| self.state_types.contains(&t))
    {
      return false;
    }
    if let Some(name) = &run.state_name
      && self.exclude_state_names.contains(name)
    {
      return false;
    }
    if self.flow_run_id.is_some() && run.flow_run_id != self.flow_run_id {
      return false;
    }
    if self.autonomous_only && !run.is_autonomous_task() {
      return false;
    }
    if self.deployment_id.is_some() && run.deployment_id != self.deployment_id {
      return false;
    }
    if !self.work_queue_ids.is_empty()
      && !run
        .work_queue_id
        .is_some_and(|id| self.work_queue_ids.contains(&id))
    {
      return false;
    }
    if let Some(before) = self.next_scheduled_before
      && !run.next_scheduled_start_time.is_some_and(|at| at <= before)
    {
      return false;
    }
    if let Some(before) = self.state_entered_before
      && !run.state.as_ref().is_some_and(|s| s.timestamp < before)
    {
      return false;
    }
    true
  }
}
