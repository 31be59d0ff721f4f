//! Flow runs and task runs.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::states::{State, StateType};

/// Which orchestration policy governs a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
  Flow,
  Task,
}

impl RunKind {
  pub fn as_str(self) -> &'static str {
    match self {
      RunKind::Flow => "flow",
      RunKind::Task => "task",
    }
  }
}

/// How long to wait before a retry attempt.
///
/// Every variant is non-decreasing in the attempt number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryDelay {
  Fixed {
    seconds: u64,
  },
  Exponential {
    base_seconds: u64,
    factor: f64,
    max_seconds: Option<u64>,
  },
  /// Explicit per-attempt delays; attempts past the end reuse the last entry.
  Sequence {
    seconds: Vec<u64>,
  },
}

impl Default for RetryDelay {
  fn default() -> Self {
    RetryDelay::Fixed { seconds: 0 }
  }
}

impl RetryDelay {
  /// Delay before retry number `attempt` (1-based).
  pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
    let index = attempt.saturating_sub(1);
    let seconds = match self {
      RetryDelay::Fixed { seconds } => *seconds,
      RetryDelay::Exponential {
        base_seconds,
        factor,
        max_seconds,
      } => {
        let factor = factor.max(1.0);
        let raw = (*base_seconds as f64) * factor.powi(index.min(i32::MAX as u32) as i32);
        let capped = match max_seconds {
          Some(max) => raw.min(*max as f64),
          None => raw,
        };
        if capped.is_finite() {
          capped.min(i64::MAX as f64 / 1000.0) as u64
        } else {
          max_seconds.unwrap_or(u32::MAX as u64)
        }
      }
      RetryDelay::Sequence { seconds } => seconds
        .get(index as usize)
        .or(seconds.last())
        .copied()
        .unwrap_or(0),
    };
    Duration::seconds(seconds.min(i64::MAX as u64 / 1000) as i64)
  }
}

/// Retry and pause behaviour carried on a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmpiricalPolicy {
  pub max_retries: u32,
  pub retries_remaining: u32,
  /// Falls back to the configured default when absent.
  pub retry_delay: Option<RetryDelay>,
  /// Set while a paused run is on its way back to RUNNING.
  pub resuming: bool,
  /// Keys of pauses that have already fired for this run.
  pub pause_keys: Vec<String>,
}

impl EmpiricalPolicy {
  pub fn with_retries(max_retries: u32) -> Self {
    Self {
      max_retries,
      retries_remaining: max_retries,
      ..Default::default()
    }
  }

  pub fn with_retry_delay(mut self, delay: RetryDelay) -> Self {
    self.retry_delay = Some(delay);
    self
  }

  /// The 1-based number of the next retry attempt.
  pub fn next_attempt(&self) -> u32 {
    self
      .max_retries
      .saturating_sub(self.retries_remaining)
      .saturating_add(1)
  }
}

/// A flow run or task run.
///
/// The `state_*` fields mirror the current [`State`] and are only ever
/// written through [`Run::set_state`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
  pub id: Uuid,
  pub kind: RunKind,
  pub name: String,
  #[serde(default)]
  pub tags: Vec<String>,
  pub deployment_id: Option<Uuid>,
  pub work_queue_id: Option<Uuid>,
  /// For task runs: the flow run they belong to. Autonomous tasks have none.
  pub flow_run_id: Option<Uuid>,
  /// For subflow runs: the task run in the parent flow that represents them.
  pub parent_task_run_id: Option<Uuid>,
  pub state: Option<State>,
  pub state_id: Option<Uuid>,
  pub state_type: Option<StateType>,
  pub state_name: Option<String>,
  pub run_count: u32,
  pub expected_start_time: Option<DateTime<Utc>>,
  pub next_scheduled_start_time: Option<DateTime<Utc>>,
  pub start_time: Option<DateTime<Utc>>,
  pub end_time: Option<DateTime<Utc>>,
  pub total_run_time_ms: i64,
  #[serde(default)]
  pub empirical_policy: EmpiricalPolicy,
  /// Deduplicates scheduler-created runs per deployment.
  pub idempotency_key: Option<String>,
  #[serde(default)]
  pub auto_scheduled: bool,
  pub created: DateTime<Utc>,
}

impl Run {
  pub fn new(kind: RunKind, name: impl Into<String>) -> Self {
    Self {
      id: Uuid::new_v4(),
      kind,
      name: name.into(),
      tags: Vec::new(),
      deployment_id: None,
      work_queue_id: None,
      flow_run_id: None,
      parent_task_run_id: None,
      state: None,
      state_id: None,
      state_type: None,
      state_name: None,
      run_count: 0,
      expected_start_time: None,
      next_scheduled_start_time: None,
      start_time: None,
      end_time: None,
      total_run_time_ms: 0,
      empirical_policy: EmpiricalPolicy::default(),
      idempotency_key: None,
      auto_scheduled: false,
      created: Utc::now(),
    }
  }

  pub fn flow(name: impl Into<String>) -> Self {
    Self::new(RunKind::Flow, name)
  }

  pub fn task(name: impl Into<String>, flow_run_id: Option<Uuid>) -> Self {
    let mut run = Self::new(RunKind::Task, name);
    run.flow_run_id = flow_run_id;
    run
  }

  pub fn with_tags<I, S>(mut self, tags: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.tags = tags.into_iter().map(Into::into).collect();
    self
  }

  pub fn with_deployment(mut self, deployment_id: Uuid, work_queue_id: Option<Uuid>) -> Self {
    self.deployment_id = Some(deployment_id);
    self.work_queue_id = work_queue_id;
    self
  }

  pub fn with_work_queue(mut self, work_queue_id: Uuid) -> Self {
    self.work_queue_id = Some(work_queue_id);
    self
  }

  pub fn with_parent_task_run(mut self, task_run_id: Uuid) -> Self {
    self.parent_task_run_id = Some(task_run_id);
    self
  }

  pub fn with_empirical_policy(mut self, policy: EmpiricalPolicy) -> Self {
    self.empirical_policy = policy;
    self
  }

  /// Attach the state a run is created in.
  ///
  /// A SCHEDULED initial state also sets the expected and next scheduled
  /// start times.
  pub fn with_initial_state(mut self, state: State) -> Self {
    if state.state_type == StateType::Scheduled
      && let Some(at) = state.scheduled_time()
    {
      self.expected_start_time = Some(at);
      self.next_scheduled_start_time = Some(at);
    }
    self.set_state(state);
    self
  }

  /// Make `state` the current state and refresh the denormalized columns.
  pub fn set_state(&mut self, state: State) {
    self.state_id = Some(state.id);
    self.state_type = Some(state.state_type);
    self.state_name = Some(state.name.clone());
    self.state = Some(state);
  }

  pub fn is_subflow(&self) -> bool {
    self.kind == RunKind::Flow && self.parent_task_run_id.is_some()
  }

  pub fn is_autonomous_task(&self) -> bool {
    self.kind == RunKind::Task && self.flow_run_id.is_none()
  }

  pub fn has_tag(&self, tag: &str) -> bool {
    self.tags.iter().any(|t| t == tag)
  }
}
