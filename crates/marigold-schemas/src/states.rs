//! Run states.
//!
//! A [`State`] is created as a proposal by a client or by the engine, and
//! becomes authoritative only once the orchestration policy has validated
//! and persisted it. Validated states are never mutated; a run's history is
//! the ordered list of its states.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The closed set of lifecycle points a run can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateType {
  Scheduled,
  Pending,
  Running,
  Completed,
  Failed,
  Crashed,
  Cancelling,
  Cancelled,
  Paused,
}

impl StateType {
  pub const ALL: [StateType; 9] = [
    StateType::Scheduled,
    StateType::Pending,
    StateType::Running,
    StateType::Completed,
    StateType::Failed,
    StateType::Crashed,
    StateType::Cancelling,
    StateType::Cancelled,
    StateType::Paused,
  ];

  pub const TERMINAL: [StateType; 4] = [
    StateType::Completed,
    StateType::Failed,
    StateType::Crashed,
    StateType::Cancelled,
  ];

  /// Terminal states end a run; leaving one requires a forced transition.
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      StateType::Completed | StateType::Failed | StateType::Crashed | StateType::Cancelled
    )
  }

  /// States in which a run holds (or is about to hold) execution resources.
  pub fn is_active(self) -> bool {
    matches!(
      self,
      StateType::Pending | StateType::Running | StateType::Cancelling
    )
  }

  /// The display name a state of this type gets when none is supplied.
  pub fn default_name(self) -> &'static str {
    match self {
      StateType::Scheduled => "Scheduled",
      StateType::Pending => "Pending",
      StateType::Running => "Running",
      StateType::Completed => "Completed",
      StateType::Failed => "Failed",
      StateType::Crashed => "Crashed",
      StateType::Cancelling => "Cancelling",
      StateType::Cancelled => "Cancelled",
      StateType::Paused => "Paused",
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      StateType::Scheduled => "SCHEDULED",
      StateType::Pending => "PENDING",
      StateType::Running => "RUNNING",
      StateType::Completed => "COMPLETED",
      StateType::Failed => "FAILED",
      StateType::Crashed => "CRASHED",
      StateType::Cancelling => "CANCELLING",
      StateType::Cancelled => "CANCELLED",
      StateType::Paused => "PAUSED",
    }
  }
}

impl fmt::Display for StateType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for StateType {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    StateType::ALL
      .into_iter()
      .find(|t| t.as_str().eq_ignore_ascii_case(s))
      .ok_or_else(|| format!("unknown state type: {}", s))
  }
}

/// Structured extras carried by a state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateDetails {
  pub flow_run_id: Option<Uuid>,
  pub task_run_id: Option<Uuid>,
  /// When a SCHEDULED state becomes due.
  pub scheduled_time: Option<DateTime<Utc>>,
  pub cache_key: Option<String>,
  pub cache_expiration: Option<DateTime<Utc>>,
  /// Skip cache lookups for this proposal.
  pub refresh_cache: bool,
  pub retriable: Option<bool>,
  pub pause_timeout: Option<DateTime<Utc>>,
  pub pause_reschedule: bool,
  pub pause_key: Option<String>,
  pub task_parameters_id: Option<Uuid>,
}

/// A point-in-time lifecycle record for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
  pub id: Uuid,
  #[serde(rename = "type")]
  pub state_type: StateType,
  pub name: String,
  pub timestamp: DateTime<Utc>,
  pub message: Option<String>,
  /// Opaque result reference.
  pub data: Option<serde_json::Value>,
  #[serde(default)]
  pub state_details: StateDetails,
}

impl State {
  pub fn new(state_type: StateType) -> Self {
    Self::named(state_type, state_type.default_name())
  }

  pub fn named(state_type: StateType, name: impl Into<String>) -> Self {
    Self {
      id: Uuid::new_v4(),
      state_type,
      name: name.into(),
      timestamp: Utc::now(),
      message: None,
      data: None,
      state_details: StateDetails::default(),
    }
  }

  pub fn scheduled(scheduled_time: DateTime<Utc>) -> Self {
    let mut state = Self::new(StateType::Scheduled);
    state.state_details.scheduled_time = Some(scheduled_time);
    state
  }

  /// A SCHEDULED state for a run that missed its start time.
  pub fn late(scheduled_time: DateTime<Utc>) -> Self {
    let mut state = Self::named(StateType::Scheduled, "Late");
    state.state_details.scheduled_time = Some(scheduled_time);
    state
  }

  pub fn awaiting_retry(scheduled_time: DateTime<Utc>) -> Self {
    let mut state = Self::named(StateType::Scheduled, "AwaitingRetry");
    state.state_details.scheduled_time = Some(scheduled_time);
    state
  }

  pub fn pending() -> Self {
    Self::new(StateType::Pending)
  }

  pub fn running() -> Self {
    Self::new(StateType::Running)
  }

  pub fn completed() -> Self {
    Self::new(StateType::Completed)
  }

  pub fn failed(message: impl Into<String>) -> Self {
    Self::new(StateType::Failed).with_message(message)
  }

  pub fn crashed(message: impl Into<String>) -> Self {
    Self::new(StateType::Crashed).with_message(message)
  }

  pub fn cancelling() -> Self {
    Self::new(StateType::Cancelling)
  }

  pub fn cancelled() -> Self {
    Self::new(StateType::Cancelled)
  }

  /// A PAUSED state. `timeout` is when resuming stops being allowed.
  pub fn paused(
    timeout: Option<DateTime<Utc>>,
    reschedule: bool,
    pause_key: Option<String>,
  ) -> Self {
    let mut state = Self::new(StateType::Paused);
    state.state_details.pause_timeout = timeout;
    state.state_details.pause_reschedule = reschedule;
    state.state_details.pause_key = pause_key;
    state
  }

  pub fn with_message(mut self, message: impl Into<String>) -> Self {
    self.message = Some(message.into());
    self
  }

  pub fn with_data(mut self, data: serde_json::Value) -> Self {
    self.data = Some(data);
    self
  }

  pub fn with_cache_key(mut self, cache_key: impl Into<String>) -> Self {
    self.state_details.cache_key = Some(cache_key.into());
    self
  }

  pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
    self.timestamp = timestamp;
    self
  }

  pub fn is_terminal(&self) -> bool {
    self.state_type.is_terminal()
  }

  pub fn scheduled_time(&self) -> Option<DateTime<Utc>> {
    self.state_details.scheduled_time
  }

  /// Copy this state's content into a new, not yet validated state.
  ///
  /// Used when a transition is rewritten to reuse an earlier result: the
  /// copy gets its own id and timestamp so history stays append-only.
  pub fn fresh_copy(&self) -> Self {
    Self {
      id: Uuid::new_v4(),
      timestamp: Utc::now(),
      ..self.clone()
    }
  }
}
