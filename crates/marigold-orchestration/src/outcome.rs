use marigold_schemas::State;
use serde::{Deserialize, Serialize};

/// Coarse result of a proposal, without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
  Accept,
  Reject,
  Abort,
  Wait,
}

/// What the engine decided for one proposed state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
  /// The proposed state was validated and persisted.
  Accept { state: State },
  /// The policy substituted `state`, which was validated and persisted instead.
  Reject { state: State, reason: String },
  /// Nothing was persisted; the run keeps its state.
  Abort { reason: String },
  /// Nothing was persisted; propose again after `delay_seconds`.
  Wait { delay_seconds: u64, reason: String },
}

impl Outcome {
  pub fn status(&self) -> Status {
    match self {
      Outcome::Accept { .. } => Status::Accept,
      Outcome::Reject { .. } => Status::Reject,
      Outcome::Abort { .. } => Status::Abort,
      Outcome::Wait { .. } => Status::Wait,
    }
  }

  /// The persisted state, for ACCEPT and REJECT.
  pub fn state(&self) -> Option<&State> {
    match self {
      Outcome::Accept { state } | Outcome::Reject { state, .. } => Some(state),
      Outcome::Abort { .. } | Outcome::Wait { .. } => None,
    }
  }

  pub fn into_state(self) -> Option<State> {
    match self {
      Outcome::Accept { state } | Outcome::Reject { state, .. } => Some(state),
      Outcome::Abort { .. } | Outcome::Wait { .. } => None,
    }
  }

  pub fn reason(&self) -> Option<&str> {
    match self {
      Outcome::Accept { .. } => None,
      Outcome::Reject { reason, .. }
      | Outcome::Abort { reason }
      | Outcome::Wait { reason, .. } => Some(reason),
    }
  }
}
