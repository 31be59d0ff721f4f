//! Transition events and notifiers for observability.
//!
//! An event is emitted after every committed transition so consumers can
//! drive automations, stream to UIs, etc.

use chrono::{DateTime, Utc};
use marigold_schemas::{RunKind, State, StateType};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

/// A committed state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionEvent {
  pub run_id: Uuid,
  pub run_kind: RunKind,
  pub run_name: String,
  pub tags: Vec<String>,
  pub initial_state_type: Option<StateType>,
  pub validated_state: State,
  pub occurred: DateTime<Utc>,
}

impl TransitionEvent {
  /// Event name in the form `marigold.flow-run.Running`.
  pub fn event_name(&self) -> String {
    format!(
      "marigold.{}-run.{}",
      self.run_kind.as_str(),
      self.validated_state.name
    )
  }
}

/// Trait for receiving transition events.
///
/// Called after the transition is committed; implementations must not
/// block, and nothing they do can undo the transition.
pub trait TransitionNotifier: Send + Sync {
  fn notify(&self, event: TransitionEvent);
}

/// A no-op notifier that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl TransitionNotifier for NoopNotifier {
  fn notify(&self, _event: TransitionEvent) {}
}

/// A notifier that sends events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  sender: mpsc::UnboundedSender<TransitionEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<TransitionEvent>) -> Self {
    Self { sender }
  }
}

impl TransitionNotifier for ChannelNotifier {
  fn notify(&self, event: TransitionEvent) {
    // Ignore send errors - receiver may have been dropped
    let _ = self.sender.send(event);
  }
}
