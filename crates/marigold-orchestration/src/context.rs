//! The unit of work a proposal is evaluated in.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use marigold_config::OrchestrationSettings;
use marigold_schemas::{Run, State, StateType};
use marigold_store::Store;
use tracing::debug;

use crate::outcome::Status;

/// Side-channel values rules may read and write during a transition.
pub type Parameters = HashMap<String, serde_json::Value>;

/// Carries one proposed transition through the rule pipeline.
///
/// Rules read the run and the states, and may rewrite the proposal through
/// [`reject_transition`](Self::reject_transition), hold it back with
/// [`delay_transition`](Self::delay_transition), or refuse it with
/// [`abort_transition`](Self::abort_transition). Changes a rule makes to
/// `run` are persisted together with the validated state.
pub struct OrchestrationContext {
  pub run: Run,
  pub initial_state: Option<State>,
  pub proposed_state: State,
  /// Set once the proposal has been committed.
  pub validated_state: Option<State>,
  pub parameters: Parameters,
  pub force: bool,
  pub now: DateTime<Utc>,
  store: Arc<dyn Store>,
  settings: Arc<OrchestrationSettings>,
  status: Status,
  reason: Option<String>,
  delay_seconds: u64,
  rejections_in_hook: u32,
}

impl OrchestrationContext {
  pub fn new(
    run: Run,
    proposed_state: State,
    force: bool,
    parameters: Parameters,
    store: Arc<dyn Store>,
    settings: Arc<OrchestrationSettings>,
  ) -> Self {
    Self {
      initial_state: run.state.clone(),
      run,
      proposed_state,
      validated_state: None,
      parameters,
      force,
      now: Utc::now(),
      store,
      settings,
      status: Status::Accept,
      reason: None,
      delay_seconds: 0,
      rejections_in_hook: 0,
    }
  }

  pub fn store(&self) -> &dyn Store {
    self.store.as_ref()
  }

  pub fn settings(&self) -> &OrchestrationSettings {
    &self.settings
  }

  pub fn initial_type(&self) -> Option<StateType> {
    self.initial_state.as_ref().map(|s| s.state_type)
  }

  pub fn proposed_type(&self) -> StateType {
    self.proposed_state.state_type
  }

  pub fn validated_type(&self) -> Option<StateType> {
    self.validated_state.as_ref().map(|s| s.state_type)
  }

  pub fn status(&self) -> Status {
    self.status
  }

  pub fn reason(&self) -> Option<&str> {
    self.reason.as_deref()
  }

  pub fn delay_seconds(&self) -> u64 {
    self.delay_seconds
  }

  /// True once a WAIT or ABORT has ended the before pass.
  pub fn is_short_circuited(&self) -> bool {
    matches!(self.status, Status::Abort | Status::Wait)
  }

  /// Substitute `state` for the proposal; it is validated in its place.
  ///
  /// A rule may rewrite a proposal once per hook. A second rewrite from the
  /// same hook aborts the transition instead.
  pub fn reject_transition(&mut self, state: State, reason: impl Into<String>) {
    let reason = reason.into();
    if self.is_short_circuited() {
      return;
    }
    if self.rejections_in_hook > 0 {
      self.abort_transition(format!(
        "A rule rejected its own rejection and was aborted: {}",
        reason
      ));
      return;
    }
    debug!(
      run_id = %self.run.id,
      from = %self.proposed_state.state_type,
      to = %state.state_type,
      reason = %reason,
      "proposal_rejected"
    );
    self.rejections_in_hook += 1;
    self.proposed_state = state;
    self.status = Status::Reject;
    self.reason = Some(reason);
  }

  /// Hold the proposal back; the caller should propose again later.
  pub fn delay_transition(&mut self, seconds: u64, reason: impl Into<String>) {
    if self.is_short_circuited() {
      return;
    }
    self.status = Status::Wait;
    self.delay_seconds = seconds;
    self.reason = Some(reason.into());
  }

  /// Refuse the proposal. The run's state is left unchanged.
  pub fn abort_transition(&mut self, reason: impl Into<String>) {
    if self.status == Status::Abort {
      return;
    }
    self.status = Status::Abort;
    self.delay_seconds = 0;
    self.reason = Some(reason.into());
  }

  pub(crate) fn begin_hook(&mut self) {
    self.rejections_in_hook = 0;
  }

  /// Make the current proposal the run's state.
  pub(crate) fn validate_proposed_state(&mut self) {
    let state = self.proposed_state.clone();
    self.run.set_state(state.clone());
    self.validated_state = Some(state);
  }
}
