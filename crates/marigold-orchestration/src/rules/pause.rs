//! Pausing and resuming flow runs.

use async_trait::async_trait;
use chrono::Duration;
use marigold_schemas::{State, StateType};

use crate::context::OrchestrationContext;
use crate::error::OrchestrationError;
use crate::rule::{OrchestrationRule, RuleScope, StateSet};

/// Validates PAUSED proposals and records their pause key.
pub struct HandlePausingRuns;

#[async_trait]
impl OrchestrationRule for HandlePausingRuns {
  fn name(&self) -> &'static str {
    "HandlePausingRuns"
  }

  fn scope(&self) -> RuleScope {
    RuleScope::transition(StateSet::All, StateSet::Only(&[StateType::Paused]))
  }

  async fn before_transition(
    &mut self,
    ctx: &mut OrchestrationContext,
  ) -> Result<(), OrchestrationError> {
    if ctx.initial_type() != Some(StateType::Running) {
      ctx.abort_transition("Cannot pause runs that are not currently running.");
      return Ok(());
    }

    let reschedule = ctx.proposed_state.state_details.pause_reschedule;
    if reschedule && ctx.run.deployment_id.is_none() {
      ctx.abort_transition(
        "Cannot reschedule a paused run that is not associated with a deployment.",
      );
      return Ok(());
    }

    if let Some(key) = ctx.proposed_state.state_details.pause_key.clone() {
      if ctx.run.empirical_policy.pause_keys.contains(&key) {
        ctx.abort_transition("This pause has already fired.");
        return Ok(());
      }
      ctx.run.empirical_policy.pause_keys.push(key);
    }

    if ctx.proposed_state.state_details.pause_timeout.is_none() {
      let timeout = i64::try_from(ctx.settings().pause_timeout_seconds).unwrap_or(i64::MAX / 1000);
      ctx.proposed_state.state_details.pause_timeout = Some(ctx.now + Duration::seconds(timeout));
    }
    ctx.run.empirical_policy.resuming = false;
    Ok(())
  }
}

/// Enforces pause timeouts and the resume path of a paused run.
pub struct HandleResumingPausedRuns;

#[async_trait]
impl OrchestrationRule for HandleResumingPausedRuns {
  fn name(&self) -> &'static str {
    "HandleResumingPausedRuns"
  }

  fn scope(&self) -> RuleScope {
    RuleScope::transition(
      StateSet::Only(&[StateType::Paused]),
      StateSet::Except(&[StateType::Paused]),
    )
  }

  async fn before_transition(
    &mut self,
    ctx: &mut OrchestrationContext,
  ) -> Result<(), OrchestrationError> {
    // Giving up on a paused run is always allowed.
    if ctx.proposed_state.is_terminal() {
      return Ok(());
    }

    let Some(initial) = ctx.initial_state.clone() else {
      return Ok(());
    };
    let details = &initial.state_details;

    if details.pause_timeout.is_some_and(|timeout| timeout < ctx.now) {
      ctx.reject_transition(
        State::failed("The run was paused and never resumed."),
        "The pause timeout has elapsed.",
      );
      return Ok(());
    }

    let required = if details.pause_reschedule {
      if ctx.run.deployment_id.is_none() {
        ctx.abort_transition(
          "Cannot reschedule a paused run that is not associated with a deployment.",
        );
        return Ok(());
      }
      StateType::Scheduled
    } else {
      StateType::Running
    };

    if ctx.proposed_type() != required {
      ctx.abort_transition(format!(
        "This paused run can only resume to a {} state.",
        required
      ));
      return Ok(());
    }

    ctx.run.empirical_policy.resuming = true;
    ctx
      .parameters
      .insert("resuming".to_string(), serde_json::Value::Bool(true));
    Ok(())
  }
}
