//! Denormalized run fields kept in step with the state history.
//!
//! These rules are universal: they apply to forced transitions too, so the
//! counters and timestamps stay consistent no matter how a state was set.

use async_trait::async_trait;
use marigold_schemas::{RunKind, StateType};

use crate::context::OrchestrationContext;
use crate::error::OrchestrationError;
use crate::rule::{OrchestrationRule, RuleScope};

/// A SCHEDULED proposal without a time is scheduled for now.
pub struct EnsureScheduledTime;

#[async_trait]
impl OrchestrationRule for EnsureScheduledTime {
  fn name(&self) -> &'static str {
    "EnsureScheduledTime"
  }

  fn scope(&self) -> RuleScope {
    RuleScope::Universal
  }

  async fn before_transition(
    &mut self,
    ctx: &mut OrchestrationContext,
  ) -> Result<(), OrchestrationError> {
    let now = ctx.now;
    let proposed = &mut ctx.proposed_state;
    if proposed.state_type == StateType::Scheduled
      && proposed.state_details.scheduled_time.is_none()
    {
      proposed.state_details.scheduled_time = Some(now);
    }
    Ok(())
  }
}

/// Stamps the owning run ids onto the proposed state.
pub struct SetRunStateFields;

#[async_trait]
impl OrchestrationRule for SetRunStateFields {
  fn name(&self) -> &'static str {
    "SetRunStateFields"
  }

  fn scope(&self) -> RuleScope {
    RuleScope::Universal
  }

  async fn before_transition(
    &mut self,
    ctx: &mut OrchestrationContext,
  ) -> Result<(), OrchestrationError> {
    let details = &mut ctx.proposed_state.state_details;
    match ctx.run.kind {
      RunKind::Flow => details.flow_run_id = Some(ctx.run.id),
      RunKind::Task => {
        details.task_run_id = Some(ctx.run.id);
        details.flow_run_id = ctx.run.flow_run_id;
      }
    }
    Ok(())
  }
}

/// Maintains run_count, start/end times, total run time and schedule times.
pub struct UpdateRunCounters;

#[async_trait]
impl OrchestrationRule for UpdateRunCounters {
  fn name(&self) -> &'static str {
    "UpdateRunCounters"
  }

  fn scope(&self) -> RuleScope {
    RuleScope::Universal
  }

  async fn before_transition(
    &mut self,
    ctx: &mut OrchestrationContext,
  ) -> Result<(), OrchestrationError> {
    let initial_type = ctx.initial_type();
    let proposed = ctx.proposed_state.clone();
    let run = &mut ctx.run;

    if proposed.state_type == StateType::Running && initial_type != Some(StateType::Running) {
      run.run_count += 1;
      if run.start_time.is_none() {
        run.start_time = Some(proposed.timestamp);
      }
    }

    if initial_type == Some(StateType::Running) && proposed.state_type != StateType::Running {
      if let Some(initial) = ctx.initial_state.as_ref() {
        let elapsed = proposed.timestamp - initial.timestamp;
        run.total_run_time_ms += elapsed.num_milliseconds().max(0);
      }
    }

    if proposed.is_terminal() {
      run.end_time = Some(proposed.timestamp);
    } else if initial_type.is_some_and(StateType::is_terminal) {
      run.end_time = None;
    }

    if proposed.state_type == StateType::Scheduled {
      let scheduled_time = proposed.scheduled_time();
      run.next_scheduled_start_time = scheduled_time;
      if run.expected_start_time.is_none() {
        run.expected_start_time = scheduled_time;
      }
    } else {
      run.next_scheduled_start_time = None;
    }
    Ok(())
  }
}
