//! Invariants every run must keep, skipped only by forced proposals.

use async_trait::async_trait;
use marigold_schemas::StateType;
use marigold_store::Error as StoreError;

use crate::context::OrchestrationContext;
use crate::error::OrchestrationError;
use crate::rule::{OrchestrationRule, RuleScope, StateSet};

/// Runs that reached a terminal state stay there.
pub struct HandleTerminalStateTransitions;

#[async_trait]
impl OrchestrationRule for HandleTerminalStateTransitions {
  fn name(&self) -> &'static str {
    "HandleTerminalStateTransitions"
  }

  fn scope(&self) -> RuleScope {
    RuleScope::transition(StateSet::Only(&StateType::TERMINAL), StateSet::All)
  }

  async fn before_transition(
    &mut self,
    ctx: &mut OrchestrationContext,
  ) -> Result<(), OrchestrationError> {
    ctx.abort_transition("This run has already terminated.");
    Ok(())
  }
}

/// A cancelling run may only become cancelled.
pub struct EnforceCancellingToCancelledTransition;

#[async_trait]
impl OrchestrationRule for EnforceCancellingToCancelledTransition {
  fn name(&self) -> &'static str {
    "EnforceCancellingToCancelledTransition"
  }

  fn scope(&self) -> RuleScope {
    RuleScope::transition(
      StateSet::Only(&[StateType::Cancelling]),
      StateSet::Except(&[StateType::Cancelled]),
    )
  }

  async fn before_transition(
    &mut self,
    ctx: &mut OrchestrationContext,
  ) -> Result<(), OrchestrationError> {
    ctx.abort_transition(
      "Cannot transition runs that are cancelling to a state other than Cancelled.",
    );
    Ok(())
  }
}

/// Guards the claim step: only one poller can move a run into PENDING.
pub struct PreventPendingTransitions;

#[async_trait]
impl OrchestrationRule for PreventPendingTransitions {
  fn name(&self) -> &'static str {
    "PreventPendingTransitions"
  }

  fn scope(&self) -> RuleScope {
    RuleScope::transition(
      StateSet::Only(&[
        StateType::Pending,
        StateType::Running,
        StateType::Cancelling,
        StateType::Cancelled,
      ]),
      StateSet::Only(&[StateType::Pending]),
    )
  }

  async fn before_transition(
    &mut self,
    ctx: &mut OrchestrationContext,
  ) -> Result<(), OrchestrationError> {
    let current = ctx
      .initial_type()
      .map(|t| t.to_string())
      .unwrap_or_default();
    ctx.abort_transition(format!(
      "This run is in a {} state and cannot transition to a PENDING state.",
      current
    ));
    Ok(())
  }
}

/// A subflow may only start while the task run representing it in the
/// parent flow is RUNNING.
pub struct EnsureParentTaskIsRunning;

#[async_trait]
impl OrchestrationRule for EnsureParentTaskIsRunning {
  fn name(&self) -> &'static str {
    "EnsureParentTaskIsRunning"
  }

  fn scope(&self) -> RuleScope {
    RuleScope::transition(StateSet::All, StateSet::Only(&[StateType::Running]))
  }

  async fn before_transition(
    &mut self,
    ctx: &mut OrchestrationContext,
  ) -> Result<(), OrchestrationError> {
    let Some(parent_id) = ctx.run.parent_task_run_id else {
      return Ok(());
    };
    let parent = match ctx.store().read_run(parent_id).await {
      Ok(parent) => parent,
      Err(StoreError::NotFound(_)) => return Ok(()),
      Err(e) => return Err(e.into()),
    };
    if parent.state_type != Some(StateType::Running) {
      let parent_state = parent.state_name.unwrap_or_else(|| "no".to_string());
      ctx.abort_transition(format!(
        "The enclosing task run is in {} state; a subflow cannot start until it is running.",
        parent_state
      ));
    }
    Ok(())
  }
}

/// Task runs inside a flow run only start while that flow run is RUNNING.
pub struct PreventRunningTasksFromStoppedFlows;

#[async_trait]
impl OrchestrationRule for PreventRunningTasksFromStoppedFlows {
  fn name(&self) -> &'static str {
    "PreventRunningTasksFromStoppedFlows"
  }

  fn scope(&self) -> RuleScope {
    RuleScope::transition(StateSet::All, StateSet::Only(&[StateType::Running]))
  }

  async fn before_transition(
    &mut self,
    ctx: &mut OrchestrationContext,
  ) -> Result<(), OrchestrationError> {
    let Some(flow_run_id) = ctx.run.flow_run_id else {
      return Ok(());
    };
    let flow_run = match ctx.store().read_run(flow_run_id).await {
      Ok(flow_run) => flow_run,
      Err(StoreError::NotFound(_)) => return Ok(()),
      Err(e) => return Err(e.into()),
    };
    if flow_run.state_type != Some(StateType::Running) {
      let flow_state = flow_run
        .state_type
        .map(|t| t.to_string())
        .unwrap_or_else(|| "no".to_string());
      ctx.abort_transition(format!(
        "The enclosing flow run must be running to begin task execution; it is in a {} state.",
        flow_state
      ));
    }
    Ok(())
  }
}

/// Only a run that is still SCHEDULED may be marked late.
///
/// Guards the late-run sweep against a worker claiming the run between the
/// sweep's read and its proposal.
pub struct EnsureOnlyScheduledRunsMarkedLate;

#[async_trait]
impl OrchestrationRule for EnsureOnlyScheduledRunsMarkedLate {
  fn name(&self) -> &'static str {
    "EnsureOnlyScheduledRunsMarkedLate"
  }

  fn scope(&self) -> RuleScope {
    RuleScope::transition(
      StateSet::Except(&[StateType::Scheduled]),
      StateSet::Only(&[StateType::Scheduled]),
    )
  }

  async fn before_transition(
    &mut self,
    ctx: &mut OrchestrationContext,
  ) -> Result<(), OrchestrationError> {
    ctx.abort_transition("Only SCHEDULED runs can be marked late.");
    Ok(())
  }
}
