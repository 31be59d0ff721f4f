//! Tag-based task concurrency limits.

use async_trait::async_trait;
use marigold_schemas::StateType;
use tracing::debug;

use crate::context::OrchestrationContext;
use crate::error::OrchestrationError;
use crate::rule::{OrchestrationRule, RuleScope, StateSet};

/// Takes one slot on every limited tag of a task before it may run.
///
/// Acquisition is all-or-nothing. When any limit is full the proposal waits
/// for `concurrency_slot_wait_seconds`. Slots taken for a proposal that ends
/// up somewhere other than RUNNING are given back in cleanup.
#[derive(Default)]
pub struct SecureTaskConcurrencySlots {
  acquired: Vec<String>,
}

#[async_trait]
impl OrchestrationRule for SecureTaskConcurrencySlots {
  fn name(&self) -> &'static str {
    "SecureTaskConcurrencySlots"
  }

  fn scope(&self) -> RuleScope {
    RuleScope::transition(
      StateSet::Except(&[StateType::Running]),
      StateSet::Only(&[StateType::Running]),
    )
  }

  async fn before_transition(
    &mut self,
    ctx: &mut OrchestrationContext,
  ) -> Result<(), OrchestrationError> {
    if ctx.run.tags.is_empty() {
      return Ok(());
    }
    let limits = ctx.store().read_concurrency_limits(&ctx.run.tags).await?;
    if limits.is_empty() {
      return Ok(());
    }

    if let Some(zero) = limits.iter().find(|l| l.limit == 0) {
      ctx.abort_transition(format!(
        "The concurrency limit on tag '{}' is 0 and will deadlock if the task tries to run again.",
        zero.tag
      ));
      return Ok(());
    }

    let tags: Vec<String> = limits.into_iter().map(|l| l.tag).collect();
    if !ctx.store().acquire_concurrency_slots(&tags, ctx.run.id).await? {
      let wait = ctx.settings().concurrency_slot_wait_seconds;
      debug!(run_id = %ctx.run.id, tags = ?tags, wait, "concurrency_slots_unavailable");
      ctx.delay_transition(
        wait,
        format!("Concurrency limit reached for tags {:?}.", tags),
      );
      return Ok(());
    }
    self.acquired = tags;
    Ok(())
  }

  async fn cleanup(&mut self, ctx: &mut OrchestrationContext) -> Result<(), OrchestrationError> {
    if self.acquired.is_empty() || ctx.validated_type() == Some(StateType::Running) {
      return Ok(());
    }
    ctx
      .store()
      .release_concurrency_slots(&self.acquired, ctx.run.id)
      .await?;
    self.acquired.clear();
    Ok(())
  }
}

/// Gives slots back when a task leaves RUNNING (or CANCELLING).
///
/// Universal so forced exits from RUNNING release their slots too.
pub struct ReleaseTaskConcurrencySlots;

#[async_trait]
impl OrchestrationRule for ReleaseTaskConcurrencySlots {
  fn name(&self) -> &'static str {
    "ReleaseTaskConcurrencySlots"
  }

  fn scope(&self) -> RuleScope {
    RuleScope::Universal
  }

  async fn after_transition(
    &mut self,
    ctx: &mut OrchestrationContext,
  ) -> Result<(), OrchestrationError> {
    let held = matches!(
      ctx.initial_type(),
      Some(StateType::Running) | Some(StateType::Cancelling)
    );
    let Some(validated) = ctx.validated_type() else {
      return Ok(());
    };
    if !held || validated == StateType::Running || ctx.run.tags.is_empty() {
      return Ok(());
    }
    ctx
      .store()
      .release_concurrency_slots(&ctx.run.tags, ctx.run.id)
      .await?;
    debug!(run_id = %ctx.run.id, tags = ?ctx.run.tags, "concurrency_slots_released");
    Ok(())
  }
}
