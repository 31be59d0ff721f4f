//! Observers of committed transitions.

use std::sync::Arc;

use async_trait::async_trait;
use marigold_schemas::{QueuedNotification, RunKind};
use tracing::debug;

use crate::context::OrchestrationContext;
use crate::error::OrchestrationError;
use crate::events::{TransitionEvent, TransitionNotifier};
use crate::rule::{OrchestrationRule, RuleScope};

/// Emits a [`TransitionEvent`] for every committed transition.
pub struct InstrumentRunStateTransitions {
  notifier: Arc<dyn TransitionNotifier>,
}

impl InstrumentRunStateTransitions {
  pub fn new(notifier: Arc<dyn TransitionNotifier>) -> Self {
    Self { notifier }
  }
}

#[async_trait]
impl OrchestrationRule for InstrumentRunStateTransitions {
  fn name(&self) -> &'static str {
    "InstrumentRunStateTransitions"
  }

  fn scope(&self) -> RuleScope {
    RuleScope::Universal
  }

  async fn after_transition(
    &mut self,
    ctx: &mut OrchestrationContext,
  ) -> Result<(), OrchestrationError> {
    let Some(validated) = ctx.validated_state.clone() else {
      return Ok(());
    };
    self.notifier.notify(TransitionEvent {
      run_id: ctx.run.id,
      run_kind: ctx.run.kind,
      run_name: ctx.run.name.clone(),
      tags: ctx.run.tags.clone(),
      initial_state_type: ctx.initial_type(),
      validated_state: validated,
      occurred: ctx.now,
    });
    Ok(())
  }
}

/// Queues a notification for each active policy matching the new state of a flow run.
pub struct QueueRunNotifications;

#[async_trait]
impl OrchestrationRule for QueueRunNotifications {
  fn name(&self) -> &'static str {
    "QueueRunNotifications"
  }

  fn scope(&self) -> RuleScope {
    RuleScope::Universal
  }

  async fn after_transition(
    &mut self,
    ctx: &mut OrchestrationContext,
  ) -> Result<(), OrchestrationError> {
    if ctx.run.kind != RunKind::Flow {
      return Ok(());
    }
    let Some(validated) = ctx.validated_state.as_ref() else {
      return Ok(());
    };

    let policies = ctx.store().read_notification_policies(true).await?;
    for policy in policies
      .iter()
      .filter(|p| p.matches(&validated.name, &ctx.run.tags))
    {
      let notification = QueuedNotification::new(policy.id, ctx.run.id, validated.id);
      ctx.store().enqueue_notification(&notification).await?;
      debug!(
        run_id = %ctx.run.id,
        policy_id = %policy.id,
        state = %validated.name,
        "notification_queued"
      );
    }
    Ok(())
  }
}
