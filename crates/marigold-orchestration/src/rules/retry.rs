use async_trait::async_trait;
use marigold_schemas::{State, StateType};
use tracing::info;

use crate::context::OrchestrationContext;
use crate::error::OrchestrationError;
use crate::rule::{OrchestrationRule, RuleScope, StateSet};

/// Turns a failure into an AwaitingRetry schedule while retries remain.
///
/// The retry time is `now + delay_for_attempt(n)` where `n` is the 1-based
/// retry number; the run's own delay wins over the configured default.
pub struct RetryFailedRuns;

#[async_trait]
impl OrchestrationRule for RetryFailedRuns {
  fn name(&self) -> &'static str {
    "RetryFailedRuns"
  }

  fn scope(&self) -> RuleScope {
    RuleScope::transition(
      StateSet::Only(&[StateType::Running]),
      StateSet::Only(&[StateType::Failed, StateType::Crashed]),
    )
  }

  async fn before_transition(
    &mut self,
    ctx: &mut OrchestrationContext,
  ) -> Result<(), OrchestrationError> {
    let policy = &ctx.run.empirical_policy;
    if policy.retries_remaining == 0 {
      return Ok(());
    }
    if ctx.proposed_state.state_details.retriable == Some(false) {
      return Ok(());
    }

    let attempt = policy.next_attempt();
    let delay = policy
      .retry_delay
      .as_ref()
      .unwrap_or(&ctx.settings().default_retry_delay)
      .delay_for_attempt(attempt);
    let scheduled_time = ctx.now + delay;

    let mut retry = State::awaiting_retry(scheduled_time);
    retry.message = ctx.proposed_state.message.clone();
    retry.data = ctx.proposed_state.data.clone();

    ctx.run.empirical_policy.retries_remaining -= 1;
    info!(
      run_id = %ctx.run.id,
      attempt,
      retries_remaining = ctx.run.empirical_policy.retries_remaining,
      scheduled_time = %scheduled_time,
      "retry_scheduled"
    );
    ctx.reject_transition(retry, format!("Retry {} scheduled.", attempt));
    Ok(())
  }
}
