//! The rule trait and the transitions a rule governs.

use async_trait::async_trait;
use marigold_schemas::StateType;

use crate::context::OrchestrationContext;
use crate::error::OrchestrationError;

/// A set of state types on one side of a transition.
#[derive(Debug, Clone, Copy)]
pub enum StateSet {
  /// Every state type, and also "no state yet" on the initial side.
  All,
  Only(&'static [StateType]),
  /// Every state type except these. Does not match "no state yet".
  Except(&'static [StateType]),
}

impl StateSet {
  pub fn contains(&self, state_type: Option<StateType>) -> bool {
    match (self, state_type) {
      (StateSet::All, _) => true,
      (_, None) => false,
      (StateSet::Only(types), Some(t)) => types.contains(&t),
      (StateSet::Except(types), Some(t)) => !types.contains(&t),
    }
  }
}

/// Which transitions a rule's hooks run for.
#[derive(Debug, Clone, Copy)]
pub enum RuleScope {
  /// Runs for every transition, including forced ones.
  Universal,
  /// Runs only when the (initial, proposed) pair matches, and never under `force`.
  Transition { from: StateSet, to: StateSet },
}

impl RuleScope {
  pub const fn transition(from: StateSet, to: StateSet) -> Self {
    RuleScope::Transition { from, to }
  }

  pub fn is_universal(&self) -> bool {
    matches!(self, RuleScope::Universal)
  }

  pub fn matches(&self, initial: Option<StateType>, proposed: Option<StateType>) -> bool {
    match self {
      RuleScope::Universal => true,
      RuleScope::Transition { from, to } => from.contains(initial) && to.contains(proposed),
    }
  }
}

/// One unit of transition policy.
///
/// A fresh set of rules is built for every proposal, so a rule may keep
/// per-transition bookkeeping in `self` (e.g. which slots it acquired) for
/// its cleanup hook.
///
/// - `before_transition` runs in pipeline order before anything is persisted.
/// - `after_transition` runs in pipeline order once the validated state is
///   committed, only while the validated state still matches the scope the
///   rule entered with (universal rules always see it).
/// - `cleanup` runs in reverse order for every rule whose before hook
///   completed, whatever the outcome.
#[async_trait]
pub trait OrchestrationRule: Send + Sync {
  fn name(&self) -> &'static str;

  fn scope(&self) -> RuleScope;

  async fn before_transition(
    &mut self,
    _ctx: &mut OrchestrationContext,
  ) -> Result<(), OrchestrationError> {
    Ok(())
  }

  async fn after_transition(
    &mut self,
    _ctx: &mut OrchestrationContext,
  ) -> Result<(), OrchestrationError> {
    Ok(())
  }

  async fn cleanup(&mut self, _ctx: &mut OrchestrationContext) -> Result<(), OrchestrationError> {
    Ok(())
  }
}
