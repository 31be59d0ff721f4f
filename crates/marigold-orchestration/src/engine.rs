//! The state transition engine.
//!
//! `OrchestrationEngine` is the only way a run's state changes. A proposal
//! flows through the run's policy in three passes:
//!
//! ```text
//!   before hooks (in order) ──► commit (CAS on current state) ──► after hooks (in order)
//!          │ ABORT / WAIT stops here                                      │
//!          └───────────────────────► cleanup hooks (reverse order) ◄──────┘
//! ```

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use marigold_config::OrchestrationSettings;
use marigold_schemas::{State, StateType};
use marigold_store::{Error as StoreError, Store};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::context::{OrchestrationContext, Parameters};
use crate::error::OrchestrationError;
use crate::events::{NoopNotifier, TransitionNotifier};
use crate::locks::RunLocks;
use crate::outcome::{Outcome, Status};
use crate::policies::{Policy, policy_for};
use crate::rule::OrchestrationRule;

/// Evaluates proposed states against the orchestration policies.
///
/// Generic over `N: TransitionNotifier` to allow different event sinks.
/// Use `OrchestrationEngine::new()` to discard transition events, or
/// `OrchestrationEngine::with_notifier()` to observe them.
pub struct OrchestrationEngine<N: TransitionNotifier + 'static = NoopNotifier> {
  store: Arc<dyn Store>,
  settings: Arc<OrchestrationSettings>,
  notifier: Arc<N>,
  locks: RunLocks,
}

impl OrchestrationEngine<NoopNotifier> {
  pub fn new(store: Arc<dyn Store>, settings: OrchestrationSettings) -> Self {
    Self::with_notifier(store, settings, NoopNotifier)
  }
}

#[derive(Clone, Copy)]
enum Hook {
  Before,
  After,
  Cleanup,
}

impl Hook {
  fn as_str(self) -> &'static str {
    match self {
      Hook::Before => "before_transition",
      Hook::After => "after_transition",
      Hook::Cleanup => "cleanup",
    }
  }
}

/// A rule whose before hook completed, and the proposed type it saw.
struct Entered {
  index: usize,
  proposed_at_entry: StateType,
}

impl<N: TransitionNotifier + 'static> OrchestrationEngine<N> {
  pub fn with_notifier(
    store: Arc<dyn Store>,
    settings: OrchestrationSettings,
    notifier: N,
  ) -> Self {
    Self {
      store,
      settings: Arc::new(settings),
      notifier: Arc::new(notifier),
      locks: RunLocks::new(),
    }
  }

  pub fn store(&self) -> &Arc<dyn Store> {
    &self.store
  }

  pub fn settings(&self) -> &OrchestrationSettings {
    &self.settings
  }

  /// The notifier, for callers assembling their own [`Policy`].
  pub fn notifier(&self) -> Arc<dyn TransitionNotifier> {
    self.notifier.clone()
  }

  /// Propose `proposed` as the next state of a run.
  ///
  /// With `force` only universal rules run, so any transition is accepted
  /// while the bookkeeping still happens.
  pub async fn propose_state(
    &self,
    run_id: Uuid,
    proposed: State,
    force: bool,
    parameters: Parameters,
  ) -> Result<Outcome, OrchestrationError> {
    let _guard = self.locks.lock(run_id).await;
    let run = self.read_run(run_id).await?;
    let notifier: Arc<dyn TransitionNotifier> = self.notifier.clone();
    let policy = policy_for(run.kind, notifier);
    self.apply_policy(run, proposed, force, parameters, policy).await
  }

  /// Like [`propose_state`](Self::propose_state) with a caller-built policy.
  pub async fn propose_state_with_policy(
    &self,
    run_id: Uuid,
    proposed: State,
    force: bool,
    parameters: Parameters,
    policy: Policy,
  ) -> Result<Outcome, OrchestrationError> {
    let _guard = self.locks.lock(run_id).await;
    let run = self.read_run(run_id).await?;
    self.apply_policy(run, proposed, force, parameters, policy).await
  }

  async fn read_run(&self, run_id: Uuid) -> Result<marigold_schemas::Run, OrchestrationError> {
    match self.store.read_run(run_id).await {
      Ok(run) => Ok(run),
      Err(StoreError::NotFound(_)) => Err(OrchestrationError::RunNotFound(run_id)),
      Err(e) => Err(e.into()),
    }
  }

  #[instrument(
    name = "propose_state",
    skip_all,
    fields(
      run_id = %run.id,
      run_kind = run.kind.as_str(),
      from = ?run.state_type,
      to = %proposed.state_type,
      force = force,
    )
  )]
  async fn apply_policy(
    &self,
    run: marigold_schemas::Run,
    proposed: State,
    force: bool,
    parameters: Parameters,
    policy: Policy,
  ) -> Result<Outcome, OrchestrationError> {
    let mut rules = policy.rules;
    let expected_state_id = run.state_id;
    let mut ctx = OrchestrationContext::new(
      run,
      proposed,
      force,
      parameters,
      self.store.clone(),
      self.settings.clone(),
    );
    let initial = ctx.initial_type();
    let original = ctx.proposed_type();
    let mut entered: Vec<Entered> = Vec::new();

    for (index, rule) in rules.iter_mut().enumerate() {
      if ctx.is_short_circuited() {
        break;
      }
      let scope = rule.scope();
      if !scope.is_universal()
        && (ctx.force
          || ctx.proposed_type() != original
          || !scope.matches(initial, Some(original)))
      {
        continue;
      }

      let proposed_at_entry = ctx.proposed_type();
      ctx.begin_hook();
      match run_hook(rule.as_mut(), &mut ctx, Hook::Before).await {
        Ok(()) => entered.push(Entered {
          index,
          proposed_at_entry,
        }),
        Err(message) => {
          error!(
            run_id = %ctx.run.id,
            rule = rule.name(),
            from = ?initial,
            to = %proposed_at_entry,
            error = %message,
            "rule_failed"
          );
          ctx.abort_transition(format!("Error in rule {}: {}", rule.name(), message));
          break;
        }
      }
    }

    let mut commit_error = None;
    let mut outcome = None;
    if !ctx.is_short_circuited() {
      ctx.validate_proposed_state();
      match self.store.commit_transition(&ctx.run, expected_state_id).await {
        Ok(()) => outcome = Some(committed_outcome(&ctx)),
        Err(StoreError::Conflict(message)) => {
          ctx.validated_state = None;
          ctx.abort_transition(format!(
            "The run's state changed while this transition was evaluated: {}",
            message
          ));
        }
        Err(e) => {
          ctx.validated_state = None;
          commit_error = Some(e);
        }
      }
    }

    if ctx.validated_state.is_some() {
      for entry in &entered {
        let rule = &mut rules[entry.index];
        if !rule.scope().is_universal() && ctx.validated_type() != Some(entry.proposed_at_entry) {
          continue;
        }
        ctx.begin_hook();
        if let Err(message) = run_hook(rule.as_mut(), &mut ctx, Hook::After).await {
          warn!(run_id = %ctx.run.id, rule = rule.name(), error = %message, "after_hook_failed");
        }
      }
    }

    for entry in entered.iter().rev() {
      let rule = &mut rules[entry.index];
      ctx.begin_hook();
      if let Err(message) = run_hook(rule.as_mut(), &mut ctx, Hook::Cleanup).await {
        warn!(run_id = %ctx.run.id, rule = rule.name(), error = %message, "cleanup_hook_failed");
      }
    }

    if let Some(e) = commit_error {
      error!(run_id = %ctx.run.id, error = %e, "transition_commit_failed");
      return Err(e.into());
    }

    let outcome = outcome.unwrap_or_else(|| uncommitted_outcome(&ctx));
    match &outcome {
      Outcome::Accept { state } => {
        info!(run_id = %ctx.run.id, state = %state.name, "transition_accepted")
      }
      Outcome::Reject { state, reason } => {
        info!(run_id = %ctx.run.id, state = %state.name, reason = %reason, "transition_rejected")
      }
      Outcome::Abort { reason } => {
        info!(run_id = %ctx.run.id, reason = %reason, "transition_aborted")
      }
      Outcome::Wait {
        delay_seconds,
        reason,
      } => info!(run_id = %ctx.run.id, delay_seconds, reason = %reason, "transition_delayed"),
    }
    Ok(outcome)
  }
}

fn committed_outcome(ctx: &OrchestrationContext) -> Outcome {
  let state = ctx
    .validated_state
    .clone()
    .unwrap_or_else(|| ctx.proposed_state.clone());
  match ctx.status() {
    Status::Reject => Outcome::Reject {
      state,
      reason: ctx.reason().unwrap_or_default().to_string(),
    },
    _ => Outcome::Accept { state },
  }
}

fn uncommitted_outcome(ctx: &OrchestrationContext) -> Outcome {
  let reason = ctx.reason().unwrap_or_default().to_string();
  match ctx.status() {
    Status::Wait => Outcome::Wait {
      delay_seconds: ctx.delay_seconds(),
      reason,
    },
    _ => Outcome::Abort { reason },
  }
}

/// Run one hook, turning errors and panics into a message.
async fn run_hook(
  rule: &mut dyn OrchestrationRule,
  ctx: &mut OrchestrationContext,
  hook: Hook,
) -> Result<(), String> {
  let future = match hook {
    Hook::Before => rule.before_transition(ctx),
    Hook::After => rule.after_transition(ctx),
    Hook::Cleanup => rule.cleanup(ctx),
  };
  match AssertUnwindSafe(future).catch_unwind().await {
    Ok(Ok(())) => Ok(()),
    Ok(Err(e)) => Err(e.to_string()),
    Err(panic) => Err(format!("{} panicked: {}", hook.as_str(), panic_message(&*panic))),
  }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
  if let Some(s) = panic.downcast_ref::<&str>() {
    s.to_string()
  } else if let Some(s) = panic.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic".to_string()
  }
}
