//! Marigold Orchestration
//!
//! The run state machine. Callers propose a state for a run; the
//! [`OrchestrationEngine`] evaluates the proposal against the run's
//! [`Policy`] and returns an [`Outcome`]:
//!
//! - ACCEPT: the proposed state was persisted.
//! - REJECT: a rule substituted another state, which was persisted.
//! - ABORT: nothing changed.
//! - WAIT: nothing changed; propose again after the given delay.
//!
//! Policies are ordered lists of [`OrchestrationRule`]s. Flow runs and task
//! runs each have one (see [`flow_policy`] and [`task_policy`]).

mod context;
mod engine;
mod error;
mod events;
mod locks;
mod outcome;
mod policies;
mod rule;
pub mod rules;

pub use context::{OrchestrationContext, Parameters};
pub use engine::OrchestrationEngine;
pub use error::OrchestrationError;
pub use events::{ChannelNotifier, NoopNotifier, TransitionEvent, TransitionNotifier};
pub use locks::{RunLockGuard, RunLocks};
pub use outcome::{Outcome, Status};
pub use policies::{Policy, flow_policy, late_runs_policy, policy_for, task_policy};
pub use rule::{OrchestrationRule, RuleScope, StateSet};
