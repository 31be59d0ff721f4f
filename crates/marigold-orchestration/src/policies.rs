//! Ordered rule sets for flow runs and task runs.

use std::sync::Arc;

use marigold_schemas::RunKind;

use crate::events::TransitionNotifier;
use crate::rule::OrchestrationRule;
use crate::rules::*;

/// An ordered list of rules, built fresh for one proposal.
pub struct Policy {
  pub rules: Vec<Box<dyn OrchestrationRule>>,
}

impl Policy {
  pub fn new(rules: Vec<Box<dyn OrchestrationRule>>) -> Self {
    Self { rules }
  }

  pub fn names(&self) -> Vec<&'static str> {
    self.rules.iter().map(|r| r.name()).collect()
  }
}

/// Rules governing flow runs.
pub fn flow_policy(notifier: Arc<dyn TransitionNotifier>) -> Policy {
  Policy::new(vec![
    Box::new(InstrumentRunStateTransitions::new(notifier)),
    Box::new(QueueRunNotifications),
    Box::new(HandleTerminalStateTransitions),
    Box::new(EnforceCancellingToCancelledTransition),
    Box::new(PreventPendingTransitions),
    Box::new(EnsureParentTaskIsRunning),
    Box::new(HandlePausingRuns),
    Box::new(HandleResumingPausedRuns),
    Box::new(RetryFailedRuns),
    Box::new(EnsureScheduledTime),
    Box::new(SetRunStateFields),
    Box::new(UpdateRunCounters),
  ])
}

/// Rules governing task runs.
pub fn task_policy(notifier: Arc<dyn TransitionNotifier>) -> Policy {
  Policy::new(vec![
    Box::new(InstrumentRunStateTransitions::new(notifier)),
    Box::new(HandleTerminalStateTransitions),
    Box::new(EnforceCancellingToCancelledTransition),
    Box::new(PreventPendingTransitions),
    Box::new(PreventRunningTasksFromStoppedFlows),
    Box::new(RetrieveCachedState),
    Box::new(SecureTaskConcurrencySlots::default()),
    Box::new(ReleaseTaskConcurrencySlots),
    Box::new(RetryFailedRuns),
    Box::new(InsertCacheExpiration),
    Box::new(EnsureScheduledTime),
    Box::new(SetRunStateFields),
    Box::new(UpdateRunCounters),
  ])
}

/// Rules for the late-run sweep: the guard plus the usual bookkeeping.
pub fn late_runs_policy(notifier: Arc<dyn TransitionNotifier>) -> Policy {
  Policy::new(vec![
    Box::new(InstrumentRunStateTransitions::new(notifier)),
    Box::new(QueueRunNotifications),
    Box::new(EnsureOnlyScheduledRunsMarkedLate),
    Box::new(EnsureScheduledTime),
    Box::new(SetRunStateFields),
    Box::new(UpdateRunCounters),
  ])
}

pub fn policy_for(kind: RunKind, notifier: Arc<dyn TransitionNotifier>) -> Policy {
  match kind {
    RunKind::Flow => flow_policy(notifier),
    RunKind::Task => task_policy(notifier),
  }
}
