//! The built-in orchestration rules.

mod bookkeeping;
mod cache;
mod concurrency;
mod instrumentation;
mod lifecycle;
mod pause;
mod retry;

pub use bookkeeping::{EnsureScheduledTime, SetRunStateFields, UpdateRunCounters};
pub use cache::{InsertCacheExpiration, RetrieveCachedState};
pub use concurrency::{ReleaseTaskConcurrencySlots, SecureTaskConcurrencySlots};
pub use instrumentation::{InstrumentRunStateTransitions, QueueRunNotifications};
pub use lifecycle::{
  EnforceCancellingToCancelledTransition, EnsureOnlyScheduledRunsMarkedLate,
  EnsureParentTaskIsRunning, HandleTerminalStateTransitions, PreventPendingTransitions,
  PreventRunningTasksFromStoppedFlows,
};
pub use pause::{HandlePausingRuns, HandleResumingPausedRuns};
pub use retry::RetryFailedRuns;
