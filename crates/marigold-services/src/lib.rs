//! Marigold Services
//!
//! The background loops that run beside the orchestration engine. Each one
//! implements [`LoopService`] and is driven by [`run_loop`] on a fixed
//! interval until cancelled; a failed or panicking iteration is logged and
//! the loop keeps going.
//!
//! - [`Scheduler`]: materializes upcoming SCHEDULED runs for deployments.
//! - [`MarkLateRuns`]: marks overdue SCHEDULED flow runs "Late".
//! - [`RescheduleStuckPendingTasks`]: returns stuck autonomous task runs to SCHEDULED.
//! - [`FlowRunNotifications`]: drains the notification queue, one item at a time.

mod error;
mod late_runs;
mod loop_service;
mod notifications;
mod scheduler;
mod task_scheduling;

pub use error::ServiceError;
pub use late_runs::MarkLateRuns;
pub use loop_service::{LoopService, run_iteration, run_loop, spawn_services};
pub use notifications::{
  FlowRunNotifications, LogSender, NOTIFICATION_SUBJECT, NotificationSender, TEMPLATE_KEYS,
  render_message,
};
pub use scheduler::Scheduler;
pub use task_scheduling::RescheduleStuckPendingTasks;
