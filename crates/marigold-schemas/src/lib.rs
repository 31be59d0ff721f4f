//! Marigold Schemas
//!
//! This crate contains the plain data model shared by the orchestration
//! engine, the stores and the dispatch layer. Nothing here performs I/O;
//! validation of wire payloads happens before these types are built.
//!
//! - [`State`] and [`StateType`]: immutable lifecycle records for a run.
//! - [`Run`]: a flow run or task run with its denormalized current state.
//! - [`WorkPool`] / [`WorkQueue`] / [`Worker`]: dispatch topology.
//! - [`Deployment`] / [`Schedule`]: what the scheduler materializes runs from.
//! - [`ConcurrencyLimit`]: tag-scoped slot limits.
//! - [`NotificationPolicy`] / [`QueuedNotification`]: state-change notifications.

mod concurrency;
mod deployment;
mod error;
mod notification;
mod run;
mod schedule;
mod states;
mod work_pool;

pub use concurrency::ConcurrencyLimit;
pub use deployment::{Deployment, DeploymentSchedule};
pub use error::ScheduleError;
pub use notification::{DEFAULT_MESSAGE_TEMPLATE, NotificationPolicy, QueuedNotification};
pub use run::{EmpiricalPolicy, RetryDelay, Run, RunKind};
pub use schedule::Schedule;
pub use states::{State, StateDetails, StateType};
pub use work_pool::{
  DEFAULT_AGENT_WORK_POOL_NAME, DEFAULT_WORK_QUEUE_NAME, QueueFilter, WorkPool, WorkQueue, Worker,
  WorkerStatus,
};
