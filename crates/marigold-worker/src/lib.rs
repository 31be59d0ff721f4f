//! Marigold Worker
//!
//! Polls a work pool for scheduled runs, claims them through the
//! orchestration engine and hands them to an [`Infrastructure`].
//!
//! - [`Worker`]: the poll / claim / submit / monitor loop.
//! - [`OrchestrationClient`]: the calls a worker makes; [`LocalClient`]
//!   serves them in-process.
//! - [`Infrastructure`]: launches a job and reports when it started;
//!   [`ProcessInfrastructure`] runs it as a child process.
//! - [`Limiter`]: caps how many runs a worker has in flight.

mod client;
mod error;
mod infrastructure;
mod limiter;
mod worker;

pub use client::{LocalClient, OrchestrationClient, PollRequest};
pub use error::{ClientError, InfrastructureError, WorkerError};
pub use infrastructure::{
  Infrastructure, InfrastructureResult, JobConfiguration, ProcessInfrastructure, StartedSignal,
};
pub use limiter::Limiter;
pub use worker::Worker;
