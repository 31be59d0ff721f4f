//! Marigold Work Queues
//!
//! Answers "which scheduled runs are ready to be claimed right now, and in
//! what order" for a queue or for a whole work pool.
//!
//! - [`WorkQueueService::get_runs`]: one queue, earliest scheduled first.
//! - [`WorkQueueService::get_scheduled_runs_for_pool`]: several queues merged
//!   by queue priority, then scheduled time.
//! - [`QueueMatcher`]: resolves names, prefixes or globs to a pool's live
//!   queues, with a short cache.

mod error;
mod matcher;
mod service;

pub use error::WorkQueueError;
pub use matcher::{QueueMatcher, QueueSelector};
pub use service::WorkQueueService;
