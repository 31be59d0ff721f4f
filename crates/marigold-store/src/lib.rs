//! Marigold Store
//!
//! This crate provides the persistence boundary for the orchestration core.
//! Two backends implement the [`Store`] trait:
//!
//! - [`MemoryStore`]: everything behind one lock; used by tests and the
//!   ephemeral server mode.
//! - [`SqliteStore`]: SQLite through sqlx, with migrations under `migrations/`.
//!
//! The trait covers:
//! - Runs and their append-only state history, including the
//!   compare-and-swap commit used by the state transition engine
//! - Deployments and scheduler inserts
//! - Work pools, work queues, worker heartbeats
//! - Tag concurrency limits
//! - Notification policies and the notification queue

mod filter;
mod memory;
mod sqlite;

pub use filter::RunFilter;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marigold_schemas::{
  ConcurrencyLimit, Deployment, NotificationPolicy, QueuedNotification, Run, State, WorkPool,
  WorkQueue, Worker,
};
use uuid::Uuid;

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The requested record was not found.
  #[error("not found: {0}")]
  NotFound(String),

  /// A record with the same unique key already exists.
  #[error("already exists: {0}")]
  AlreadyExists(String),

  /// The run's current state changed since it was read.
  #[error("conflict: {0}")]
  Conflict(String),

  /// The caller passed a record the store cannot persist.
  #[error("invalid record: {0}")]
  Invalid(String),

  /// A stored value could not be decoded.
  #[error("serialization error: {0}")]
  Serialization(String),

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),
}

/// Storage trait for the orchestration core.
#[async_trait]
pub trait Store: Send + Sync {
  /// Create a run. Its initial state, if any, becomes the first history entry.
  async fn create_run(&self, run: &Run) -> Result<(), Error>;

  /// Get a run, with its current state, by ID.
  async fn read_run(&self, run_id: Uuid) -> Result<Run, Error>;

  /// List runs matching a filter.
  async fn read_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, Error>;

  /// Full state history of a run, oldest first.
  async fn read_run_states(&self, run_id: Uuid) -> Result<Vec<State>, Error>;

  /// Persist `run.state` as the run's new current state.
  ///
  /// Fails with [`Error::Conflict`] unless the stored current state id equals
  /// `expected_state_id`. On success the state row is appended and every
  /// denormalized run column is rewritten, in one atomic unit.
  async fn commit_transition(&self, run: &Run, expected_state_id: Option<Uuid>)
  -> Result<(), Error>;

  /// Newest COMPLETED state with `cache_key` that has not expired at `now`.
  async fn read_cached_state(
    &self,
    cache_key: &str,
    now: DateTime<Utc>,
  ) -> Result<Option<State>, Error>;

  /// Create a deployment.
  async fn create_deployment(&self, deployment: &Deployment) -> Result<(), Error>;

  /// Get a deployment by ID.
  async fn read_deployment(&self, deployment_id: Uuid) -> Result<Deployment, Error>;

  /// Replace a deployment.
  async fn update_deployment(&self, deployment: &Deployment) -> Result<(), Error>;

  /// Unpaused deployments with at least one active schedule.
  async fn read_schedulable_deployments(
    &self,
    offset: usize,
    limit: usize,
  ) -> Result<Vec<Deployment>, Error>;

  /// Insert scheduler-created runs, skipping any whose
  /// `(deployment_id, idempotency_key)` already exists. Returns how many were inserted.
  async fn insert_scheduled_runs(&self, runs: &[Run]) -> Result<usize, Error>;

  /// Create a work pool. Names are unique.
  async fn create_work_pool(&self, pool: &WorkPool) -> Result<(), Error>;

  /// Get a work pool by name.
  async fn read_work_pool_by_name(&self, name: &str) -> Result<Option<WorkPool>, Error>;

  /// Replace a work pool.
  async fn update_work_pool(&self, pool: &WorkPool) -> Result<(), Error>;

  /// Create a work queue. Names are unique within a pool.
  async fn create_work_queue(&self, queue: &WorkQueue) -> Result<(), Error>;

  /// Get a work queue by ID.
  async fn read_work_queue(&self, queue_id: Uuid) -> Result<WorkQueue, Error>;

  /// Get a work queue by name within a pool.
  async fn read_work_queue_by_name(
    &self,
    pool_id: Uuid,
    name: &str,
  ) -> Result<Option<WorkQueue>, Error>;

  /// All queues in a pool, ordered by priority then name.
  async fn read_work_queues(&self, pool_id: Uuid) -> Result<Vec<WorkQueue>, Error>;

  /// Replace a work queue.
  async fn update_work_queue(&self, queue: &WorkQueue) -> Result<(), Error>;

  /// Set only `last_polled`, leaving settings an operator may have changed alone.
  async fn touch_work_queue_polled(&self, queue_id: Uuid, at: DateTime<Utc>) -> Result<(), Error>;

  /// Delete a work queue. Its runs are left untouched.
  async fn delete_work_queue(&self, queue_id: Uuid) -> Result<(), Error>;

  /// SCHEDULED runs in the given queues, due by `scheduled_before`, whose
  /// deployment is not paused, ordered by next scheduled start time.
  async fn read_scheduled_runs_for_queues(
    &self,
    queue_ids: &[Uuid],
    scheduled_before: DateTime<Utc>,
    limit: Option<usize>,
  ) -> Result<Vec<Run>, Error>;

  /// Number of PENDING, RUNNING or CANCELLING runs in the given queues.
  async fn count_active_runs(&self, queue_ids: &[Uuid]) -> Result<usize, Error>;

  /// Record a heartbeat, creating the worker on first contact.
  async fn upsert_worker_heartbeat(
    &self,
    pool_id: Uuid,
    name: &str,
    at: DateTime<Utc>,
  ) -> Result<(), Error>;

  /// Workers known to a pool.
  async fn read_workers(&self, pool_id: Uuid) -> Result<Vec<Worker>, Error>;

  /// Create a tag concurrency limit. Tags are unique.
  async fn create_concurrency_limit(&self, limit: &ConcurrencyLimit) -> Result<(), Error>;

  /// Get the limit for a tag, with its current slot holders.
  async fn read_concurrency_limit(&self, tag: &str) -> Result<Option<ConcurrencyLimit>, Error>;

  /// Limits for whichever of `tags` have one.
  async fn read_concurrency_limits(&self, tags: &[String]) -> Result<Vec<ConcurrencyLimit>, Error>;

  /// Delete the limit for a tag, dropping its slots.
  async fn delete_concurrency_limit(&self, tag: &str) -> Result<(), Error>;

  /// Take a slot on every limited tag for `run_id`, or none at all.
  ///
  /// Tags without a limit are ignored. Re-acquiring for a run that already
  /// holds a slot does not take a second one.
  async fn acquire_concurrency_slots(&self, tags: &[String], run_id: Uuid) -> Result<bool, Error>;

  /// Give back `run_id`'s slots. Tags it does not hold are skipped.
  async fn release_concurrency_slots(&self, tags: &[String], run_id: Uuid) -> Result<(), Error>;

  /// Create a notification policy.
  async fn create_notification_policy(&self, policy: &NotificationPolicy) -> Result<(), Error>;

  /// List notification policies.
  async fn read_notification_policies(
    &self,
    active_only: bool,
  ) -> Result<Vec<NotificationPolicy>, Error>;

  /// Append to the notification queue.
  async fn enqueue_notification(&self, notification: &QueuedNotification) -> Result<(), Error>;

  /// Remove and return the oldest queued notification.
  async fn pop_notification(&self) -> Result<Option<QueuedNotification>, Error>;
}
