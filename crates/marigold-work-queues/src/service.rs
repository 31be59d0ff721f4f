use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use marigold_config::WorkQueueSettings;
use marigold_schemas::{
  DEFAULT_AGENT_WORK_POOL_NAME, DEFAULT_WORK_QUEUE_NAME, Run, WorkPool, WorkQueue, Worker,
  WorkerStatus,
};
use marigold_store::{Error as StoreError, Store};
use tracing::{debug, info};

use crate::error::WorkQueueError;
use crate::matcher::QueueMatcher;

/// Reads ready work out of queues and pools.
///
/// Reads are idempotent: nothing here claims a run. Claiming goes through the
/// orchestration engine (SCHEDULED → PENDING), which lets only one poller win.
pub struct WorkQueueService {
  store: Arc<dyn Store>,
  settings: WorkQueueSettings,
}

impl WorkQueueService {
  pub fn new(store: Arc<dyn Store>, settings: WorkQueueSettings) -> Self {
    Self { store, settings }
  }

  pub fn settings(&self) -> &WorkQueueSettings {
    &self.settings
  }

  /// A matcher whose cache lives as long as the configured queue cache TTL.
  pub fn matcher(&self, selector: crate::QueueSelector) -> QueueMatcher {
    QueueMatcher::new(
      selector,
      std::time::Duration::from_secs(self.settings.queue_cache_seconds),
    )
  }

  /// Look up a pool by name, creating it with its default queue if absent.
  ///
  /// `None` means the default agent pool.
  pub async fn read_or_create_pool(&self, name: Option<&str>) -> Result<WorkPool, WorkQueueError> {
    let name = name.unwrap_or(DEFAULT_AGENT_WORK_POOL_NAME);
    if let Some(pool) = self.store.read_work_pool_by_name(name).await? {
      return Ok(pool);
    }

    let mut pool = WorkPool::new(name);
    let queue = WorkQueue::new(pool.id, DEFAULT_WORK_QUEUE_NAME, 1);
    pool.default_queue_id = Some(queue.id);
    match self.store.create_work_pool(&pool).await {
      Ok(()) => {}
      // Another poller created it first.
      Err(StoreError::AlreadyExists(_)) => {
        return self
          .store
          .read_work_pool_by_name(name)
          .await?
          .ok_or_else(|| WorkQueueError::PoolNotFound(name.to_string()));
      }
      Err(e) => return Err(e.into()),
    }
    self.create_queue_tolerating_race(queue).await?;
    info!(pool = %pool.name, pool_id = %pool.id, "work_pool_created");
    Ok(pool)
  }

  /// Look up a queue by name within a pool, creating it if absent.
  ///
  /// New queues get the lowest priority in the pool and no limits, so
  /// workers can poll a queue before anyone provisions it.
  pub async fn read_or_create(
    &self,
    pool: &WorkPool,
    name: &str,
  ) -> Result<WorkQueue, WorkQueueError> {
    if let Some(queue) = self.store.read_work_queue_by_name(pool.id, name).await? {
      return Ok(queue);
    }
    let priority = self
      .store
      .read_work_queues(pool.id)
      .await?
      .iter()
      .map(|q| q.priority)
      .max()
      .map_or(1, |p| p.saturating_add(1));
    let queue = self
      .create_queue_tolerating_race(WorkQueue::new(pool.id, name, priority))
      .await?;
    info!(pool = %pool.name, queue = %queue.name, priority = queue.priority, "work_queue_created");
    Ok(queue)
  }

  async fn create_queue_tolerating_race(
    &self,
    queue: WorkQueue,
  ) -> Result<WorkQueue, WorkQueueError> {
    match self.store.create_work_queue(&queue).await {
      Ok(()) => Ok(queue),
      Err(StoreError::AlreadyExists(_)) => self
        .store
        .read_work_queue_by_name(queue.work_pool_id, &queue.name)
        .await?
        .ok_or(WorkQueueError::QueueNotFound(queue.name)),
      Err(e) => Err(e.into()),
    }
  }

  /// Ready runs of one queue, earliest scheduled first.
  ///
  /// A paused queue yields nothing; a queue concurrency limit caps the result
  /// at the room left beside its active runs.
  pub async fn get_runs(
    &self,
    queue: &WorkQueue,
    scheduled_before: DateTime<Utc>,
    limit: Option<usize>,
  ) -> Result<Vec<Run>, WorkQueueError> {
    if queue.is_paused {
      debug!(queue = %queue.name, "work_queue_paused");
      return Ok(Vec::new());
    }
    let room = self.queue_room(queue).await?;
    let limit = min_limit(limit, room);
    if limit == Some(0) {
      return Ok(Vec::new());
    }

    let mut runs = self
      .store
      .read_scheduled_runs_for_queues(&[queue.id], scheduled_before, None)
      .await?;
    if !queue.filter.is_empty() {
      runs.retain(|r| queue.filter.accepts(&r.tags, r.deployment_id));
    }
    if let Some(limit) = limit {
      runs.truncate(limit);
    }
    Ok(runs)
  }

  /// [`get_runs`](Self::get_runs) by queue id.
  pub async fn get_runs_for_queue(
    &self,
    queue_id: uuid::Uuid,
    scheduled_before: DateTime<Utc>,
    limit: Option<usize>,
  ) -> Result<Vec<Run>, WorkQueueError> {
    let queue = match self.store.read_work_queue(queue_id).await {
      Ok(queue) => queue,
      Err(StoreError::NotFound(_)) => {
        return Err(WorkQueueError::QueueNotFound(queue_id.to_string()));
      }
      Err(e) => return Err(e.into()),
    };
    self.get_runs(&queue, scheduled_before, limit).await
  }

  /// Ready runs across a pool's queues, by queue priority then scheduled time.
  ///
  /// With no `queue_names` every queue in the pool is read; named queues
  /// that do not exist yet are created.
  pub async fn get_scheduled_runs_for_pool(
    &self,
    pool_name: Option<&str>,
    queue_names: &[String],
    scheduled_before: DateTime<Utc>,
    limit: Option<usize>,
  ) -> Result<Vec<Run>, WorkQueueError> {
    let pool = self.read_or_create_pool(pool_name).await?;
    let queues = if queue_names.is_empty() {
      self.store.read_work_queues(pool.id).await?
    } else {
      let mut queues = Vec::with_capacity(queue_names.len());
      for name in queue_names {
        queues.push(self.read_or_create(&pool, name).await?);
      }
      queues
    };
    self
      .get_scheduled_runs_for_queues(&pool, &queues, scheduled_before, limit)
      .await
  }

  /// Like [`get_scheduled_runs_for_pool`](Self::get_scheduled_runs_for_pool)
  /// with the queue set resolved by a [`QueueMatcher`].
  ///
  /// Each matched queue is read again here, so a pause or limit set since
  /// the matcher last refreshed applies to this poll.
  pub async fn poll(
    &self,
    pool: &WorkPool,
    matcher: &mut QueueMatcher,
    scheduled_before: DateTime<Utc>,
    limit: Option<usize>,
  ) -> Result<Vec<Run>, WorkQueueError> {
    let ids = matcher
      .queue_ids(self.store.as_ref(), pool.id)
      .await?
      .to_vec();
    let mut queues = Vec::with_capacity(ids.len());
    for id in ids {
      match self.store.read_work_queue(id).await {
        Ok(queue) => queues.push(queue),
        Err(StoreError::NotFound(_)) => matcher.invalidate(),
        Err(e) => return Err(e.into()),
      }
    }
    self
      .get_scheduled_runs_for_queues(pool, &queues, scheduled_before, limit)
      .await
  }

  /// Merge the ready runs of `queues`.
  pub async fn get_scheduled_runs_for_queues(
    &self,
    pool: &WorkPool,
    queues: &[WorkQueue],
    scheduled_before: DateTime<Utc>,
    limit: Option<usize>,
  ) -> Result<Vec<Run>, WorkQueueError> {
    if pool.is_paused {
      info!(pool = %pool.name, "Work pool '{}' is paused.", pool.name);
      return Ok(Vec::new());
    }
    let limit = match pool.concurrency_limit {
      Some(pool_limit) => {
        let pool_queue_ids: Vec<uuid::Uuid> = self
          .store
          .read_work_queues(pool.id)
          .await?
          .iter()
          .map(|q| q.id)
          .collect();
        let active = self.store.count_active_runs(&pool_queue_ids).await?;
        min_limit(limit, Some((pool_limit as usize).saturating_sub(active)))
      }
      None => limit,
    };
    if limit == Some(0) {
      return Ok(Vec::new());
    }

    let mut queues: Vec<&WorkQueue> = queues.iter().collect();
    queues.sort_by_key(|q| q.priority);

    let mut candidates: Vec<(i32, Run)> = Vec::new();
    for queue in queues {
      let runs = self.get_runs(queue, scheduled_before, limit).await?;
      candidates.extend(runs.into_iter().map(|r| (queue.priority, r)));

      if let Err(e) = self
        .store
        .touch_work_queue_polled(queue.id, Utc::now())
        .await
      {
        debug!(queue = %queue.name, error = %e, "work_queue_poll_not_recorded");
      }
    }

    candidates.sort_by(|(pa, a), (pb, b)| {
      pa.cmp(pb)
        .then_with(|| a.next_scheduled_start_time.cmp(&b.next_scheduled_start_time))
    });
    let mut runs: Vec<Run> = candidates.into_iter().map(|(_, r)| r).collect();
    if let Some(limit) = limit {
      runs.truncate(limit);
    }
    Ok(runs)
  }

  async fn queue_room(&self, queue: &WorkQueue) -> Result<Option<usize>, WorkQueueError> {
    let Some(queue_limit) = queue.concurrency_limit else {
      return Ok(None);
    };
    let active = self.store.count_active_runs(&[queue.id]).await?;
    Ok(Some((queue_limit as usize).saturating_sub(active)))
  }

  /// Record that `worker_name` polled `pool` at `now`.
  pub async fn heartbeat(
    &self,
    pool: &WorkPool,
    worker_name: &str,
    now: DateTime<Utc>,
  ) -> Result<(), WorkQueueError> {
    self
      .store
      .upsert_worker_heartbeat(pool.id, worker_name, now)
      .await?;
    Ok(())
  }

  /// Workers of a pool with their status as of `now`.
  pub async fn read_workers(
    &self,
    pool_name: &str,
    now: DateTime<Utc>,
  ) -> Result<Vec<(Worker, WorkerStatus)>, WorkQueueError> {
    let pool = self
      .store
      .read_work_pool_by_name(pool_name)
      .await?
      .ok_or_else(|| WorkQueueError::PoolNotFound(pool_name.to_string()))?;
    let offline_after = Duration::seconds(self.settings.worker_offline_after_seconds);
    Ok(
      self
        .store
        .read_workers(pool.id)
        .await?
        .into_iter()
        .map(|w| {
          let status = w.status(now, offline_after);
          (w, status)
        })
        .collect(),
    )
  }
}

fn min_limit(a: Option<usize>, b: Option<usize>) -> Option<usize> {
  match (a, b) {
    (Some(a), Some(b)) => Some(a.min(b)),
    (a, None) => a,
    (None, b) => b,
  }
}
