use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marigold_schemas::{
  ConcurrencyLimit, Deployment, NotificationPolicy, QueuedNotification, Run, State, StateType,
  WorkPool, WorkQueue, Worker,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{Error, RunFilter, Store};

#[derive(Default)]
struct Tables {
  runs: HashMap<Uuid, Run>,
  /// Per-run state history, oldest first.
  states: HashMap<Uuid, Vec<State>>,
  deployments: Vec<Deployment>,
  pools: Vec<WorkPool>,
  queues: Vec<WorkQueue>,
  workers: Vec<Worker>,
  limits: Vec<ConcurrencyLimit>,
  policies: Vec<NotificationPolicy>,
  notifications: VecDeque<QueuedNotification>,
}

/// In-memory store. Every operation holds one lock, so each is atomic.
#[derive(Default)]
pub struct MemoryStore {
  tables: RwLock<Tables>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

fn sort_by_schedule(runs: &mut [Run]) {
  runs.sort_by(|a, b| {
    a.next_scheduled_start_time
      .cmp(&b.next_scheduled_start_time)
      .then(a.created.cmp(&b.created))
  });
}

impl Tables {
  fn insert_run(&mut self, run: &Run) -> Result<(), Error> {
    if self.runs.contains_key(&run.id) {
      return Err(Error::AlreadyExists(format!("run {}", run.id)));
    }
    self.runs.insert(run.id, run.clone());
    self
      .states
      .insert(run.id, run.state.iter().cloned().collect());
    Ok(())
  }

  fn is_deployment_paused(&self, deployment_id: Option<Uuid>) -> bool {
    deployment_id.is_some_and(|id| self.deployments.iter().any(|d| d.id == id && d.paused))
  }
}

#[async_trait]
impl Store for MemoryStore {
  async fn create_run(&self, run: &Run) -> Result<(), Error> {
    self.tables.write().await.insert_run(run)
  }

  async fn read_run(&self, run_id: Uuid) -> Result<Run, Error> {
    self
      .tables
      .read()
      .await
      .runs
      .get(&run_id)
      .cloned()
      .ok_or_else(|| Error::NotFound(format!("run {}", run_id)))
  }

  async fn read_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, Error> {
    let tables = self.tables.read().await;
    let mut runs: Vec<Run> = tables
      .runs
      .values()
      .filter(|r| filter.matches(r))
      .cloned()
      .collect();
    runs.sort_by(|a, b| a.created.cmp(&b.created).then(a.id.cmp(&b.id)));
    if let Some(limit) = filter.limit {
      runs.truncate(limit);
    }
    Ok(runs)
  }

  async fn read_run_states(&self, run_id: Uuid) -> Result<Vec<State>, Error> {
    let tables = self.tables.read().await;
    if !tables.runs.contains_key(&run_id) {
      return Err(Error::NotFound(format!("run {}", run_id)));
    }
    Ok(tables.states.get(&run_id).cloned().unwrap_or_default())
  }

  async fn commit_transition(
    &self,
    run: &Run,
    expected_state_id: Option<Uuid>,
  ) -> Result<(), Error> {
    let state = run
      .state
      .clone()
      .ok_or_else(|| Error::Invalid(format!("run {} has no state to commit", run.id)))?;

    let mut tables = self.tables.write().await;
    let current = tables
      .runs
      .get(&run.id)
      .ok_or_else(|| Error::NotFound(format!("run {}", run.id)))?;
    if current.state_id != expected_state_id {
      return Err(Error::Conflict(format!(
        "run {} is no longer in the expected state",
        run.id
      )));
    }

    tables.runs.insert(run.id, run.clone());
    tables.states.entry(run.id).or_default().push(state);
    Ok(())
  }

  async fn read_cached_state(
    &self,
    cache_key: &str,
    now: DateTime<Utc>,
  ) -> Result<Option<State>, Error> {
    let tables = self.tables.read().await;
    Ok(
      tables
        .states
        .values()
        .flatten()
        .filter(|s| {
          s.state_type == StateType::Completed
            && s.state_details.cache_key.as_deref() == Some(cache_key)
            && s.state_details.cache_expiration.is_none_or(|exp| exp > now)
        })
        .max_by_key(|s| s.timestamp)
        .cloned(),
    )
  }

  async fn create_deployment(&self, deployment: &Deployment) -> Result<(), Error> {
    let mut tables = self.tables.write().await;
    if tables.deployments.iter().any(|d| d.id == deployment.id) {
      return Err(Error::AlreadyExists(format!("deployment {}", deployment.id)));
    }
    tables.deployments.push(deployment.clone());
    Ok(())
  }

  async fn read_deployment(&self, deployment_id: Uuid) -> Result<Deployment, Error> {
    self
      .tables
      .read()
      .await
      .deployments
      .iter()
      .find(|d| d.id == deployment_id)
      .cloned()
      .ok_or_else(|| Error::NotFound(format!("deployment {}", deployment_id)))
  }

  async fn update_deployment(&self, deployment: &Deployment) -> Result<(), Error> {
    let mut tables = self.tables.write().await;
    let existing = tables
      .deployments
      .iter_mut()
      .find(|d| d.id == deployment.id)
      .ok_or_else(|| Error::NotFound(format!("deployment {}", deployment.id)))?;
    *existing = deployment.clone();
    Ok(())
  }

  async fn read_schedulable_deployments(
    &self,
    offset: usize,
    limit: usize,
  ) -> Result<Vec<Deployment>, Error> {
    let tables = self.tables.read().await;
    Ok(
      tables
        .deployments
        .iter()
        .filter(|d| !d.paused && d.has_active_schedule())
        .skip(offset)
        .take(limit)
        .cloned()
        .collect(),
    )
  }

  async fn insert_scheduled_runs(&self, runs: &[Run]) -> Result<usize, Error> {
    let mut tables = self.tables.write().await;
    let mut inserted = 0;
    for run in runs {
      let duplicate = run.idempotency_key.is_some()
        && tables.runs.values().any(|existing| {
          existing.deployment_id == run.deployment_id
            && existing.idempotency_key == run.idempotency_key
        });
      if duplicate || tables.runs.contains_key(&run.id) {
        continue;
      }
      tables.insert_run(run)?;
      inserted += 1;
    }
    Ok(inserted)
  }

  async fn create_work_pool(&self, pool: &WorkPool) -> Result<(), Error> {
    let mut tables = self.tables.write().await;
    if tables.pools.iter().any(|p| p.name == pool.name) {
      return Err(Error::AlreadyExists(format!("work pool '{}'", pool.name)));
    }
    tables.pools.push(pool.clone());
    Ok(())
  }

  async fn read_work_pool_by_name(&self, name: &str) -> Result<Option<WorkPool>, Error> {
    let tables = self.tables.read().await;
    Ok(tables.pools.iter().find(|p| p.name == name).cloned())
  }

  async fn update_work_pool(&self, pool: &WorkPool) -> Result<(), Error> {
    let mut tables = self.tables.write().await;
    let existing = tables
      .pools
      .iter_mut()
      .find(|p| p.id == pool.id)
      .ok_or_else(|| Error::NotFound(format!("work pool {}", pool.id)))?;
    *existing = pool.clone();
    Ok(())
  }

  async fn create_work_queue(&self, queue: &WorkQueue) -> Result<(), Error> {
    let mut tables = self.tables.write().await;
    if !tables.pools.iter().any(|p| p.id == queue.work_pool_id) {
      return Err(Error::NotFound(format!("work pool {}", queue.work_pool_id)));
    }
    if tables
      .queues
      .iter()
      .any(|q| q.work_pool_id == queue.work_pool_id && q.name == queue.name)
    {
      return Err(Error::AlreadyExists(format!("work queue '{}'", queue.name)));
    }
    tables.queues.push(queue.clone());
    Ok(())
  }

  async fn read_work_queue(&self, queue_id: Uuid) -> Result<WorkQueue, Error> {
    self
      .tables
      .read()
      .await
      .queues
      .iter()
      .find(|q| q.id == queue_id)
      .cloned()
      .ok_or_else(|| Error::NotFound(format!("work queue {}", queue_id)))
  }

  async fn read_work_queue_by_name(
    &self,
    pool_id: Uuid,
    name: &str,
  ) -> Result<Option<WorkQueue>, Error> {
    let tables = self.tables.read().await;
    Ok(
      tables
        .queues
        .iter()
        .find(|q| q.work_pool_id == pool_id && q.name == name)
        .cloned(),
    )
  }

  async fn read_work_queues(&self, pool_id: Uuid) -> Result<Vec<WorkQueue>, Error> {
    let tables = self.tables.read().await;
    let mut queues: Vec<WorkQueue> = tables
      .queues
      .iter()
      .filter(|q| q.work_pool_id == pool_id)
      .cloned()
      .collect();
    queues.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
    Ok(queues)
  }

  async fn update_work_queue(&self, queue: &WorkQueue) -> Result<(), Error> {
    let mut tables = self.tables.write().await;
    let existing = tables
      .queues
      .iter_mut()
      .find(|q| q.id == queue.id)
      .ok_or_else(|| Error::NotFound(format!("work queue {}", queue.id)))?;
    *existing = queue.clone();
    Ok(())
  }

  async fn touch_work_queue_polled(&self, queue_id: Uuid, at: DateTime<Utc>) -> Result<(), Error> {
    let mut tables = self.tables.write().await;
    let queue = tables
      .queues
      .iter_mut()
      .find(|q| q.id == queue_id)
      .ok_or_else(|| Error::NotFound(format!("work queue {}", queue_id)))?;
    queue.last_polled = Some(at);
    Ok(())
  }

  async fn delete_work_queue(&self, queue_id: Uuid) -> Result<(), Error> {
    let mut tables = self.tables.write().await;
    let before = tables.queues.len();
    tables.queues.retain(|q| q.id != queue_id);
    if tables.queues.len() == before {
      return Err(Error::NotFound(format!("work queue {}", queue_id)));
    }
    Ok(())
  }

  async fn read_scheduled_runs_for_queues(
    &self,
    queue_ids: &[Uuid],
    scheduled_before: DateTime<Utc>,
    limit: Option<usize>,
  ) -> Result<Vec<Run>, Error> {
    let tables = self.tables.read().await;
    let filter = RunFilter {
      state_types: vec![StateType::Scheduled],
      work_queue_ids: queue_ids.to_vec(),
      next_scheduled_before: Some(scheduled_before),
      ..Default::default()
    };
    if queue_ids.is_empty() {
      return Ok(Vec::new());
    }
    let mut runs: Vec<Run> = tables
      .runs
      .values()
      .filter(|r| filter.matches(r) && !tables.is_deployment_paused(r.deployment_id))
      .cloned()
      .collect();
    sort_by_schedule(&mut runs);
    if let Some(limit) = limit {
      runs.truncate(limit);
    }
    Ok(runs)
  }

  async fn count_active_runs(&self, queue_ids: &[Uuid]) -> Result<usize, Error> {
    let tables = self.tables.read().await;
    Ok(
      tables
        .runs
        .values()
        .filter(|r| {
          r.state_type.is_some_and(StateType::is_active)
            && r.work_queue_id.is_some_and(|id| queue_ids.contains(&id))
        })
        .count(),
    )
  }

  async fn upsert_worker_heartbeat(
    &self,
    pool_id: Uuid,
    name: &str,
    at: DateTime<Utc>,
  ) -> Result<(), Error> {
    let mut tables = self.tables.write().await;
    match tables
      .workers
      .iter_mut()
      .find(|w| w.work_pool_id == pool_id && w.name == name)
    {
      Some(worker) => worker.last_heartbeat_time = at,
      None => tables.workers.push(Worker {
        id: Uuid::new_v4(),
        work_pool_id: pool_id,
        name: name.to_string(),
        last_heartbeat_time: at,
      }),
    }
    Ok(())
  }

  async fn read_workers(&self, pool_id: Uuid) -> Result<Vec<Worker>, Error> {
    let tables = self.tables.read().await;
    Ok(
      tables
        .workers
        .iter()
        .filter(|w| w.work_pool_id == pool_id)
        .cloned()
        .collect(),
    )
  }

  async fn create_concurrency_limit(&self, limit: &ConcurrencyLimit) -> Result<(), Error> {
    let mut tables = self.tables.write().await;
    if tables.limits.iter().any(|l| l.tag == limit.tag) {
      return Err(Error::AlreadyExists(format!("concurrency limit '{}'", limit.tag)));
    }
    tables.limits.push(limit.clone());
    Ok(())
  }

  async fn read_concurrency_limit(&self, tag: &str) -> Result<Option<ConcurrencyLimit>, Error> {
    let tables = self.tables.read().await;
    Ok(tables.limits.iter().find(|l| l.tag == tag).cloned())
  }

  async fn read_concurrency_limits(&self, tags: &[String]) -> Result<Vec<ConcurrencyLimit>, Error> {
    let tables = self.tables.read().await;
    Ok(
      tables
        .limits
        .iter()
        .filter(|l| tags.contains(&l.tag))
        .cloned()
        .collect(),
    )
  }

  async fn delete_concurrency_limit(&self, tag: &str) -> Result<(), Error> {
    let mut tables = self.tables.write().await;
    let before = tables.limits.len();
    tables.limits.retain(|l| l.tag != tag);
    if tables.limits.len() == before {
      return Err(Error::NotFound(format!("concurrency limit '{}'", tag)));
    }
    Ok(())
  }

  async fn acquire_concurrency_slots(&self, tags: &[String], run_id: Uuid) -> Result<bool, Error> {
    let mut tables = self.tables.write().await;
    let mut limited = tables
      .limits
      .iter_mut()
      .filter(|l| tags.contains(&l.tag))
      .collect::<Vec<_>>();

    if !limited.iter().all(|l| l.has_room_for(run_id)) {
      return Ok(false);
    }
    for limit in limited.iter_mut() {
      if !limit.holds(run_id) {
        limit.active_slots.push(run_id);
      }
    }
    Ok(true)
  }

  async fn release_concurrency_slots(&self, tags: &[String], run_id: Uuid) -> Result<(), Error> {
    let mut tables = self.tables.write().await;
    for limit in tables.limits.iter_mut().filter(|l| tags.contains(&l.tag)) {
      limit.active_slots.retain(|id| *id != run_id);
    }
    Ok(())
  }

  async fn create_notification_policy(&self, policy: &NotificationPolicy) -> Result<(), Error> {
    self.tables.write().await.policies.push(policy.clone());
    Ok(())
  }

  async fn read_notification_policies(
    &self,
    active_only: bool,
  ) -> Result<Vec<NotificationPolicy>, Error> {
    let tables = self.tables.read().await;
    Ok(
      tables
        .policies
        .iter()
        .filter(|p| !active_only || p.is_active)
        .cloned()
        .collect(),
    )
  }

  async fn enqueue_notification(&self, notification: &QueuedNotification) -> Result<(), Error> {
    self
      .tables
      .write()
      .await
      .notifications
      .push_back(notification.clone());
    Ok(())
  }

  async fn pop_notification(&self) -> Result<Option<QueuedNotification>, Error> {
    Ok(self.tables.write().await.notifications.pop_front())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;
  use marigold_schemas::RunKind;

  #[tokio::test]
  async fn test_commit_checks_expected_state() {
    let store = MemoryStore::new();
    let mut run = Run::flow("f").with_initial_state(State::pending());
    let initial_id = run.state_id;
    store.create_run(&run).await.unwrap();

    run.set_state(State::running());
    store.commit_transition(&run, initial_id).await.unwrap();

    let mut stale = run.clone();
    stale.set_state(State::completed());
    let err = store.commit_transition(&stale, initial_id).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    let history = store.read_run_states(run.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].state_type, StateType::Running);
  }

  #[tokio::test]
  async fn test_read_runs_filters_by_kind_and_state() {
    let store = MemoryStore::new();
    store
      .create_run(&Run::flow("a").with_initial_state(State::pending()))
      .await
      .unwrap();
    store
      .create_run(&Run::task("b", None).with_initial_state(State::pending()))
      .await
      .unwrap();
    store
      .create_run(&Run::task("c", None).with_initial_state(State::running()))
      .await
      .unwrap();

    let filter = RunFilter::default()
      .kind(RunKind::Task)
      .state_types([StateType::Pending]);
    let runs = store.read_runs(&filter).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].name, "b");
  }

  #[tokio::test]
  async fn test_cached_state_respects_expiration() {
    let store = MemoryStore::new();
    let now = Utc::now();
    let mut run = Run::task("t", None).with_initial_state(State::running());
    store.create_run(&run).await.unwrap();

    let expected = run.state_id;
    let mut completed = State::completed().with_cache_key("k");
    completed.state_details.cache_expiration = Some(now + Duration::minutes(1));
    run.set_state(completed);
    store.commit_transition(&run, expected).await.unwrap();

    assert!(store.read_cached_state("k", now).await.unwrap().is_some());
    assert!(
      store
        .read_cached_state("k", now + Duration::minutes(2))
        .await
        .unwrap()
        .is_none()
    );
    assert!(store.read_cached_state("other", now).await.unwrap().is_none());
  }
}
