use std::sync::Arc;

use chrono::{Duration, Utc};
use marigold_config::WorkQueueSettings;
use marigold_schemas::{
  DEFAULT_AGENT_WORK_POOL_NAME, DEFAULT_WORK_QUEUE_NAME, Deployment, QueueFilter, Run, State,
  WorkPool, WorkQueue, WorkerStatus,
};
use marigold_store::{MemoryStore, Store};
use marigold_work_queues::{QueueSelector, WorkQueueService};
use uuid::Uuid;

fn service() -> (WorkQueueService, Arc<MemoryStore>) {
  let store = Arc::new(MemoryStore::new());
  (
    WorkQueueService::new(store.clone(), WorkQueueSettings::default()),
    store,
  )
}

async fn scheduled_run(store: &MemoryStore, queue: &WorkQueue, at: chrono::DateTime<Utc>) -> Uuid {
  let run = Run::flow("run")
    .with_work_queue(queue.id)
    .with_initial_state(State::scheduled(at));
  store.create_run(&run).await.unwrap();
  run.id
}

async fn pool_with_queues(
  store: &MemoryStore,
  name: &str,
  queues: &[(&str, i32)],
) -> (WorkPool, Vec<WorkQueue>) {
  let pool = WorkPool::new(name);
  store.create_work_pool(&pool).await.unwrap();
  let mut created = Vec::new();
  for (queue_name, priority) in queues {
    let queue = WorkQueue::new(pool.id, *queue_name, *priority);
    store.create_work_queue(&queue).await.unwrap();
    created.push(queue);
  }
  (pool, created)
}

#[tokio::test]
async fn test_priority_beats_due_time() {
  let (service, store) = service();
  let (_, queues) = pool_with_queues(&store, "pool", &[("A", 1), ("B", 2)]).await;
  let now = Utc::now();
  let b_run = scheduled_run(&store, &queues[1], now - Duration::seconds(10)).await;
  let a_run = scheduled_run(&store, &queues[0], now - Duration::seconds(1)).await;

  let runs = service
    .get_scheduled_runs_for_pool(Some("pool"), &[], now, None)
    .await
    .unwrap();
  let ids: Vec<Uuid> = runs.iter().map(|r| r.id).collect();
  assert_eq!(ids, vec![a_run, b_run]);
}

#[tokio::test]
async fn test_queue_runs_are_fifo_by_due_time() {
  let (service, store) = service();
  let (_, queues) = pool_with_queues(&store, "pool", &[("only", 1)]).await;
  let now = Utc::now();
  let later = scheduled_run(&store, &queues[0], now - Duration::seconds(1)).await;
  let earlier = scheduled_run(&store, &queues[0], now - Duration::seconds(30)).await;
  scheduled_run(&store, &queues[0], now + Duration::hours(1)).await;

  let runs = service.get_runs(&queues[0], now, None).await.unwrap();
  let ids: Vec<Uuid> = runs.iter().map(|r| r.id).collect();
  assert_eq!(ids, vec![earlier, later]);

  let runs = service.get_runs(&queues[0], now, Some(1)).await.unwrap();
  assert_eq!(runs.len(), 1);
  assert_eq!(runs[0].id, earlier);
}

#[tokio::test]
async fn test_paused_queue_and_paused_deployment_are_skipped() {
  let (service, store) = service();
  let (_, mut queues) = pool_with_queues(&store, "pool", &[("open", 1), ("closed", 2)]).await;
  let now = Utc::now();
  let open_run = scheduled_run(&store, &queues[0], now - Duration::seconds(5)).await;
  scheduled_run(&store, &queues[1], now - Duration::seconds(5)).await;

  queues[1].is_paused = true;
  store.update_work_queue(&queues[1]).await.unwrap();

  let mut deployment = Deployment::new("paused", "flow");
  deployment.paused = true;
  store.create_deployment(&deployment).await.unwrap();
  let run = Run::flow("from-paused-deployment")
    .with_deployment(deployment.id, Some(queues[0].id))
    .with_initial_state(State::scheduled(now - Duration::seconds(5)));
  store.create_run(&run).await.unwrap();

  let runs = service
    .get_scheduled_runs_for_pool(Some("pool"), &[], now, None)
    .await
    .unwrap();
  let ids: Vec<Uuid> = runs.iter().map(|r| r.id).collect();
  assert_eq!(ids, vec![open_run]);
}

#[tokio::test]
async fn test_queue_concurrency_limit_caps_results() {
  let (service, store) = service();
  let pool = WorkPool::new("pool");
  store.create_work_pool(&pool).await.unwrap();
  let queue = WorkQueue::new(pool.id, "limited", 1).with_concurrency_limit(2);
  store.create_work_queue(&queue).await.unwrap();

  let busy = Run::flow("busy")
    .with_work_queue(queue.id)
    .with_initial_state(State::running());
  store.create_run(&busy).await.unwrap();
  let now = Utc::now();
  for offset in 1..=3 {
    scheduled_run(&store, &queue, now - Duration::seconds(offset)).await;
  }

  let runs = service.get_runs(&queue, now, None).await.unwrap();
  assert_eq!(runs.len(), 1);
}

#[tokio::test]
async fn test_pool_pause_and_limit() {
  let (service, store) = service();
  let (mut pool, queues) = pool_with_queues(&store, "pool", &[("a", 1), ("b", 2)]).await;
  let now = Utc::now();
  for queue in &queues {
    scheduled_run(&store, queue, now - Duration::seconds(1)).await;
  }

  pool.concurrency_limit = Some(1);
  let runs = service
    .get_scheduled_runs_for_queues(&pool, &queues, now, Some(10))
    .await
    .unwrap();
  assert_eq!(runs.len(), 1);
  assert_eq!(runs[0].work_queue_id, Some(queues[0].id));

  pool.is_paused = true;
  let runs = service
    .get_scheduled_runs_for_queues(&pool, &queues, now, None)
    .await
    .unwrap();
  assert!(runs.is_empty());
}

#[tokio::test]
async fn test_queue_filter_requires_all_tags() {
  let (service, store) = service();
  let pool = WorkPool::new("pool");
  store.create_work_pool(&pool).await.unwrap();
  let queue = WorkQueue::new(pool.id, "gpu", 1).with_filter(QueueFilter {
    tags: vec!["gpu".into(), "large".into()],
    deployment_ids: Vec::new(),
  });
  store.create_work_queue(&queue).await.unwrap();

  let now = Utc::now();
  let matching = Run::flow("both")
    .with_tags(["gpu", "large", "extra"])
    .with_work_queue(queue.id)
    .with_initial_state(State::scheduled(now - Duration::seconds(1)));
  let partial = Run::flow("one")
    .with_tags(["gpu"])
    .with_work_queue(queue.id)
    .with_initial_state(State::scheduled(now - Duration::seconds(1)));
  store.create_run(&matching).await.unwrap();
  store.create_run(&partial).await.unwrap();

  let runs = service.get_runs(&queue, now, None).await.unwrap();
  assert_eq!(runs.len(), 1);
  assert_eq!(runs[0].id, matching.id);
}

#[tokio::test]
async fn test_default_pool_is_created_on_first_poll() {
  let (service, store) = service();
  let runs = service
    .get_scheduled_runs_for_pool(None, &[], Utc::now(), None)
    .await
    .unwrap();
  assert!(runs.is_empty());

  let pool = store
    .read_work_pool_by_name(DEFAULT_AGENT_WORK_POOL_NAME)
    .await
    .unwrap()
    .unwrap();
  let queues = store.read_work_queues(pool.id).await.unwrap();
  assert_eq!(queues.len(), 1);
  assert_eq!(queues[0].name, DEFAULT_WORK_QUEUE_NAME);
  assert_eq!(pool.default_queue_id, Some(queues[0].id));

  let again = service.read_or_create_pool(None).await.unwrap();
  assert_eq!(again.id, pool.id);
}

#[tokio::test]
async fn test_named_queues_are_created_with_lowest_priority() {
  let (service, store) = service();
  let (pool, _) = pool_with_queues(&store, "pool", &[("first", 1), ("second", 5)]).await;

  service
    .get_scheduled_runs_for_pool(Some("pool"), &["fresh".to_string()], Utc::now(), None)
    .await
    .unwrap();

  let fresh = store
    .read_work_queue_by_name(pool.id, "fresh")
    .await
    .unwrap()
    .unwrap();
  assert_eq!(fresh.priority, 6);
  assert!(fresh.last_polled.is_some());

  let same = service.read_or_create(&pool, "fresh").await.unwrap();
  assert_eq!(same.id, fresh.id);
}

#[tokio::test]
async fn test_poll_with_prefix_matcher() {
  let (service, store) = service();
  let (pool, queues) =
    pool_with_queues(&store, "pool", &[("etl-a", 2), ("ml", 1), ("etl-b", 3)]).await;
  let now = Utc::now();
  for queue in &queues {
    scheduled_run(&store, queue, now - Duration::seconds(1)).await;
  }

  let mut matcher = service.matcher(QueueSelector::Prefixes(vec!["etl-".into()]));
  let runs = service.poll(&pool, &mut matcher, now, None).await.unwrap();
  let queue_ids: Vec<Option<Uuid>> = runs.iter().map(|r| r.work_queue_id).collect();
  assert_eq!(queue_ids, vec![Some(queues[0].id), Some(queues[2].id)]);
}

#[tokio::test]
async fn test_worker_heartbeats() {
  let (service, _store) = service();
  let pool = service.read_or_create_pool(Some("pool")).await.unwrap();
  let now = Utc::now();

  service
    .heartbeat(&pool, "stale", now - Duration::minutes(10))
    .await
    .unwrap();
  service.heartbeat(&pool, "fresh", now).await.unwrap();
  service
    .heartbeat(&pool, "fresh", now + Duration::seconds(1))
    .await
    .unwrap();

  let mut workers = service.read_workers("pool", now).await.unwrap();
  workers.sort_by(|a, b| a.0.name.cmp(&b.0.name));
  assert_eq!(workers.len(), 2);
  assert_eq!(workers[0].0.name, "fresh");
  assert_eq!(workers[0].1, WorkerStatus::Online);
  assert_eq!(workers[1].1, WorkerStatus::Offline);
}

#[tokio::test]
async fn test_pause_applies_while_matcher_is_cached() {
  let (service, store) = service();
  let (pool, queues) = pool_with_queues(&store, "pool", &[("etl-a", 1)]).await;
  let now = Utc::now();
  let run = scheduled_run(&store, &queues[0], now - Duration::seconds(1)).await;

  let mut matcher = service.matcher(QueueSelector::Prefixes(vec!["etl-".into()]));
  let runs = service.poll(&pool, &mut matcher, now, None).await.unwrap();
  assert_eq!(runs.len(), 1);
  assert_eq!(runs[0].id, run);

  let mut paused = store.read_work_queue(queues[0].id).await.unwrap();
  paused.is_paused = true;
  paused.priority = 7;
  store.update_work_queue(&paused).await.unwrap();

  let runs = service.poll(&pool, &mut matcher, now, None).await.unwrap();
  assert!(runs.is_empty());

  let stored = store.read_work_queue(queues[0].id).await.unwrap();
  assert!(stored.is_paused);
  assert_eq!(stored.priority, 7);
  assert!(stored.last_polled.is_some());
}

#[tokio::test]
async fn test_deleted_queue_is_skipped_by_cached_matcher() {
  let (service, store) = service();
  let (pool, queues) = pool_with_queues(&store, "pool", &[("etl-a", 1), ("etl-b", 2)]).await;
  let now = Utc::now();
  let kept = scheduled_run(&store, &queues[1], now - Duration::seconds(1)).await;

  let mut matcher = service.matcher(QueueSelector::Prefixes(vec!["etl-".into()]));
  service.poll(&pool, &mut matcher, now, None).await.unwrap();
  store.delete_work_queue(queues[0].id).await.unwrap();

  let runs = service.poll(&pool, &mut matcher, now, None).await.unwrap();
  let ids: Vec<Uuid> = runs.iter().map(|r| r.id).collect();
  assert_eq!(ids, vec![kept]);
}
