use chrono::{Duration, TimeZone, Utc};
use marigold_schemas::{
  ConcurrencyLimit, Deployment, NotificationPolicy, QueuedNotification, Run, RunKind, Schedule,
  State, StateType, WorkPool, WorkQueue,
};
use marigold_store::{Error, RunFilter, SqliteStore, Store};
use sqlx::sqlite::SqlitePoolOptions;

async fn memory_store() -> SqliteStore {
  let pool = SqlitePoolOptions::new()
    .max_connections(1)
    .connect("sqlite::memory:")
    .await
    .unwrap();
  let store = SqliteStore::new(pool);
  store.migrate().await.unwrap();
  store
}

async fn pool_with_queue(store: &SqliteStore, name: &str, priority: i32) -> WorkQueue {
  let pool = match store.read_work_pool_by_name("pool").await.unwrap() {
    Some(pool) => pool,
    None => {
      let pool = WorkPool::new("pool");
      store.create_work_pool(&pool).await.unwrap();
      pool
    }
  };
  let queue = WorkQueue::new(pool.id, name, priority);
  store.create_work_queue(&queue).await.unwrap();
  queue
}

#[tokio::test]
async fn test_run_round_trip_with_state() {
  let store = memory_store().await;
  let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
  let run = Run::flow("etl")
    .with_tags(["prod"])
    .with_initial_state(State::scheduled(at));
  store.create_run(&run).await.unwrap();

  let loaded = store.read_run(run.id).await.unwrap();
  assert_eq!(loaded.kind, RunKind::Flow);
  assert_eq!(loaded.tags, vec!["prod".to_string()]);
  assert_eq!(loaded.state_type, Some(StateType::Scheduled));
  assert_eq!(loaded.next_scheduled_start_time, Some(at));
  let state = loaded.state.unwrap();
  assert_eq!(state.id, run.state_id.unwrap());
  assert_eq!(state.scheduled_time(), Some(at));
}

#[tokio::test]
async fn test_missing_run_is_not_found() {
  let store = memory_store().await;
  let err = store.read_run(uuid::Uuid::new_v4()).await.unwrap_err();
  assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_commit_transition_is_compare_and_swap() {
  let store = memory_store().await;
  let mut run = Run::flow("etl").with_initial_state(State::pending());
  let initial = run.state_id;
  store.create_run(&run).await.unwrap();

  run.set_state(State::running());
  store.commit_transition(&run, initial).await.unwrap();

  let mut stale = run.clone();
  stale.set_state(State::failed("late writer"));
  let err = store.commit_transition(&stale, initial).await.unwrap_err();
  assert!(matches!(err, Error::Conflict(_)));

  let history = store.read_run_states(run.id).await.unwrap();
  let types: Vec<_> = history.iter().map(|s| s.state_type).collect();
  assert_eq!(types, vec![StateType::Pending, StateType::Running]);
  assert_eq!(
    store.read_run(run.id).await.unwrap().state_type,
    Some(StateType::Running)
  );
}

#[tokio::test]
async fn test_read_runs_filter() {
  let store = memory_store().await;
  let now = Utc::now();
  store
    .create_run(&Run::flow("due").with_initial_state(State::scheduled(now - Duration::minutes(5))))
    .await
    .unwrap();
  store
    .create_run(&Run::flow("later").with_initial_state(State::scheduled(now + Duration::hours(1))))
    .await
    .unwrap();
  store
    .create_run(&Run::task("task", None).with_initial_state(State::pending()))
    .await
    .unwrap();

  let filter = RunFilter {
    kind: Some(RunKind::Flow),
    state_types: vec![StateType::Scheduled],
    next_scheduled_before: Some(now),
    ..Default::default()
  };
  let runs = store.read_runs(&filter).await.unwrap();
  assert_eq!(runs.len(), 1);
  assert_eq!(runs[0].name, "due");

  let autonomous = RunFilter {
    autonomous_only: true,
    ..Default::default()
  };
  assert_eq!(store.read_runs(&autonomous).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_cached_state_lookup() {
  let store = memory_store().await;
  let now = Utc::now();
  let mut run = Run::task("cached", None).with_initial_state(State::running());
  let expected = run.state_id;
  store.create_run(&run).await.unwrap();

  let mut completed = State::completed().with_cache_key("key");
  completed.state_details.cache_expiration = Some(now + Duration::hours(1));
  run.set_state(completed.clone());
  store.commit_transition(&run, expected).await.unwrap();

  let hit = store.read_cached_state("key", now).await.unwrap().unwrap();
  assert_eq!(hit.id, completed.id);
  assert!(
    store
      .read_cached_state("key", now + Duration::hours(2))
      .await
      .unwrap()
      .is_none()
  );
}

#[tokio::test]
async fn test_scheduled_runs_are_deduplicated() {
  let store = memory_store().await;
  let deployment = Deployment::new("etl", "etl-flow").with_schedule(Schedule::cron("0 * * * *"));
  store.create_deployment(&deployment).await.unwrap();

  let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
  let first = vec![deployment.scheduled_run(at)];
  assert_eq!(store.insert_scheduled_runs(&first).await.unwrap(), 1);

  let again = vec![
    deployment.scheduled_run(at),
    deployment.scheduled_run(at + Duration::hours(1)),
  ];
  assert_eq!(store.insert_scheduled_runs(&again).await.unwrap(), 1);

  let filter = RunFilter {
    deployment_id: Some(deployment.id),
    ..Default::default()
  };
  assert_eq!(store.read_runs(&filter).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_schedulable_deployments_skip_paused_and_inactive() {
  let store = memory_store().await;
  let active = Deployment::new("active", "f").with_schedule(Schedule::cron("0 * * * *"));
  let mut paused = Deployment::new("paused", "f").with_schedule(Schedule::cron("0 * * * *"));
  paused.paused = true;
  let mut inactive = Deployment::new("inactive", "f").with_schedule(Schedule::cron("0 * * * *"));
  inactive.schedules[0].active = false;
  for d in [&active, &paused, &inactive] {
    store.create_deployment(d).await.unwrap();
  }

  let found = store.read_schedulable_deployments(0, 10).await.unwrap();
  assert_eq!(found.len(), 1);
  assert_eq!(found[0].id, active.id);
}

#[tokio::test]
async fn test_duplicate_queue_name_in_pool() {
  let store = memory_store().await;
  let queue = pool_with_queue(&store, "default", 1).await;
  let duplicate = WorkQueue::new(queue.work_pool_id, "default", 2);
  let err = store.create_work_queue(&duplicate).await.unwrap_err();
  assert!(matches!(err, Error::AlreadyExists(_)));
}

#[tokio::test]
async fn test_touch_polled_keeps_queue_settings() {
  let store = memory_store().await;
  let queue = pool_with_queue(&store, "default", 1).await;

  let mut paused = queue.clone();
  paused.is_paused = true;
  paused.concurrency_limit = Some(3);
  store.update_work_queue(&paused).await.unwrap();

  let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
  store.touch_work_queue_polled(queue.id, at).await.unwrap();

  let stored = store.read_work_queue(queue.id).await.unwrap();
  assert_eq!(stored.last_polled, Some(at));
  assert!(stored.is_paused);
  assert_eq!(stored.concurrency_limit, Some(3));

  let missing = store
    .touch_work_queue_polled(uuid::Uuid::new_v4(), at)
    .await
    .unwrap_err();
  assert!(matches!(missing, Error::NotFound(_)));
}

#[tokio::test]
async fn test_scheduled_runs_for_queues_order_and_paused_deployments() {
  let store = memory_store().await;
  let queue = pool_with_queue(&store, "default", 1).await;
  let now = Utc::now();

  let mut paused = Deployment::new("paused", "f").with_work_queue(queue.id);
  paused.paused = true;
  store.create_deployment(&paused).await.unwrap();

  let late = Run::flow("second")
    .with_work_queue(queue.id)
    .with_initial_state(State::scheduled(now - Duration::seconds(10)));
  let early = Run::flow("first")
    .with_work_queue(queue.id)
    .with_initial_state(State::scheduled(now - Duration::seconds(60)));
  let blocked = Run::flow("blocked")
    .with_deployment(paused.id, Some(queue.id))
    .with_initial_state(State::scheduled(now - Duration::seconds(30)));
  for run in [&late, &early, &blocked] {
    store.create_run(run).await.unwrap();
  }

  let runs = store
    .read_scheduled_runs_for_queues(&[queue.id], now, None)
    .await
    .unwrap();
  let names: Vec<_> = runs.iter().map(|r| r.name.as_str()).collect();
  assert_eq!(names, vec!["first", "second"]);
}

#[tokio::test]
async fn test_concurrency_slots_all_or_nothing() {
  let store = memory_store().await;
  store
    .create_concurrency_limit(&ConcurrencyLimit::new("db", 1))
    .await
    .unwrap();
  store
    .create_concurrency_limit(&ConcurrencyLimit::new("api", 2))
    .await
    .unwrap();
  let tags = vec!["db".to_string(), "api".to_string(), "unlimited".to_string()];

  let first = uuid::Uuid::new_v4();
  let second = uuid::Uuid::new_v4();
  assert!(store.acquire_concurrency_slots(&tags, first).await.unwrap());
  assert!(store.acquire_concurrency_slots(&tags, first).await.unwrap());
  assert!(!store.acquire_concurrency_slots(&tags, second).await.unwrap());

  // The failed acquire must not leave a slot on "api".
  let api = store.read_concurrency_limit("api").await.unwrap().unwrap();
  assert_eq!(api.active_slots, vec![first]);

  store.release_concurrency_slots(&tags, second).await.unwrap();
  let db = store.read_concurrency_limit("db").await.unwrap().unwrap();
  assert_eq!(db.active_slots, vec![first]);

  store.release_concurrency_slots(&tags, first).await.unwrap();
  assert!(store.acquire_concurrency_slots(&tags, second).await.unwrap());
}

#[tokio::test]
async fn test_worker_heartbeat_upsert() {
  let store = memory_store().await;
  let queue = pool_with_queue(&store, "default", 1).await;
  let first = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

  store
    .upsert_worker_heartbeat(queue.work_pool_id, "worker-a", first)
    .await
    .unwrap();
  store
    .upsert_worker_heartbeat(queue.work_pool_id, "worker-a", first + Duration::seconds(30))
    .await
    .unwrap();

  let workers = store.read_workers(queue.work_pool_id).await.unwrap();
  assert_eq!(workers.len(), 1);
  assert_eq!(workers[0].last_heartbeat_time, first + Duration::seconds(30));
}

#[tokio::test]
async fn test_notification_queue_pops_in_order() {
  let store = memory_store().await;
  let policy = NotificationPolicy::new(["Failed"], "ops");
  store.create_notification_policy(&policy).await.unwrap();
  assert_eq!(store.read_notification_policies(true).await.unwrap().len(), 1);

  let first = QueuedNotification::new(policy.id, uuid::Uuid::new_v4(), uuid::Uuid::new_v4());
  let second = QueuedNotification::new(policy.id, uuid::Uuid::new_v4(), uuid::Uuid::new_v4());
  store.enqueue_notification(&first).await.unwrap();
  store.enqueue_notification(&second).await.unwrap();

  assert_eq!(store.pop_notification().await.unwrap().unwrap().id, first.id);
  assert_eq!(store.pop_notification().await.unwrap().unwrap().id, second.id);
  assert!(store.pop_notification().await.unwrap().is_none());
}

#[tokio::test]
async fn test_file_database_persists_across_connections() {
  let dir = tempfile::tempdir().unwrap();
  let url = format!("sqlite://{}", dir.path().join("marigold.db").display());

  let run = Run::flow("persisted").with_initial_state(State::pending());
  {
    let store = SqliteStore::connect(&url).await.unwrap();
    store.migrate().await.unwrap();
    store.create_run(&run).await.unwrap();
  }

  let store = SqliteStore::connect(&url).await.unwrap();
  store.migrate().await.unwrap();
  assert_eq!(store.read_run(run.id).await.unwrap().name, "persisted");
}
