use std::sync::Arc;

use chrono::{Duration, Utc};
use marigold_config::OrchestrationSettings;
use marigold_orchestration::{
  ChannelNotifier, OrchestrationEngine, Outcome, Parameters, Status,
};
use marigold_schemas::{
  ConcurrencyLimit, Deployment, EmpiricalPolicy, NotificationPolicy, RetryDelay, Run, State,
  StateType,
};
use marigold_store::{MemoryStore, Store};
use tokio::sync::mpsc;
use uuid::Uuid;

fn engine_with(settings: OrchestrationSettings) -> (OrchestrationEngine, Arc<MemoryStore>) {
  let store = Arc::new(MemoryStore::new());
  let engine = OrchestrationEngine::new(store.clone(), settings);
  (engine, store)
}

fn engine() -> (OrchestrationEngine, Arc<MemoryStore>) {
  engine_with(OrchestrationSettings::default())
}

async fn create(store: &MemoryStore, run: Run) -> Uuid {
  store.create_run(&run).await.unwrap();
  run.id
}

async fn propose(engine: &OrchestrationEngine, run_id: Uuid, state: State) -> Outcome {
  engine
    .propose_state(run_id, state, false, Parameters::new())
    .await
    .unwrap()
}

#[tokio::test]
async fn test_terminal_runs_only_move_when_forced() {
  let (engine, store) = engine();
  let run_id = create(&store, Run::flow("done").with_initial_state(State::completed())).await;

  let outcome = propose(&engine, run_id, State::running()).await;
  assert_eq!(outcome.status(), Status::Abort);
  assert_eq!(outcome.reason(), Some("This run has already terminated."));

  let outcome = engine
    .propose_state(run_id, State::running(), true, Parameters::new())
    .await
    .unwrap();
  assert_eq!(outcome.status(), Status::Accept);

  let run = store.read_run(run_id).await.unwrap();
  assert_eq!(run.state_type, Some(StateType::Running));
  assert_eq!(run.run_count, 1);
  assert_eq!(run.end_time, None);
}

#[tokio::test]
async fn test_failures_are_retried_until_retries_run_out() {
  let (engine, store) = engine();
  let policy = EmpiricalPolicy::with_retries(2).with_retry_delay(RetryDelay::Fixed { seconds: 10 });
  let run = Run::flow("flaky")
    .with_empirical_policy(policy)
    .with_initial_state(State::running());
  let run_id = create(&store, run).await;

  for expected_remaining in [1, 0] {
    let before = Utc::now();
    let outcome = propose(&engine, run_id, State::failed("boom")).await;
    let Outcome::Reject { state, .. } = outcome else {
      panic!("expected a retry, got {:?}", outcome);
    };
    assert_eq!(state.state_type, StateType::Scheduled);
    assert_eq!(state.name, "AwaitingRetry");
    assert_eq!(state.message.as_deref(), Some("boom"));
    assert!(state.scheduled_time().unwrap() >= before + Duration::seconds(10));

    let run = store.read_run(run_id).await.unwrap();
    assert_eq!(run.empirical_policy.retries_remaining, expected_remaining);

    assert_eq!(propose(&engine, run_id, State::pending()).await.status(), Status::Accept);
    assert_eq!(propose(&engine, run_id, State::running()).await.status(), Status::Accept);
  }

  let outcome = propose(&engine, run_id, State::failed("boom")).await;
  assert_eq!(outcome.status(), Status::Accept);

  let run = store.read_run(run_id).await.unwrap();
  assert_eq!(run.state_type, Some(StateType::Failed));
  assert_eq!(run.run_count, 2);
  assert!(run.end_time.is_some());
}

#[tokio::test]
async fn test_non_retriable_failure_is_accepted() {
  let (engine, store) = engine();
  let run = Run::task("strict", None)
    .with_empirical_policy(EmpiricalPolicy::with_retries(3))
    .with_initial_state(State::running());
  let run_id = create(&store, run).await;

  let mut failed = State::failed("bad input");
  failed.state_details.retriable = Some(false);
  assert_eq!(propose(&engine, run_id, failed).await.status(), Status::Accept);
}

#[tokio::test]
async fn test_concurrent_claims_are_serialized() {
  let (engine, store) = engine();
  let run_id = create(
    &store,
    Run::flow("contested").with_initial_state(State::scheduled(Utc::now())),
  )
  .await;
  let engine = Arc::new(engine);

  let handles: Vec<_> = (0..2)
    .map(|_| {
      let engine = engine.clone();
      tokio::spawn(async move {
        engine
          .propose_state(run_id, State::pending(), false, Parameters::new())
          .await
          .unwrap()
      })
    })
    .collect();

  let mut statuses = Vec::new();
  for handle in handles {
    statuses.push(handle.await.unwrap().status());
  }
  statuses.sort_by_key(|s| *s as u8);
  assert_eq!(statuses, vec![Status::Accept, Status::Abort]);
  assert_eq!(store.read_run_states(run_id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_cancelling_runs_can_only_be_cancelled() {
  let (engine, store) = engine();
  let run_id = create(&store, Run::flow("stopping").with_initial_state(State::cancelling())).await;

  let outcome = propose(&engine, run_id, State::running()).await;
  assert_eq!(outcome.status(), Status::Abort);

  let outcome = propose(&engine, run_id, State::cancelled()).await;
  assert_eq!(outcome.status(), Status::Accept);
}

#[tokio::test]
async fn test_pending_cannot_be_reentered() {
  let (engine, store) = engine();
  let run_id = create(&store, Run::flow("busy").with_initial_state(State::running())).await;

  let outcome = propose(&engine, run_id, State::pending()).await;
  assert_eq!(
    outcome.reason(),
    Some("This run is in a RUNNING state and cannot transition to a PENDING state.")
  );
}

#[tokio::test]
async fn test_cached_result_short_circuits_task() {
  let (engine, store) = engine_with(OrchestrationSettings {
    default_cache_ttl_seconds: Some(3600),
    ..Default::default()
  });

  let first = create(&store, Run::task("first", None).with_initial_state(State::running())).await;
  let outcome = propose(
    &engine,
    first,
    State::completed()
      .with_cache_key("key-1")
      .with_data(serde_json::json!({"result": 42})),
  )
  .await;
  let cached = outcome.into_state().unwrap();
  assert!(cached.state_details.cache_expiration.is_some());

  let second = create(&store, Run::task("second", None).with_initial_state(State::pending())).await;
  let outcome = propose(&engine, second, State::running().with_cache_key("key-1")).await;
  let Outcome::Reject { state, .. } = outcome else {
    panic!("expected cache hit");
  };
  assert_eq!(state.state_type, StateType::Completed);
  assert_eq!(state.data, Some(serde_json::json!({"result": 42})));
  assert_ne!(state.id, cached.id);

  // Refresh bypasses the cache.
  let third = create(&store, Run::task("third", None).with_initial_state(State::pending())).await;
  let mut refresh = State::running().with_cache_key("key-1");
  refresh.state_details.refresh_cache = true;
  assert_eq!(propose(&engine, third, refresh).await.status(), Status::Accept);
}

#[tokio::test]
async fn test_concurrency_slots_are_held_while_running() {
  let (engine, store) = engine();
  store
    .create_concurrency_limit(&ConcurrencyLimit::new("db", 1))
    .await
    .unwrap();

  let first = create(
    &store,
    Run::task("first", None)
      .with_tags(["db"])
      .with_initial_state(State::pending()),
  )
  .await;
  let second = create(
    &store,
    Run::task("second", None)
      .with_tags(["db"])
      .with_initial_state(State::pending()),
  )
  .await;

  assert_eq!(propose(&engine, first, State::running()).await.status(), Status::Accept);

  let outcome = propose(&engine, second, State::running()).await;
  let Outcome::Wait { delay_seconds, .. } = outcome else {
    panic!("expected a wait, got {:?}", outcome);
  };
  assert_eq!(delay_seconds, 30);

  assert_eq!(propose(&engine, first, State::completed()).await.status(), Status::Accept);
  let limit = store.read_concurrency_limit("db").await.unwrap().unwrap();
  assert!(limit.active_slots.is_empty());

  assert_eq!(propose(&engine, second, State::running()).await.status(), Status::Accept);
  let limit = store.read_concurrency_limit("db").await.unwrap().unwrap();
  assert_eq!(limit.active_slots, vec![second]);
}

#[tokio::test]
async fn test_forced_exit_from_running_releases_slots() {
  let (engine, store) = engine();
  store
    .create_concurrency_limit(&ConcurrencyLimit::new("gpu", 2))
    .await
    .unwrap();
  let run_id = create(
    &store,
    Run::task("t", None)
      .with_tags(["gpu"])
      .with_initial_state(State::pending()),
  )
  .await;

  propose(&engine, run_id, State::running()).await;
  engine
    .propose_state(run_id, State::cancelled(), true, Parameters::new())
    .await
    .unwrap();

  let limit = store.read_concurrency_limit("gpu").await.unwrap().unwrap();
  assert!(limit.active_slots.is_empty());
}

#[tokio::test]
async fn test_zero_limit_aborts() {
  let (engine, store) = engine();
  store
    .create_concurrency_limit(&ConcurrencyLimit::new("off", 0))
    .await
    .unwrap();
  let run_id = create(
    &store,
    Run::task("t", None)
      .with_tags(["off"])
      .with_initial_state(State::pending()),
  )
  .await;

  let outcome = propose(&engine, run_id, State::running()).await;
  assert_eq!(
    outcome.reason(),
    Some(
      "The concurrency limit on tag 'off' is 0 and will deadlock if the task tries to run again.",
    )
  );
}

#[tokio::test]
async fn test_tasks_wait_for_their_flow_to_run() {
  let (engine, store) = engine();
  let flow = create(&store, Run::flow("parent").with_initial_state(State::pending())).await;
  let task = create(
    &store,
    Run::task("child", Some(flow)).with_initial_state(State::pending()),
  )
  .await;

  assert_eq!(propose(&engine, task, State::running()).await.status(), Status::Abort);
  propose(&engine, flow, State::running()).await;

  assert_eq!(propose(&engine, task, State::running()).await.status(), Status::Accept);
  let run = store.read_run(task).await.unwrap();
  let details = &run.state.unwrap().state_details;
  assert_eq!(details.task_run_id, Some(task));
  assert_eq!(details.flow_run_id, Some(flow));
}

#[tokio::test]
async fn test_subflow_requires_running_parent_task() {
  let (engine, store) = engine();
  let parent_task = create(
    &store,
    Run::task("wrapper", None).with_initial_state(State::completed()),
  )
  .await;
  let subflow = create(
    &store,
    Run::flow("sub")
      .with_parent_task_run(parent_task)
      .with_initial_state(State::pending()),
  )
  .await;

  assert_eq!(propose(&engine, subflow, State::running()).await.status(), Status::Abort);
}

#[tokio::test]
async fn test_pause_and_resume() {
  let (engine, store) = engine();
  let run_id = create(&store, Run::flow("approval").with_initial_state(State::running())).await;

  let outcome = propose(&engine, run_id, State::paused(None, false, Some("gate".into()))).await;
  let paused = outcome.into_state().unwrap();
  assert!(paused.state_details.pause_timeout.is_some());

  // Resuming into anything but RUNNING is refused.
  assert_eq!(propose(&engine, run_id, State::pending()).await.status(), Status::Abort);

  assert_eq!(propose(&engine, run_id, State::running()).await.status(), Status::Accept);
  let run = store.read_run(run_id).await.unwrap();
  assert!(run.empirical_policy.resuming);
  assert_eq!(run.empirical_policy.pause_keys, vec!["gate".to_string()]);

  // The same pause key does not fire twice.
  let outcome = propose(&engine, run_id, State::paused(None, false, Some("gate".into()))).await;
  assert_eq!(outcome.status(), Status::Abort);
}

#[tokio::test]
async fn test_expired_pause_fails_the_run() {
  let (engine, store) = engine();
  let run_id = create(&store, Run::flow("stale").with_initial_state(State::running())).await;

  let expired = Utc::now() - Duration::seconds(1);
  propose(&engine, run_id, State::paused(Some(expired), false, None)).await;

  let outcome = propose(&engine, run_id, State::running()).await;
  let Outcome::Reject { state, .. } = outcome else {
    panic!("expected the pause to have timed out");
  };
  assert_eq!(state.state_type, StateType::Failed);
}

#[tokio::test]
async fn test_reschedule_pause_needs_deployment() {
  let (engine, store) = engine();
  let orphan = create(&store, Run::flow("orphan").with_initial_state(State::running())).await;
  let outcome = propose(&engine, orphan, State::paused(None, true, None)).await;
  assert_eq!(outcome.status(), Status::Abort);

  let deployment = Deployment::new("nightly", "etl");
  let deployed = create(
    &store,
    Run::flow("deployed")
      .with_deployment(deployment.id, None)
      .with_initial_state(State::running()),
  )
  .await;
  assert_eq!(
    propose(&engine, deployed, State::paused(None, true, None)).await.status(),
    Status::Accept
  );
  assert_eq!(propose(&engine, deployed, State::running()).await.status(), Status::Abort);
  assert_eq!(
    propose(&engine, deployed, State::scheduled(Utc::now())).await.status(),
    Status::Accept
  );
}

#[tokio::test]
async fn test_matching_policies_queue_notifications() {
  let (engine, store) = engine();
  let mut policy = NotificationPolicy::new(["Failed"], "ops");
  policy.tags = vec!["prod".to_string()];
  store.create_notification_policy(&policy).await.unwrap();

  let tagged = create(
    &store,
    Run::flow("tagged")
      .with_tags(["prod"])
      .with_initial_state(State::running()),
  )
  .await;
  let untagged = create(&store, Run::flow("untagged").with_initial_state(State::running())).await;

  propose(&engine, untagged, State::failed("x")).await;
  let failed = propose(&engine, tagged, State::failed("x")).await.into_state().unwrap();

  let queued = store.pop_notification().await.unwrap().unwrap();
  assert_eq!(queued.policy_id, policy.id);
  assert_eq!(queued.run_id, tagged);
  assert_eq!(queued.state_id, failed.id);
  assert!(store.pop_notification().await.unwrap().is_none());
}

#[tokio::test]
async fn test_transition_events_are_emitted() {
  let (tx, mut rx) = mpsc::unbounded_channel();
  let store = Arc::new(MemoryStore::new());
  let engine = OrchestrationEngine::with_notifier(
    store.clone(),
    OrchestrationSettings::default(),
    ChannelNotifier::new(tx),
  );
  let run = Run::flow("observed").with_initial_state(State::pending());
  store.create_run(&run).await.unwrap();

  engine
    .propose_state(run.id, State::running(), false, Parameters::new())
    .await
    .unwrap();
  let event = rx.try_recv().unwrap();
  assert_eq!(event.run_id, run.id);
  assert_eq!(event.initial_state_type, Some(StateType::Pending));
  assert_eq!(event.event_name(), "marigold.flow-run.Running");

  // Aborted proposals emit nothing.
  engine
    .propose_state(run.id, State::pending(), false, Parameters::new())
    .await
    .unwrap();
  assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_run_counters_follow_history() {
  let (engine, store) = engine();
  let scheduled_for = Utc::now() + Duration::minutes(5);
  let run_id = create(&store, Run::flow("counted").with_initial_state(State::pending())).await;

  propose(&engine, run_id, State::scheduled(scheduled_for)).await;
  let run = store.read_run(run_id).await.unwrap();
  assert_eq!(run.next_scheduled_start_time, Some(scheduled_for));
  assert_eq!(run.expected_start_time, Some(scheduled_for));

  propose(&engine, run_id, State::pending()).await;
  let started = Utc::now();
  propose(&engine, run_id, State::running().with_timestamp(started)).await;
  propose(
    &engine,
    run_id,
    State::completed().with_timestamp(started + Duration::seconds(3)),
  )
  .await;

  let run = store.read_run(run_id).await.unwrap();
  assert_eq!(run.run_count, 1);
  assert_eq!(run.start_time, Some(started));
  assert_eq!(run.total_run_time_ms, 3000);
  assert_eq!(run.end_time, Some(started + Duration::seconds(3)));
  assert_eq!(run.next_scheduled_start_time, None);
}

#[tokio::test]
async fn test_scheduled_without_time_is_scheduled_now() {
  let (engine, store) = engine();
  let run_id = create(&store, Run::flow("asap").with_initial_state(State::pending())).await;
  let before = Utc::now();

  let mut scheduled = State::new(StateType::Scheduled);
  scheduled.state_details.scheduled_time = None;
  let state = propose(&engine, run_id, scheduled).await.into_state().unwrap();
  assert!(state.scheduled_time().unwrap() >= before);
}
