use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use marigold_config::{
  LateRunsSettings, NotificationSettings, OrchestrationSettings, SchedulerSettings,
  TaskSchedulingSettings,
};
use marigold_orchestration::OrchestrationEngine;
use marigold_schemas::{Deployment, NotificationPolicy, Run, Schedule, State, StateType};
use marigold_services::{
  FlowRunNotifications, MarkLateRuns, NOTIFICATION_SUBJECT, NotificationSender,
  RescheduleStuckPendingTasks, Scheduler, ServiceError,
};
use marigold_store::{MemoryStore, RunFilter, Store};
use uuid::Uuid;

fn engine(store: &Arc<MemoryStore>) -> Arc<OrchestrationEngine> {
  Arc::new(OrchestrationEngine::new(
    store.clone(),
    OrchestrationSettings::default(),
  ))
}

#[derive(Default)]
struct RecordingSender {
  sent: Mutex<Vec<(String, String, String)>>,
  fail: bool,
}

#[async_trait]
impl NotificationSender for RecordingSender {
  async fn send(&self, destination: &str, subject: &str, body: &str) -> Result<(), ServiceError> {
    if self.fail {
      return Err(ServiceError::Notification("webhook unreachable".into()));
    }
    self
      .sent
      .lock()
      .unwrap()
      .push((destination.into(), subject.into(), body.into()));
    Ok(())
  }
}

#[tokio::test]
async fn test_scheduler_is_idempotent() {
  let store = Arc::new(MemoryStore::new());
  let deployment = Deployment::new("hourly", "etl")
    .with_schedule(Schedule::interval(3600, Utc::now() - Duration::minutes(30)));
  store.create_deployment(&deployment).await.unwrap();

  let scheduler = Scheduler::new(store.clone(), SchedulerSettings::default());
  let now = Utc::now();
  let first = scheduler.schedule_deployments(now).await.unwrap();
  let second = scheduler.schedule_deployments(now).await.unwrap();

  assert_eq!(first, 3);
  assert_eq!(second, 0);
  let runs = store
    .read_runs(&RunFilter {
      deployment_id: Some(deployment.id),
      ..RunFilter::default()
    })
    .await
    .unwrap();
  assert_eq!(runs.len(), 3);
  assert!(runs.iter().all(|r| r.state_type == Some(StateType::Scheduled)));
}

#[tokio::test]
async fn test_scheduler_isolates_bad_deployments() {
  let store = Arc::new(MemoryStore::new());
  let broken = Deployment::new("broken", "etl").with_schedule(Schedule::cron("not a cron"));
  let healthy = Deployment::new("healthy", "etl").with_schedule(Schedule::cron("0 * * * *"));
  store.create_deployment(&broken).await.unwrap();
  store.create_deployment(&healthy).await.unwrap();

  let scheduler = Scheduler::new(
    store.clone(),
    SchedulerSettings {
      deployment_batch_size: 1,
      ..SchedulerSettings::default()
    },
  );
  let inserted = scheduler.schedule_deployments(Utc::now()).await.unwrap();

  assert_eq!(inserted, 3);
  let runs = store
    .read_runs(&RunFilter {
      deployment_id: Some(healthy.id),
      ..RunFilter::default()
    })
    .await
    .unwrap();
  assert_eq!(runs.len(), 3);
}

#[tokio::test]
async fn test_oversized_interval_does_not_stop_other_deployments() {
  let store = Arc::new(MemoryStore::new());
  let anchor = Utc::now() - Duration::minutes(30);
  let broken = Deployment::new("broken", "etl")
    .with_schedule(Schedule::interval(10_000_000_000_000_000, anchor));
  let healthy = Deployment::new("healthy", "etl").with_schedule(Schedule::interval(3600, anchor));
  store.create_deployment(&broken).await.unwrap();
  store.create_deployment(&healthy).await.unwrap();

  let scheduler = Scheduler::new(store.clone(), SchedulerSettings::default());
  let inserted = scheduler.schedule_deployments(Utc::now()).await.unwrap();

  assert_eq!(inserted, 3);
  let runs = store
    .read_runs(&RunFilter {
      deployment_id: Some(healthy.id),
      ..RunFilter::default()
    })
    .await
    .unwrap();
  assert_eq!(runs.len(), 3);
}

#[tokio::test]
async fn test_paused_deployment_is_not_scheduled() {
  let store = Arc::new(MemoryStore::new());
  let mut deployment = Deployment::new("paused", "etl").with_schedule(Schedule::cron("0 * * * *"));
  deployment.paused = true;
  store.create_deployment(&deployment).await.unwrap();

  let scheduler = Scheduler::new(store.clone(), SchedulerSettings::default());
  assert_eq!(scheduler.schedule_deployments(Utc::now()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_overdue_runs_are_marked_late_and_notified() {
  let store = Arc::new(MemoryStore::new());
  let now = Utc::now();
  let overdue_at = now - Duration::seconds(60);
  let overdue = Run::flow("overdue").with_initial_state(State::scheduled(overdue_at));
  let recent = Run::flow("recent").with_initial_state(State::scheduled(now - Duration::seconds(5)));
  let claimed = Run::flow("claimed").with_initial_state(State::pending());
  for run in [&overdue, &recent, &claimed] {
    store.create_run(run).await.unwrap();
  }
  let policy = NotificationPolicy::new(["Late"], "ops-channel");
  store.create_notification_policy(&policy).await.unwrap();

  let late_runs = MarkLateRuns::new(engine(&store), LateRunsSettings::default());
  assert_eq!(late_runs.mark_late_runs(now).await.unwrap(), 1);
  assert_eq!(late_runs.mark_late_runs(now).await.unwrap(), 0);

  let marked = store.read_run(overdue.id).await.unwrap();
  let state = marked.state.unwrap();
  assert_eq!(state.state_type, StateType::Scheduled);
  assert_eq!(state.name, "Late");
  assert_eq!(state.scheduled_time(), Some(overdue_at));
  assert_eq!(
    store.read_run(recent.id).await.unwrap().state_name.as_deref(),
    Some("Scheduled")
  );

  let sender = Arc::new(RecordingSender::default());
  let notifications = FlowRunNotifications::new(
    store.clone(),
    sender.clone(),
    NotificationSettings::default(),
  );
  assert_eq!(notifications.drain().await.unwrap(), 1);

  let sent = sender.sent.lock().unwrap().clone();
  assert_eq!(sent.len(), 1);
  assert_eq!(sent[0].0, "ops-channel");
  assert_eq!(sent[0].1, NOTIFICATION_SUBJECT);
  assert_eq!(
    sent[0].2,
    format!("Flow run overdue with id {} entered state Late.", overdue.id)
  );
}

#[tokio::test]
async fn test_failed_send_is_not_requeued() {
  let store = Arc::new(MemoryStore::new());
  let run = Run::flow("f").with_initial_state(State::running());
  store.create_run(&run).await.unwrap();
  let mut policy = NotificationPolicy::new(["Failed"], "pager");
  policy.message_template = Some("{flow_run_name}: {flow_run_state_message}".into());
  store.create_notification_policy(&policy).await.unwrap();

  let engine = engine(&store);
  engine
    .propose_state(run.id, State::failed("disk full"), false, Default::default())
    .await
    .unwrap();

  let sender = Arc::new(RecordingSender {
    fail: true,
    ..RecordingSender::default()
  });
  let notifications =
    FlowRunNotifications::new(store.clone(), sender, NotificationSettings::default());
  assert_eq!(notifications.drain().await.unwrap(), 1);
  assert!(store.pop_notification().await.unwrap().is_none());
}

#[tokio::test]
async fn test_stuck_pending_task_is_rescheduled_with_its_parameters() {
  let store = Arc::new(MemoryStore::new());
  let now = Utc::now();
  let parameters_id = Uuid::new_v4();

  let mut scheduled = State::scheduled(now - Duration::seconds(120));
  scheduled.state_details.task_parameters_id = Some(parameters_id);
  let mut stuck = Run::task("background", None).with_initial_state(scheduled);
  store.create_run(&stuck).await.unwrap();
  let expected = stuck.state_id;
  stuck.set_state(State::pending().with_timestamp(now - Duration::seconds(60)));
  store.commit_transition(&stuck, expected).await.unwrap();

  let orphan = Run::task("orphan", None)
    .with_initial_state(State::pending().with_timestamp(now - Duration::seconds(60)));
  store.create_run(&orphan).await.unwrap();

  let fresh = Run::task("fresh", None).with_initial_state(State::pending());
  store.create_run(&fresh).await.unwrap();

  let sweep = RescheduleStuckPendingTasks::new(engine(&store), TaskSchedulingSettings::default());
  assert_eq!(sweep.reschedule_pending_runs(now).await.unwrap(), 1);

  let state = store.read_run(stuck.id).await.unwrap().state.unwrap();
  assert_eq!(state.state_type, StateType::Scheduled);
  assert_eq!(state.state_details.task_parameters_id, Some(parameters_id));
  assert_eq!(
    store.read_run(orphan.id).await.unwrap().state_type,
    Some(StateType::Pending)
  );
  assert_eq!(
    store.read_run(fresh.id).await.unwrap().state_type,
    Some(StateType::Pending)
  );
}
