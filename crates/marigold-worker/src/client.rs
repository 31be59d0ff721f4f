//! How a worker talks to the orchestration core.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marigold_orchestration::{OrchestrationEngine, OrchestrationError, Outcome, Parameters};
use marigold_schemas::{Run, State};
use marigold_store::Error as StoreError;
use marigold_work_queues::{QueueMatcher, QueueSelector, WorkQueueService};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::ClientError;

/// One poll of a work pool.
#[derive(Debug, Clone)]
pub struct PollRequest {
  /// `None` is the default agent pool.
  pub pool_name: Option<String>,
  pub selector: QueueSelector,
  pub scheduled_before: DateTime<Utc>,
  pub limit: Option<usize>,
}

#[async_trait]
pub trait OrchestrationClient: Send + Sync + 'static {
  async fn read_run(&self, run_id: Uuid) -> Result<Run, ClientError>;

  async fn propose_state(
    &self,
    run_id: Uuid,
    state: State,
    force: bool,
  ) -> Result<Outcome, ClientError>;

  async fn get_scheduled_runs(&self, request: &PollRequest) -> Result<Vec<Run>, ClientError>;

  async fn heartbeat(&self, pool_name: Option<&str>, worker_name: &str) -> Result<(), ClientError>;
}

/// Calls the engine and work queue service in-process.
pub struct LocalClient {
  engine: Arc<OrchestrationEngine>,
  queues: WorkQueueService,
  matchers: Mutex<HashMap<String, QueueMatcher>>,
}

impl LocalClient {
  pub fn new(engine: Arc<OrchestrationEngine>, queues: WorkQueueService) -> Self {
    Self {
      engine,
      queues,
      matchers: Mutex::new(HashMap::new()),
    }
  }

  pub fn engine(&self) -> &Arc<OrchestrationEngine> {
    &self.engine
  }
}

#[async_trait]
impl OrchestrationClient for LocalClient {
  async fn read_run(&self, run_id: Uuid) -> Result<Run, ClientError> {
    match self.engine.store().read_run(run_id).await {
      Ok(run) => Ok(run),
      Err(StoreError::NotFound(_)) => Err(ClientError::RunNotFound(run_id)),
      Err(e) => Err(e.into()),
    }
  }

  async fn propose_state(
    &self,
    run_id: Uuid,
    state: State,
    force: bool,
  ) -> Result<Outcome, ClientError> {
    match self
      .engine
      .propose_state(run_id, state, force, Parameters::new())
      .await
    {
      Ok(outcome) => Ok(outcome),
      Err(OrchestrationError::RunNotFound(id)) => Err(ClientError::RunNotFound(id)),
      Err(e) => Err(e.into()),
    }
  }

  async fn get_scheduled_runs(&self, request: &PollRequest) -> Result<Vec<Run>, ClientError> {
    let pool_name = request.pool_name.as_deref();
    let runs = match &request.selector {
      QueueSelector::All => {
        self
          .queues
          .get_scheduled_runs_for_pool(pool_name, &[], request.scheduled_before, request.limit)
          .await?
      }
      QueueSelector::Names(names) => {
        self
          .queues
          .get_scheduled_runs_for_pool(pool_name, names, request.scheduled_before, request.limit)
          .await?
      }
      selector => {
        let pool = self.queues.read_or_create_pool(pool_name).await?;
        let key = format!("{}:{:?}", pool.id, selector);
        let ttl = Duration::from_secs(self.queues.settings().queue_cache_seconds);

        let mut matchers = self.matchers.lock().await;
        let matcher = matchers
          .entry(key)
          .or_insert_with(|| QueueMatcher::new(selector.clone(), ttl));
        self
          .queues
          .poll(&pool, matcher, request.scheduled_before, request.limit)
          .await?
      }
    };
    Ok(runs)
  }

  async fn heartbeat(&self, pool_name: Option<&str>, worker_name: &str) -> Result<(), ClientError> {
    let pool = self.queues.read_or_create_pool(pool_name).await?;
    self.queues.heartbeat(&pool, worker_name, Utc::now()).await?;
    Ok(())
  }
}
