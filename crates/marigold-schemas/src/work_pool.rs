//! Work pools, work queues and the workers that poll them.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pool used by pollers that do not name one.
pub const DEFAULT_AGENT_WORK_POOL_NAME: &str = "default-agent-pool";

/// Queue created alongside every work pool.
pub const DEFAULT_WORK_QUEUE_NAME: &str = "default";

/// Groups work queues that share infrastructure and a worker population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkPool {
  pub id: Uuid,
  pub name: String,
  pub description: Option<String>,
  #[serde(default)]
  pub is_paused: bool,
  /// Caps active runs across every queue in the pool.
  pub concurrency_limit: Option<u32>,
  pub default_queue_id: Option<Uuid>,
  pub created: DateTime<Utc>,
}

impl WorkPool {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      id: Uuid::new_v4(),
      name: name.into(),
      description: None,
      is_paused: false,
      concurrency_limit: None,
      default_queue_id: None,
      created: Utc::now(),
    }
  }

  pub fn with_concurrency_limit(mut self, limit: u32) -> Self {
    self.concurrency_limit = Some(limit);
    self
  }
}

/// Optional criteria narrowing which runs a queue serves.
///
/// Empty lists place no restriction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueFilter {
  /// A run must carry every one of these tags.
  pub tags: Vec<String>,
  /// A run must belong to one of these deployments.
  pub deployment_ids: Vec<Uuid>,
}

impl QueueFilter {
  pub fn is_empty(&self) -> bool {
    self.tags.is_empty() && self.deployment_ids.is_empty()
  }

  pub fn accepts(&self, run_tags: &[String], deployment_id: Option<Uuid>) -> bool {
    let tags_ok = self.tags.iter().all(|t| run_tags.contains(t));
    let deployment_ok = self.deployment_ids.is_empty()
      || deployment_id.is_some_and(|id| self.deployment_ids.contains(&id));
    tags_ok && deployment_ok
  }
}

/// A named, prioritized channel of ready runs inside a pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkQueue {
  pub id: Uuid,
  pub work_pool_id: Uuid,
  pub name: String,
  pub description: Option<String>,
  /// Lower is served first.
  pub priority: i32,
  pub concurrency_limit: Option<u32>,
  #[serde(default)]
  pub is_paused: bool,
  #[serde(default)]
  pub filter: QueueFilter,
  pub last_polled: Option<DateTime<Utc>>,
  pub created: DateTime<Utc>,
}

impl WorkQueue {
  pub fn new(work_pool_id: Uuid, name: impl Into<String>, priority: i32) -> Self {
    Self {
      id: Uuid::new_v4(),
      work_pool_id,
      name: name.into(),
      description: None,
      priority,
      concurrency_limit: None,
      is_paused: false,
      filter: QueueFilter::default(),
      last_polled: None,
      created: Utc::now(),
    }
  }

  pub fn with_concurrency_limit(mut self, limit: u32) -> Self {
    self.concurrency_limit = Some(limit);
    self
  }

  pub fn with_filter(mut self, filter: QueueFilter) -> Self {
    self.filter = filter;
    self
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
  Online,
  Offline,
}

/// A poller known to a pool through its heartbeats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
  pub id: Uuid,
  pub work_pool_id: Uuid,
  pub name: String,
  pub last_heartbeat_time: DateTime<Utc>,
}

impl Worker {
  pub fn status(&self, now: DateTime<Utc>, offline_after: Duration) -> WorkerStatus {
    if now - self.last_heartbeat_time > offline_after {
      WorkerStatus::Offline
    } else {
      WorkerStatus::Online
    }
  }
}
