//! Marigold Config
//!
//! Server settings, loaded from an optional JSON file. Every field has a
//! default, so an empty object (or no file at all) is a valid configuration:
//!
//! ```json
//! { "scheduler": { "max_runs": 50 }, "worker": { "limit": 4 } }
//! ```

use std::path::Path;
use std::time::Duration;

use marigold_schemas::RetryDelay;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("failed to read config file {path}: {source}")]
  Read {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse config file {path}: {source}")]
  Parse {
    path: String,
    #[source]
    source: serde_json::Error,
  },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
  pub orchestration: OrchestrationSettings,
  pub scheduler: SchedulerSettings,
  pub late_runs: LateRunsSettings,
  pub task_scheduling: TaskSchedulingSettings,
  pub notifications: NotificationSettings,
  pub work_queues: WorkQueueSettings,
  pub worker: WorkerSettings,
}

impl Settings {
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.display().to_string(),
      source,
    })?;
    Self::from_json(&content).map_err(|source| ConfigError::Parse {
      path: path.display().to_string(),
      source,
    })
  }

  pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(content)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationSettings {
  /// Suggested WAIT when a task cannot get its concurrency slots.
  pub concurrency_slot_wait_seconds: u64,
  /// Stamped on COMPLETED task states that carry a cache key but no expiration.
  pub default_cache_ttl_seconds: Option<u64>,
  /// Used by runs whose policy does not set a delay.
  pub default_retry_delay: RetryDelay,
  /// Applied to PAUSED proposals without a timeout.
  pub pause_timeout_seconds: u64,
}

impl Default for OrchestrationSettings {
  fn default() -> Self {
    Self {
      concurrency_slot_wait_seconds: 30,
      default_cache_ttl_seconds: None,
      default_retry_delay: RetryDelay::Fixed { seconds: 0 },
      pause_timeout_seconds: 3600,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
  pub loop_seconds: u64,
  pub max_runs: usize,
  pub min_runs: usize,
  pub max_scheduled_days: i64,
  pub min_scheduled_hours: i64,
  pub deployment_batch_size: usize,
}

impl Default for SchedulerSettings {
  fn default() -> Self {
    Self {
      loop_seconds: 60,
      max_runs: 100,
      min_runs: 3,
      max_scheduled_days: 100,
      min_scheduled_hours: 1,
      deployment_batch_size: 100,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LateRunsSettings {
  pub loop_seconds: u64,
  /// How far past its start time a run must be before it is marked late.
  pub after_seconds: i64,
}

impl Default for LateRunsSettings {
  fn default() -> Self {
    Self {
      loop_seconds: 5,
      after_seconds: 15,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSchedulingSettings {
  pub loop_seconds: u64,
  pub pending_task_timeout_seconds: i64,
}

impl Default for TaskSchedulingSettings {
  fn default() -> Self {
    Self {
      loop_seconds: 30,
      pending_task_timeout_seconds: 30,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
  pub loop_seconds: u64,
}

impl Default for NotificationSettings {
  fn default() -> Self {
    Self { loop_seconds: 4 }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkQueueSettings {
  /// How long a poller reuses its matched queue set.
  pub queue_cache_seconds: u64,
  pub worker_offline_after_seconds: i64,
}

impl Default for WorkQueueSettings {
  fn default() -> Self {
    Self {
      queue_cache_seconds: 60,
      worker_offline_after_seconds: 90,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
  /// Claim runs this far ahead of their scheduled time.
  pub prefetch_seconds: i64,
  pub query_seconds: u64,
  /// Maximum runs submitted at once; `None` is unbounded.
  pub limit: Option<usize>,
  pub heartbeat_seconds: u64,
}

impl Default for WorkerSettings {
  fn default() -> Self {
    Self {
      prefetch_seconds: 10,
      query_seconds: 10,
      limit: None,
      heartbeat_seconds: 30,
    }
  }
}

impl WorkerSettings {
  pub fn query_interval(&self) -> Duration {
    Duration::from_secs(self.query_seconds.max(1))
  }
}
