//! Which queues of a pool a poller serves.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use marigold_schemas::WorkQueue;
use marigold_store::Store;
use tracing::info;
use uuid::Uuid;

use crate::error::WorkQueueError;

/// How a poller names the queues it wants.
#[derive(Debug, Clone)]
pub enum QueueSelector {
  /// Every queue in the pool.
  All,
  /// Exact names.
  Names(Vec<String>),
  /// Queues whose name starts with any of these.
  Prefixes(Vec<String>),
  /// Queues whose name matches a glob such as `etl-*`.
  Pattern(glob::Pattern),
}

impl QueueSelector {
  pub fn pattern(pattern: &str) -> Result<Self, WorkQueueError> {
    glob::Pattern::new(pattern)
      .map(QueueSelector::Pattern)
      .map_err(|e| WorkQueueError::InvalidPattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
      })
  }

  pub fn matches(&self, name: &str) -> bool {
    match self {
      QueueSelector::All => true,
      QueueSelector::Names(names) => names.iter().any(|n| n == name),
      QueueSelector::Prefixes(prefixes) => prefixes.iter().any(|p| name.starts_with(p.as_str())),
      QueueSelector::Pattern(pattern) => pattern.matches(name),
    }
  }
}

/// Resolves a [`QueueSelector`] against a pool's live queue list.
///
/// Only the matched queue ids are cached, for `ttl`; after that the next call
/// reads the pool again, so queues created or deleted since are picked up
/// without restarting the poller. Queue settings are never cached: callers
/// read each queue fresh before serving it.
pub struct QueueMatcher {
  selector: QueueSelector,
  ttl: Duration,
  refreshed_at: Option<Instant>,
  ids: Vec<Uuid>,
  names: BTreeSet<String>,
}

impl QueueMatcher {
  pub fn new(selector: QueueSelector, ttl: Duration) -> Self {
    Self {
      selector,
      ttl,
      refreshed_at: None,
      ids: Vec::new(),
      names: BTreeSet::new(),
    }
  }

  pub fn selector(&self) -> &QueueSelector {
    &self.selector
  }

  /// Force the next call to [`queue_ids`](Self::queue_ids) to re-read the pool.
  pub fn invalidate(&mut self) {
    self.refreshed_at = None;
  }

  /// Ids of the matching queues in priority order.
  pub async fn queue_ids(
    &mut self,
    store: &dyn Store,
    pool_id: Uuid,
  ) -> Result<&[Uuid], WorkQueueError> {
    let fresh = self
      .refreshed_at
      .is_some_and(|at| at.elapsed() < self.ttl);
    if fresh {
      return Ok(&self.ids);
    }

    let matched: Vec<WorkQueue> = store
      .read_work_queues(pool_id)
      .await?
      .into_iter()
      .filter(|q| self.selector.matches(&q.name))
      .collect();
    let names: BTreeSet<String> = matched.iter().map(|q| q.name.clone()).collect();

    if self.refreshed_at.is_some() {
      let added: Vec<&String> = names.difference(&self.names).collect();
      let removed: Vec<&String> = self.names.difference(&names).collect();
      if !added.is_empty() {
        info!(pool_id = %pool_id, queues = ?added, "work_queues_matched");
      }
      if !removed.is_empty() {
        info!(pool_id = %pool_id, queues = ?removed, "work_queues_no_longer_matched");
      }
    }

    for queue in matched.iter().filter(|q| q.is_paused) {
      info!("Work queue '{}' ({}) is paused.", queue.name, queue.id);
    }

    self.ids = matched.iter().map(|q| q.id).collect();
    self.names = names;
    self.refreshed_at = Some(Instant::now());
    Ok(&self.ids)
  }
}
