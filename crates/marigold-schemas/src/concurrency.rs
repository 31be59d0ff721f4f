use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A tag-scoped cap on concurrently RUNNING task runs.
///
/// `active_slots` holds the ids of runs currently borrowing a slot; an id
/// appears at most once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyLimit {
  pub id: Uuid,
  pub tag: String,
  pub limit: u32,
  #[serde(default)]
  pub active_slots: Vec<Uuid>,
  pub created: DateTime<Utc>,
}

impl ConcurrencyLimit {
  pub fn new(tag: impl Into<String>, limit: u32) -> Self {
    Self {
      id: Uuid::new_v4(),
      tag: tag.into(),
      limit,
      active_slots: Vec::new(),
      created: Utc::now(),
    }
  }

  pub fn holds(&self, run_id: Uuid) -> bool {
    self.active_slots.contains(&run_id)
  }

  /// Whether `run_id` could take a slot now (true if it already holds one).
  pub fn has_room_for(&self, run_id: Uuid) -> bool {
    self.holds(run_id) || (self.active_slots.len() as u64) < u64::from(self.limit)
  }
}
