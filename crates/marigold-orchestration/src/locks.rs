use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// In-process per-run mutual exclusion.
///
/// Proposals for the same run are evaluated one at a time; the guard is
/// held from reading the initial state until after commit. The store's
/// compare-and-swap covers writers outside this process.
#[derive(Default)]
pub struct RunLocks {
  locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

pub struct RunLockGuard {
  _guard: OwnedMutexGuard<()>,
}

impl RunLocks {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn lock(&self, run_id: Uuid) -> RunLockGuard {
    let lock = {
      let mut locks = self.locks.lock().await;
      // Drop entries nobody is holding or waiting on.
      locks.retain(|id, lock| *id == run_id || Arc::strong_count(lock) > 1);
      locks.entry(run_id).or_default().clone()
    };
    RunLockGuard {
      _guard: lock.lock_owned().await,
    }
  }

  pub async fn tracked(&self) -> usize {
    self.locks.lock().await.len()
  }
}
