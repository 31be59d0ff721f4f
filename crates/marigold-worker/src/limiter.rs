use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

/// Bounds how many runs a worker has in flight at once.
///
/// Tokens are borrowed on behalf of a run id. Borrowing twice for the same id
/// holds one token, and releasing an id that holds nothing is a no-op, so
/// error paths can release unconditionally.
pub struct Limiter {
  limit: usize,
  semaphore: Arc<Semaphore>,
  held: Mutex<HashMap<Uuid, OwnedSemaphorePermit>>,
}

impl Limiter {
  pub fn new(limit: usize) -> Self {
    Self {
      limit,
      semaphore: Arc::new(Semaphore::new(limit)),
      held: Mutex::new(HashMap::new()),
    }
  }

  pub fn limit(&self) -> usize {
    self.limit
  }

  pub fn borrowed_tokens(&self) -> usize {
    self.held().len()
  }

  pub fn available_tokens(&self) -> usize {
    self.semaphore.available_permits()
  }

  /// Borrow a token for `run_id`, waiting for one to free up.
  pub async fn acquire_on_behalf_of(&self, run_id: Uuid) {
    if self.held().contains_key(&run_id) {
      return;
    }
    // The semaphore is never closed.
    let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
      return;
    };
    self.held().entry(run_id).or_insert(permit);
  }

  /// Borrow a token for `run_id` if one is free right now.
  pub fn try_acquire_on_behalf_of(&self, run_id: Uuid) -> bool {
    let mut held = self.held();
    if held.contains_key(&run_id) {
      return true;
    }
    match self.semaphore.clone().try_acquire_owned() {
      Ok(permit) => {
        held.insert(run_id, permit);
        true
      }
      Err(_) => false,
    }
  }

  pub fn release_on_behalf_of(&self, run_id: Uuid) {
    self.held().remove(&run_id);
  }

  fn held(&self) -> MutexGuard<'_, HashMap<Uuid, OwnedSemaphorePermit>> {
    self.held.lock().unwrap_or_else(PoisonError::into_inner)
  }
}
