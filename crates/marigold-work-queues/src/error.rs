#[derive(Debug, thiserror::Error)]
pub enum WorkQueueError {
  #[error("work pool not found: {0}")]
  PoolNotFound(String),

  #[error("work queue not found: {0}")]
  QueueNotFound(String),

  #[error("invalid queue pattern '{pattern}': {message}")]
  InvalidPattern { pattern: String, message: String },

  #[error("store error: {0}")]
  Store(#[from] marigold_store::Error),
}
