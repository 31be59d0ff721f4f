use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum InfrastructureError {
  #[error("failed to prepare job: {0}")]
  Prepare(String),

  #[error("failed to launch job: {0}")]
  Launch(String),

  #[error("failed to kill job: {0}")]
  Kill(String),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
  #[error("run not found: {0}")]
  RunNotFound(Uuid),

  #[error("orchestration error: {0}")]
  Orchestration(#[from] marigold_orchestration::OrchestrationError),

  #[error("work queue error: {0}")]
  WorkQueue(#[from] marigold_work_queues::WorkQueueError),

  #[error("store error: {0}")]
  Store(#[from] marigold_store::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
  #[error("client error: {0}")]
  Client(#[from] ClientError),

  #[error("infrastructure error: {0}")]
  Infrastructure(#[from] InfrastructureError),
}
