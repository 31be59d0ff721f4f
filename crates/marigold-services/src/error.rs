#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
  #[error("store error: {0}")]
  Store(#[from] marigold_store::Error),

  #[error("orchestration error: {0}")]
  Orchestration(#[from] marigold_orchestration::OrchestrationError),

  #[error("schedule error: {0}")]
  Schedule(#[from] marigold_schemas::ScheduleError),

  #[error("failed to render notification: {0}")]
  Template(String),

  #[error("failed to send notification: {0}")]
  Notification(String),

  #[error("service panicked: {0}")]
  Panicked(String),
}
