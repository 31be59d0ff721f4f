use uuid::Uuid;

/// Errors raised by the state transition engine and its rules.
///
/// Rule hooks return these to signal a fault; the engine turns a fault in a
/// before hook into an ABORT outcome rather than surfacing it.
#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
  #[error("run not found: {0}")]
  RunNotFound(Uuid),

  #[error("rule {rule} failed: {message}")]
  RuleFault { rule: String, message: String },

  #[error("store error: {0}")]
  Store(#[from] marigold_store::Error),
}
