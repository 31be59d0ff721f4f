use thiserror::Error;

/// Errors raised while evaluating a schedule definition.
#[derive(Debug, Error)]
pub enum ScheduleError {
  #[error("invalid cron expression '{expression}': {message}")]
  InvalidCron { expression: String, message: String },

  #[error("interval must be between 1 and {} seconds", i64::MAX / 1000)]
  InvalidInterval,
}
