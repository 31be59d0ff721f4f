//! The fixed-interval driver every background service runs under.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::ServiceError;

/// One background service: a unit of work repeated on a timer.
#[async_trait]
pub trait LoopService: Send + Sync + 'static {
  fn name(&self) -> &'static str;

  fn loop_seconds(&self) -> u64;

  async fn run_once(&self) -> Result<(), ServiceError>;
}

/// Run one iteration, turning a panic into an error.
pub async fn run_iteration(service: &dyn LoopService) -> Result<(), ServiceError> {
  match AssertUnwindSafe(service.run_once()).catch_unwind().await {
    Ok(result) => result,
    Err(panic) => Err(ServiceError::Panicked(panic_message(&*panic))),
  }
}

/// Repeat `service` every `loop_seconds` until `cancel` fires.
///
/// A failed iteration is logged and the loop carries on.
pub async fn run_loop(service: Arc<dyn LoopService>, cancel: CancellationToken) {
  let period = Duration::from_secs(service.loop_seconds().max(1));
  let mut interval = tokio::time::interval(period);
  interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

  info!(service = service.name(), loop_seconds = period.as_secs(), "starting service");

  loop {
    tokio::select! {
      _ = cancel.cancelled() => {
        info!(service = service.name(), "service stopped");
        break;
      }
      _ = interval.tick() => {
        if let Err(e) = run_iteration(service.as_ref()).await {
          error!(service = service.name(), error = %e, "service_iteration_failed");
        }
      }
    }
  }
}

/// Start every service on its own task, all stopped by `cancel`.
pub fn spawn_services(
  services: Vec<Arc<dyn LoopService>>,
  cancel: &CancellationToken,
) -> JoinSet<()> {
  let mut tasks = JoinSet::new();
  for service in services {
    tasks.spawn(run_loop(service, cancel.child_token()));
  }
  tasks
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
  if let Some(s) = panic.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = panic.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic".to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  struct Flaky {
    calls: AtomicUsize,
  }

  #[async_trait]
  impl LoopService for Flaky {
    fn name(&self) -> &'static str {
      "flaky"
    }

    fn loop_seconds(&self) -> u64 {
      1
    }

    async fn run_once(&self) -> Result<(), ServiceError> {
      match self.calls.fetch_add(1, Ordering::SeqCst) {
        0 => Err(ServiceError::Notification("down".into())),
        1 => panic!("boom"),
        _ => Ok(()),
      }
    }
  }

  #[tokio::test]
  async fn test_iteration_errors_and_panics_are_contained() {
    let service = Flaky {
      calls: AtomicUsize::new(0),
    };
    assert!(matches!(
      run_iteration(&service).await,
      Err(ServiceError::Notification(_))
    ));
    match run_iteration(&service).await {
      Err(ServiceError::Panicked(message)) => assert_eq!(message, "boom"),
      other => panic!("expected a contained panic, got {:?}", other),
    }
    assert!(run_iteration(&service).await.is_ok());
  }

  #[tokio::test(start_paused = true)]
  async fn test_loop_keeps_running_after_failures() {
    let service = Arc::new(Flaky {
      calls: AtomicUsize::new(0),
    });
    let cancel = CancellationToken::new();
    let mut tasks = spawn_services(vec![service.clone() as Arc<dyn LoopService>], &cancel);

    tokio::time::sleep(Duration::from_millis(3500)).await;
    cancel.cancel();
    while tasks.join_next().await.is_some() {}

    assert!(service.calls.load(Ordering::SeqCst) >= 3);
  }
}
