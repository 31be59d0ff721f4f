//! Drains the notification queue filled by the `QueueRunNotifications` rule.
//!
//! Items are popped and sent strictly one at a time, so a failure partway
//! through never re-sends a notification that already went out.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use marigold_config::NotificationSettings;
use marigold_schemas::{NotificationPolicy, QueuedNotification, Run, State};
use marigold_store::Store;
use minijinja::{Environment, Value};
use tracing::{debug, error, info};

use crate::error::ServiceError;
use crate::loop_service::LoopService;

pub const NOTIFICATION_SUBJECT: &str = "Marigold flow run notification";

/// Placeholders a message template may use.
pub const TEMPLATE_KEYS: [&str; 6] = [
  "flow_run_notification_policy_id",
  "flow_run_id",
  "flow_run_name",
  "flow_run_state_name",
  "flow_run_state_message",
  "flow_run_state_timestamp",
];

/// Delivers a rendered notification.
#[async_trait]
pub trait NotificationSender: Send + Sync + 'static {
  async fn send(&self, destination: &str, subject: &str, body: &str) -> Result<(), ServiceError>;
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Default)]
pub struct LogSender;

#[async_trait]
impl NotificationSender for LogSender {
  async fn send(&self, destination: &str, subject: &str, body: &str) -> Result<(), ServiceError> {
    info!(destination, subject, "{}", body);
    Ok(())
  }
}

pub struct FlowRunNotifications {
  store: Arc<dyn Store>,
  sender: Arc<dyn NotificationSender>,
  settings: NotificationSettings,
}

impl FlowRunNotifications {
  pub fn new(
    store: Arc<dyn Store>,
    sender: Arc<dyn NotificationSender>,
    settings: NotificationSettings,
  ) -> Self {
    Self {
      store,
      sender,
      settings,
    }
  }

  /// Send everything queued. Returns how many items were taken off the queue.
  pub async fn drain(&self) -> Result<usize, ServiceError> {
    let mut drained = 0;
    while let Some(notification) = self.store.pop_notification().await? {
      drained += 1;
      if let Err(e) = self.send_notification(&notification).await {
        error!(
          policy_id = %notification.policy_id,
          run_id = %notification.run_id,
          error = %e,
          "Error sending notification for policy {} on flow run {}",
          notification.policy_id,
          notification.run_id
        );
      }
    }
    debug!(count = drained, "notifications_drained");
    Ok(drained)
  }

  async fn send_notification(&self, notification: &QueuedNotification) -> Result<(), ServiceError> {
    let policy = self
      .store
      .read_notification_policies(false)
      .await?
      .into_iter()
      .find(|p| p.id == notification.policy_id);
    let Some(policy) = policy else {
      error!(
        policy_id = %notification.policy_id,
        "Missing notification policy {} for flow run {}",
        notification.policy_id,
        notification.run_id
      );
      return Ok(());
    };

    let run = self.store.read_run(notification.run_id).await?;
    let state = self
      .store
      .read_run_states(run.id)
      .await?
      .into_iter()
      .find(|s| s.id == notification.state_id)
      .or_else(|| run.state.clone());
    let Some(state) = state else {
      error!(run_id = %run.id, "Flow run {} has no state to notify about", run.id);
      return Ok(());
    };

    let body = render_message(policy.template(), &template_context(&policy, &run, &state))?;
    self
      .sender
      .send(&policy.destination, NOTIFICATION_SUBJECT, &body)
      .await?;

    debug!(
      "Successfully sent notification for flow run {} from policy {}",
      run.id, policy.id
    );
    Ok(())
  }
}

#[async_trait]
impl LoopService for FlowRunNotifications {
  fn name(&self) -> &'static str {
    "FlowRunNotifications"
  }

  fn loop_seconds(&self) -> u64 {
    self.settings.loop_seconds
  }

  async fn run_once(&self) -> Result<(), ServiceError> {
    self.drain().await.map(|_| ())
  }
}

fn template_context(
  policy: &NotificationPolicy,
  run: &Run,
  state: &State,
) -> BTreeMap<&'static str, String> {
  BTreeMap::from([
    ("flow_run_notification_policy_id", policy.id.to_string()),
    ("flow_run_id", run.id.to_string()),
    ("flow_run_name", run.name.clone()),
    ("flow_run_state_name", state.name.clone()),
    ("flow_run_state_message", state.message.clone().unwrap_or_default()),
    ("flow_run_state_timestamp", state.timestamp.to_rfc3339()),
  ])
}

/// Render a message template.
///
/// Templates use `{flow_run_name}` style placeholders; jinja expressions such
/// as `{{ flow_run_name | upper }}` work too.
pub fn render_message(
  template: &str,
  context: &BTreeMap<&'static str, String>,
) -> Result<String, ServiceError> {
  let env = Environment::new();
  env
    .render_str(&jinja_placeholders(template), Value::from_serialize(context))
    .map_err(|e| ServiceError::Template(e.to_string()))
}

/// Rewrite `{key}` placeholders for known keys as `{{ key }}`.
fn jinja_placeholders(template: &str) -> String {
  let mut out = String::with_capacity(template.len());
  let mut rest = template;

  while let Some(start) = rest.find('{') {
    out.push_str(&rest[..start]);
    let tail = &rest[start..];

    // Already jinja syntax: copy through the closing delimiter.
    let close = match tail.as_bytes().get(1) {
      Some(b'{') => Some("}}"),
      Some(b'%') => Some("%}"),
      Some(b'#') => Some("#}"),
      _ => None,
    };
    if let Some(close) = close {
      match tail.find(close) {
        Some(end) => {
          out.push_str(&tail[..end + close.len()]);
          rest = &tail[end + close.len()..];
        }
        None => {
          out.push_str(tail);
          rest = "";
        }
      }
      continue;
    }

    match tail[1..].find('}') {
      Some(end) if TEMPLATE_KEYS.contains(&&tail[1..1 + end]) => {
        out.push_str("{{ ");
        out.push_str(&tail[1..1 + end]);
        out.push_str(" }}");
        rest = &tail[end + 2..];
      }
      _ => {
        out.push('{');
        rest = &tail[1..];
      }
    }
  }
  out.push_str(rest);
  out
}
