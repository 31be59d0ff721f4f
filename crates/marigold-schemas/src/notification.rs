use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Template used when a policy does not supply its own.
pub const DEFAULT_MESSAGE_TEMPLATE: &str =
  "Flow run {flow_run_name} with id {flow_run_id} entered state {flow_run_state_name}.";

/// Sends a message when a flow run enters one of the listed states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPolicy {
  pub id: Uuid,
  pub is_active: bool,
  /// State names (not types) that trigger the policy, e.g. "Late".
  pub state_names: Vec<String>,
  /// When non-empty, the run must carry at least one of these tags.
  #[serde(default)]
  pub tags: Vec<String>,
  pub message_template: Option<String>,
  /// Where the sender delivers the message.
  pub destination: String,
}

impl NotificationPolicy {
  pub fn new<I, S>(state_names: I, destination: impl Into<String>) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      id: Uuid::new_v4(),
      is_active: true,
      state_names: state_names.into_iter().map(Into::into).collect(),
      tags: Vec::new(),
      message_template: None,
      destination: destination.into(),
    }
  }

  pub fn matches(&self, state_name: &str, run_tags: &[String]) -> bool {
    self.is_active
      && self.state_names.iter().any(|n| n == state_name)
      && (self.tags.is_empty() || self.tags.iter().any(|t| run_tags.contains(t)))
  }

  pub fn template(&self) -> &str {
    self
      .message_template
      .as_deref()
      .unwrap_or(DEFAULT_MESSAGE_TEMPLATE)
  }
}

/// A pending notification waiting for the drain loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedNotification {
  pub id: Uuid,
  pub policy_id: Uuid,
  pub run_id: Uuid,
  pub state_id: Uuid,
  pub enqueued_at: DateTime<Utc>,
}

impl QueuedNotification {
  pub fn new(policy_id: Uuid, run_id: Uuid, state_id: Uuid) -> Self {
    Self {
      id: Uuid::new_v4(),
      policy_id,
      run_id,
      state_id,
      enqueued_at: Utc::now(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_matches_state_name_and_tags() {
    let mut policy = NotificationPolicy::new(["Failed", "Late"], "ops");
    assert!(policy.matches("Late", &[]));
    assert!(!policy.matches("Completed", &[]));

    policy.tags = vec!["prod".into()];
    assert!(!policy.matches("Failed", &["dev".to_string()]));
    assert!(policy.matches("Failed", &["dev".to_string(), "prod".to_string()]));

    policy.is_active = false;
    assert!(!policy.matches("Failed", &["prod".to_string()]));
  }

  #[test]
  fn test_template_falls_back_to_default() {
    let mut policy = NotificationPolicy::new(["Failed"], "ops");
    assert_eq!(policy.template(), DEFAULT_MESSAGE_TEMPLATE);
    policy.message_template = Some("{flow_run_name} failed".into());
    assert_eq!(policy.template(), "{flow_run_name} failed");
  }
}
