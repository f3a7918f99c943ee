//! Push notification payloads and click handling.

use serde::{Deserialize, Serialize};

pub const VIEW_ACTION: &str = "view";
pub const DISMISS_ACTION: &str = "dismiss";

const DEFAULT_TITLE: &str = "Stride Training";
const DEFAULT_BODY: &str = "You have a new training update";
const DEFAULT_URL: &str = "/";
const ICON: &str = "/static/icons/icon-192.png";

/// Incoming push payload: `{title, body, url}`, every field optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PushPayload {
  pub title: Option<String>,
  pub body: Option<String>,
  pub url: Option<String>,
}

impl PushPayload {
  /// Parse raw push data. Missing or malformed data yields the defaults.
  pub fn parse(data: Option<&[u8]>) -> Self {
    data
      .and_then(|bytes| serde_json::from_slice(bytes).ok())
      .unwrap_or_default()
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
}

/// A system notification to display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub actions: Vec<NotificationAction>,
  /// Page opened by the view action
  pub url: String,
}

impl Notification {
  pub fn from_payload(payload: PushPayload) -> Self {
    Self {
      title: payload.title.unwrap_or_else(|| DEFAULT_TITLE.to_string()),
      body: payload.body.unwrap_or_else(|| DEFAULT_BODY.to_string()),
      icon: ICON.to_string(),
      actions: vec![
        NotificationAction {
          action: VIEW_ACTION.to_string(),
          title: "View".to_string(),
        },
        NotificationAction {
          action: DISMISS_ACTION.to_string(),
          title: "Dismiss".to_string(),
        },
      ],
      url: payload
        .url
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| DEFAULT_URL.to_string()),
    }
  }
}

/// What the host should do after a notification click.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
  /// Bring an already-open client to the front
  Focus { client_id: String },
  /// Open a new window at the URL
  Open { url: String },
  None,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_payload_fields_flow_into_notification() {
    let payload = PushPayload::parse(Some(
      br#"{"title":"Workout synced","body":"6x400m logged","url":"/training_log"}"#,
    ));
    let notification = Notification::from_payload(payload);
    assert_eq!(notification.title, "Workout synced");
    assert_eq!(notification.body, "6x400m logged");
    assert_eq!(notification.url, "/training_log");
    assert!(notification.actions.iter().any(|a| a.action == VIEW_ACTION));
  }

  #[test]
  fn test_url_defaults_to_root() {
    let payload = PushPayload::parse(Some(br#"{"title":"Hi"}"#.as_slice()));
    let notification = Notification::from_payload(payload);
    assert_eq!(notification.url, "/");
    assert_eq!(notification.title, "Hi");
  }

  #[test]
  fn test_malformed_payload_uses_defaults() {
    let notification = Notification::from_payload(PushPayload::parse(Some(b"not json".as_slice())));
    assert_eq!(notification.title, DEFAULT_TITLE);
    assert_eq!(notification.url, "/");

    let empty = Notification::from_payload(PushPayload::parse(None));
    assert_eq!(empty, notification);
  }
}
