//! Inbound message parsing and notification dispatch.

use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::event::HostBridge;

/// Stable tag for the update prompt, so repeated broadcasts replace the
/// previous prompt instead of stacking duplicates.
pub const UPDATE_TAG: &str = "update-available";

/// Body text used when an inbound payload is missing or malformed.
pub const DEFAULT_BODY: &str = "You have a new notification.";

/// Host broadcast command announcing a new deployment.
pub const UPDATE_COMMAND: &str = "update-available";

/// A parsed inbound out-of-band message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
  pub body: String,
  /// Session URL to focus or open when the notification is activated
  pub target: Option<String>,
}

#[derive(Deserialize)]
struct PushPayload {
  body: Option<String>,
  url: Option<String>,
}

impl PushMessage {
  /// Parse an opaque payload.
  ///
  /// Accepts a JSON object with optional `body` and `url` fields, or plain
  /// UTF-8 text used verbatim as the body. Anything else falls back to the
  /// default text; parsing never fails.
  pub fn parse(payload: Option<&[u8]>) -> Self {
    let Some(bytes) = payload else {
      return Self::default_message();
    };

    if let Ok(parsed) = serde_json::from_slice::<PushPayload>(bytes) {
      return Self {
        body: parsed
          .body
          .filter(|b| !b.is_empty())
          .unwrap_or_else(|| DEFAULT_BODY.to_string()),
        target: parsed.url,
      };
    }

    match std::str::from_utf8(bytes) {
      Ok(text) if !text.trim().is_empty() => Self {
        body: text.to_string(),
        target: None,
      },
      _ => Self::default_message(),
    }
  }

  fn default_message() -> Self {
    Self {
      body: DEFAULT_BODY.to_string(),
      target: None,
    }
  }
}

/// Action on a rendered notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationAction {
  /// Focus an existing session for the target, or open a new one
  Open,
  /// Close the notification with no further action
  Dismiss,
}

/// A rendered notification handed to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
  pub title: String,
  pub body: String,
  /// Stable identifier; showing another notification with the same tag
  /// replaces this one
  pub tag: Option<String>,
  /// Session URL opened on activation
  pub target: String,
}

/// Renders inbound messages and update prompts, and routes interaction on
/// them back into the hosting application.
pub struct Dispatcher<B: HostBridge> {
  bridge: Arc<B>,
  title: String,
}

impl<B: HostBridge> Dispatcher<B> {
  pub fn new(bridge: Arc<B>, title: String) -> Self {
    Self { bridge, title }
  }

  /// Render an inbound out-of-band message with open/dismiss actions.
  pub fn on_push(&self, payload: Option<&[u8]>) {
    let message = PushMessage::parse(payload);
    debug!(body = %message.body, "inbound message");

    self.bridge.show_notification(Notification {
      title: self.title.clone(),
      body: message.body,
      tag: None,
      target: message.target.unwrap_or_else(|| "/".to_string()),
    });
  }

  /// Route user interaction on a notification.
  ///
  /// Open (and default activation) focuses an existing session for the
  /// target if one exists, otherwise opens a new one. Dismiss does nothing
  /// further; the host has already closed the notification.
  pub fn on_interaction(&self, action: NotificationAction, target: &str) {
    match action {
      NotificationAction::Open => {
        info!(target = %target, "notification activated");
        self.bridge.focus_or_open_session(target);
      }
      NotificationAction::Dismiss => {
        debug!("notification dismissed");
      }
    }
  }

  /// Handle a host broadcast; only the update command renders a prompt.
  pub fn on_broadcast(&self, command: &str) {
    if command != UPDATE_COMMAND {
      debug!(command = %command, "ignoring unknown broadcast");
      return;
    }

    self.bridge.show_notification(Notification {
      title: self.title.clone(),
      body: "A new version is available. Reload to update.".to_string(),
      tag: Some(UPDATE_TAG.to_string()),
      target: "/".to_string(),
    });
  }
}
