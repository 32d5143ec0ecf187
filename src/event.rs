//! Host integration surface: events consumed and signals produced.
//!
//! The host drives the worker through [`HostEvent`]s and receives signals
//! back through a [`HostBridge`] implementation it supplies. Handlers are
//! asynchronous; the host awaits completion before considering that
//! lifecycle phase finished.

use color_eyre::Result;
use tokio::sync::oneshot;

use crate::notify::{Notification, NotificationAction};
use crate::origin::{Request, Response};

/// An event delivered by the host environment.
#[derive(Debug)]
pub enum HostEvent {
  /// Install a new static generation from the configured manifest
  Install,
  /// Activate the freshly installed generation pair and retire the rest
  Activate,
  /// An intercepted request; the response is sent back on `reply`
  Fetch {
    request: Request,
    reply: oneshot::Sender<Result<Response>>,
  },
  /// A connectivity/wake signal for queue replay
  Wake { tag: String },
  /// An inbound out-of-band message
  Push { payload: Option<Vec<u8>> },
  /// User interaction on a rendered notification
  NotificationInteraction {
    action: NotificationAction,
    target: String,
  },
  /// A host-broadcast command (e.g. update available)
  Broadcast { command: String },
}

/// Signals the worker produces back into the host environment.
pub trait HostBridge: Send + Sync + 'static {
  /// Ask the host to let this worker take over without waiting for
  /// existing sessions to finish.
  fn take_over_immediately(&self);

  /// Ask the host to route existing sessions through this worker.
  fn claim_active_sessions(&self);

  /// Request a one-shot wake signal for the given tag.
  fn register_wake(&self, tag: &str);

  /// Render a notification. Showing one whose tag matches an already
  /// visible notification replaces it.
  fn show_notification(&self, notification: Notification);

  /// Focus an existing session matching the URL, or open a new one.
  fn focus_or_open_session(&self, url: &str);
}

/// Bridge that discards every signal.
///
/// Used by the ops CLI, where lifecycle phases run without a hosting
/// environment to signal back into.
pub struct NullBridge;

impl HostBridge for NullBridge {
  fn take_over_immediately(&self) {}

  fn claim_active_sessions(&self) {}

  fn register_wake(&self, _tag: &str) {}

  fn show_notification(&self, _notification: Notification) {}

  fn focus_or_open_session(&self, _url: &str) {}
}

/// Bridge that records every signal, for assertions in tests.
#[cfg(test)]
pub struct RecordingBridge {
  signals: std::sync::Mutex<Vec<String>>,
  notifications: std::sync::Mutex<Vec<Notification>>,
  sessions: std::sync::Mutex<Vec<String>>,
  wakes: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl RecordingBridge {
  pub fn new() -> Self {
    Self {
      signals: std::sync::Mutex::new(Vec::new()),
      notifications: std::sync::Mutex::new(Vec::new()),
      sessions: std::sync::Mutex::new(Vec::new()),
      wakes: std::sync::Mutex::new(Vec::new()),
    }
  }

  /// Lifecycle signals in the order they were produced.
  pub fn signals(&self) -> Vec<String> {
    self.signals.lock().unwrap().clone()
  }

  /// Currently visible notifications, after tag replacement.
  pub fn visible(&self) -> Vec<Notification> {
    self.notifications.lock().unwrap().clone()
  }

  pub fn opened_sessions(&self) -> Vec<String> {
    self.sessions.lock().unwrap().clone()
  }

  pub fn registered_wakes(&self) -> Vec<String> {
    self.wakes.lock().unwrap().clone()
  }
}

#[cfg(test)]
impl HostBridge for RecordingBridge {
  fn take_over_immediately(&self) {
    self.signals.lock().unwrap().push("take-over".to_string());
  }

  fn claim_active_sessions(&self) {
    self.signals.lock().unwrap().push("claim".to_string());
  }

  fn register_wake(&self, tag: &str) {
    self.wakes.lock().unwrap().push(tag.to_string());
  }

  fn show_notification(&self, notification: Notification) {
    let mut visible = self.notifications.lock().unwrap();
    // Model the host tray: a matching tag replaces the previous prompt
    if let Some(tag) = &notification.tag {
      visible.retain(|n| n.tag.as_deref() != Some(tag));
    }
    visible.push(notification);
  }

  fn focus_or_open_session(&self, url: &str) {
    self.sessions.lock().unwrap().push(url.to_string());
  }
}
