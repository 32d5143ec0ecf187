//! Replay of deferred writes with backoff and a bounded attempt budget.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use color_eyre::Result;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::origin::DeliverWrite;

use super::store::{QueueStore, QueuedWrite, WriteStatus};

/// Replay tuning.
#[derive(Debug, Clone)]
pub struct QueueConfig {
  /// Delivery attempts before a write is marked failed
  pub max_attempts: u32,
  /// Base delay for exponential backoff between attempts
  pub backoff_base: Duration,
  /// Upper bound on the backoff delay
  pub backoff_cap: Duration,
  /// Tag used when registering for wake signals
  pub wake_tag: String,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_attempts: 5,
      backoff_base: Duration::from_secs(1),
      backoff_cap: Duration::from_secs(900),
      wake_tag: "deferred-writes".to_string(),
    }
  }
}

/// Outcome of one replay drain.
#[derive(Debug, Default)]
pub struct ReplayReport {
  /// Items acknowledged by the origin and removed, with final attempt counts
  pub delivered: Vec<QueuedWrite>,
  /// Items that failed this attempt and were rescheduled with backoff
  pub deferred: Vec<QueuedWrite>,
  /// Items that exhausted their attempt budget during this drain
  pub failed: Vec<QueuedWrite>,
}

impl ReplayReport {
  /// Whether anything is still awaiting a future attempt.
  pub fn has_deferred(&self) -> bool {
    !self.deferred.is_empty()
  }
}

/// Durable queue of writes awaiting delivery to the origin.
pub struct OfflineQueue<Q: QueueStore> {
  store: Arc<Q>,
  config: QueueConfig,
  /// Serializes drains: queue mutations and status transitions must never
  /// run concurrently, and a wake arriving mid-replay waits here until the
  /// current drain completes.
  drain: Mutex<()>,
}

impl<Q: QueueStore> OfflineQueue<Q> {
  pub fn new(store: Q, config: QueueConfig) -> Self {
    Self {
      store: Arc::new(store),
      config,
      drain: Mutex::new(()),
    }
  }

  pub fn wake_tag(&self) -> &str {
    &self.config.wake_tag
  }

  pub fn store(&self) -> &Arc<Q> {
    &self.store
  }

  /// Queue a write that could not reach the origin.
  ///
  /// The item is persisted before this returns. The id is derived from the
  /// idempotency key, so re-enqueueing the same logical write returns the
  /// existing id instead of creating a second item.
  pub fn enqueue(&self, payload: Vec<u8>, idempotency_key: &str) -> Result<String> {
    let id = write_id(idempotency_key);

    if self.store.get(&id)?.is_some() {
      debug!(id = %id, "write already queued");
      return Ok(id);
    }

    let now = Utc::now();
    let write = QueuedWrite {
      id: id.clone(),
      idempotency_key: idempotency_key.to_string(),
      payload,
      created_at: now,
      attempts: 0,
      next_attempt_at: now,
      status: WriteStatus::Pending,
    };

    self.store.put(&write)?;
    info!(id = %id, "queued deferred write");

    Ok(id)
  }

  /// Deliver due pending items, strictly in creation order, one at a time.
  ///
  /// Each item is marked in-flight for the duration of its attempt. On
  /// success it is removed; on failure it returns to pending with an
  /// incremented attempt count and a backoff deadline, or transitions to
  /// failed once the attempt budget is exhausted.
  pub async fn replay<D: DeliverWrite>(&self, deliverer: &D) -> Result<ReplayReport> {
    let _guard = self.drain.lock().await;

    let now = Utc::now();
    let due: Vec<QueuedWrite> = self
      .store
      .list(WriteStatus::Pending)?
      .into_iter()
      .filter(|w| w.is_due(now))
      .collect();

    let mut report = ReplayReport::default();
    if due.is_empty() {
      return Ok(report);
    }

    info!(items = due.len(), "replaying deferred writes");

    for mut write in due {
      write.status = WriteStatus::InFlight;
      write.attempts += 1;
      self.store.update(&write)?;

      match deliverer
        .deliver_write(&write.payload, &write.idempotency_key)
        .await
      {
        Ok(()) => {
          // Removed only now that the origin has acknowledged it
          write.status = WriteStatus::Done;
          self.store.delete(&write.id)?;
          info!(id = %write.id, attempts = write.attempts, "deferred write delivered");
          report.delivered.push(write);
        }
        Err(e) if write.attempts >= self.config.max_attempts => {
          write.status = WriteStatus::Failed;
          self.store.update(&write)?;
          error!(
            id = %write.id,
            attempts = write.attempts,
            "deferred write failed permanently: {}", e
          );
          report.failed.push(write);
        }
        Err(e) => {
          write.status = WriteStatus::Pending;
          write.next_attempt_at = Utc::now() + self.backoff(write.attempts);
          self.store.update(&write)?;
          warn!(
            id = %write.id,
            attempts = write.attempts,
            next_attempt_at = %write.next_attempt_at,
            "deferred write delivery failed, will retry: {}", e
          );
          report.deferred.push(write);
        }
      }
    }

    Ok(report)
  }

  /// Exponential backoff for the next attempt: `base * 2^(attempts-1)`,
  /// capped.
  fn backoff(&self, attempts: u32) -> ChronoDuration {
    let shift = attempts.saturating_sub(1).min(31);
    let delay = self
      .config
      .backoff_base
      .saturating_mul(1u32 << shift)
      .min(self.config.backoff_cap);

    ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::seconds(900))
  }

  /// Pending items, oldest first.
  pub fn pending(&self) -> Result<Vec<QueuedWrite>> {
    self.store.list(WriteStatus::Pending)
  }

  /// Items that exhausted their attempt budget.
  pub fn failed(&self) -> Result<Vec<QueuedWrite>> {
    self.store.list(WriteStatus::Failed)
  }
}

/// Stable id for a logical write.
fn write_id(idempotency_key: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(idempotency_key.as_bytes());
  hex::encode(hasher.finalize())
}
