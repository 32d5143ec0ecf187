//! Queue storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

/// Delivery state of a queued write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
  /// Waiting for a delivery attempt
  Pending,
  /// A delivery attempt is underway
  InFlight,
  /// Acknowledged by the origin
  Done,
  /// Attempt budget exhausted; excluded from automatic replay
  Failed,
}

impl WriteStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::InFlight => "in-flight",
      Self::Done => "done",
      Self::Failed => "failed",
    }
  }

  fn parse(s: &str) -> Result<Self> {
    match s {
      "pending" => Ok(Self::Pending),
      "in-flight" => Ok(Self::InFlight),
      "done" => Ok(Self::Done),
      "failed" => Ok(Self::Failed),
      other => Err(eyre!("Unknown write status '{}'", other)),
    }
  }
}

/// A deferred write awaiting delivery to the origin.
#[derive(Debug, Clone)]
pub struct QueuedWrite {
  pub id: String,
  pub idempotency_key: String,
  pub payload: Vec<u8>,
  pub created_at: DateTime<Utc>,
  pub attempts: u32,
  pub next_attempt_at: DateTime<Utc>,
  pub status: WriteStatus,
}

impl QueuedWrite {
  /// Whether this item is due for a delivery attempt.
  pub fn is_due(&self, now: DateTime<Utc>) -> bool {
    self.next_attempt_at <= now
  }
}

/// Trait for durable queue storage backends.
///
/// Implementations must be crash-safe: an item put here survives process
/// termination and reappears in `list` after a restart.
pub trait QueueStore: Send + Sync {
  /// Persist a new item.
  fn put(&self, write: &QueuedWrite) -> Result<()>;

  /// Persist updated state (status, attempts, backoff deadline) for an item.
  fn update(&self, write: &QueuedWrite) -> Result<()>;

  /// Remove an item.
  fn delete(&self, id: &str) -> Result<()>;

  /// Get a single item by id.
  fn get(&self, id: &str) -> Result<Option<QueuedWrite>>;

  /// All items with the given status, oldest creation first.
  fn list(&self, status: WriteStatus) -> Result<Vec<QueuedWrite>>;
}

/// SQLite-based queue storage implementation.
pub struct SqliteQueueStore {
  conn: Mutex<Connection>,
}

/// Schema for the queue table.
const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS queued_writes (
    id TEXT PRIMARY KEY,
    idempotency_key TEXT NOT NULL,
    payload BLOB NOT NULL,
    created_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    next_attempt_at TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending'
);

CREATE INDEX IF NOT EXISTS idx_queued_writes_status
    ON queued_writes(status, created_at);
"#;

impl SqliteQueueStore {
  /// Open (or create) the queue database at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create queue directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open queue database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open an in-memory queue database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory queue database: {}", e))?;

    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(QUEUE_SCHEMA)
      .map_err(|e| eyre!("Failed to run queue migrations: {}", e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.recover()?;

    Ok(store)
  }

  /// Return any in-flight rows to pending.
  ///
  /// A row can only be in-flight while a process is mid-attempt, so finding
  /// one at open time means the previous process died before recording the
  /// outcome.
  fn recover(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "UPDATE queued_writes SET status = 'pending' WHERE status = 'in-flight'",
        [],
      )
      .map_err(|e| eyre!("Failed to recover in-flight writes: {}", e))?;

    Ok(())
  }
}

impl SqliteQueueStore {
  fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
      id: row.get(0)?,
      idempotency_key: row.get(1)?,
      payload: row.get(2)?,
      created_at: row.get(3)?,
      attempts: row.get(4)?,
      next_attempt_at: row.get(5)?,
      status: row.get(6)?,
    })
  }
}

struct RawRow {
  id: String,
  idempotency_key: String,
  payload: Vec<u8>,
  created_at: String,
  attempts: u32,
  next_attempt_at: String,
  status: String,
}

impl RawRow {
  fn into_write(self) -> Result<QueuedWrite> {
    Ok(QueuedWrite {
      id: self.id,
      idempotency_key: self.idempotency_key,
      payload: self.payload,
      created_at: parse_datetime(&self.created_at)?,
      attempts: self.attempts,
      next_attempt_at: parse_datetime(&self.next_attempt_at)?,
      status: WriteStatus::parse(&self.status)?,
    })
  }
}

impl QueueStore for SqliteQueueStore {
  fn put(&self, write: &QueuedWrite) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT INTO queued_writes
           (id, idempotency_key, payload, created_at, attempts, next_attempt_at, status)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
          write.id,
          write.idempotency_key,
          write.payload,
          write.created_at.to_rfc3339(),
          write.attempts,
          write.next_attempt_at.to_rfc3339(),
          write.status.as_str(),
        ],
      )
      .map_err(|e| eyre!("Failed to persist queued write: {}", e))?;

    Ok(())
  }

  fn update(&self, write: &QueuedWrite) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "UPDATE queued_writes
         SET attempts = ?, next_attempt_at = ?, status = ?
         WHERE id = ?",
        params![
          write.attempts,
          write.next_attempt_at.to_rfc3339(),
          write.status.as_str(),
          write.id,
        ],
      )
      .map_err(|e| eyre!("Failed to update queued write: {}", e))?;

    Ok(())
  }

  fn delete(&self, id: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM queued_writes WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete queued write: {}", e))?;

    Ok(())
  }

  fn get(&self, id: &str) -> Result<Option<QueuedWrite>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT id, idempotency_key, payload, created_at, attempts, next_attempt_at, status
         FROM queued_writes WHERE id = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let raw = stmt.query_row(params![id], Self::read_row).ok();

    match raw {
      Some(raw) => Ok(Some(raw.into_write()?)),
      None => Ok(None),
    }
  }

  fn list(&self, status: WriteStatus) -> Result<Vec<QueuedWrite>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT id, idempotency_key, payload, created_at, attempts, next_attempt_at, status
         FROM queued_writes WHERE status = ? ORDER BY created_at, id",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<RawRow> = stmt
      .query_map(params![status.as_str()], Self::read_row)
      .map_err(|e| eyre!("Failed to list queued writes: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    rows.into_iter().map(RawRow::into_write).collect()
  }
}

/// In-memory queue storage, used in tests.
#[derive(Default)]
pub struct MemoryQueueStore {
  writes: Mutex<HashMap<String, QueuedWrite>>,
}

impl MemoryQueueStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl QueueStore for MemoryQueueStore {
  fn put(&self, write: &QueuedWrite) -> Result<()> {
    let mut writes = self
      .writes
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    if writes.contains_key(&write.id) {
      return Err(eyre!("Duplicate queued write id {}", write.id));
    }
    writes.insert(write.id.clone(), write.clone());

    Ok(())
  }

  fn update(&self, write: &QueuedWrite) -> Result<()> {
    let mut writes = self
      .writes
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    writes.insert(write.id.clone(), write.clone());
    Ok(())
  }

  fn delete(&self, id: &str) -> Result<()> {
    let mut writes = self
      .writes
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    writes.remove(id);
    Ok(())
  }

  fn get(&self, id: &str) -> Result<Option<QueuedWrite>> {
    let writes = self
      .writes
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    Ok(writes.get(id).cloned())
  }

  fn list(&self, status: WriteStatus) -> Result<Vec<QueuedWrite>> {
    let writes = self
      .writes
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut items: Vec<QueuedWrite> = writes
      .values()
      .filter(|w| w.status == status)
      .cloned()
      .collect();
    items.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));

    Ok(items)
  }
}

/// Parse an RFC 3339 datetime stored in SQLite.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
