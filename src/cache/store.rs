//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use crate::origin::{CacheEntry, CacheKey};

/// Trait for cache storage backends.
///
/// Entries are grouped by generation name; deleting a generation removes
/// every entry stored under it.
pub trait CacheStore: Send + Sync {
  /// Store an entry under a generation.
  fn put(&self, generation: &str, key: &CacheKey, entry: &CacheEntry) -> Result<()>;

  /// Look up an entry by exact key.
  fn get(&self, generation: &str, key: &CacheKey) -> Result<Option<CacheEntry>>;

  /// Delete a generation and everything stored under it.
  fn delete_generation(&self, generation: &str) -> Result<()>;

  /// Names of all generations with at least one entry.
  fn list_generations(&self) -> Result<Vec<String>>;

  /// Number of entries in a generation.
  fn count(&self, generation: &str) -> Result<u64>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteCacheStore {
  conn: Mutex<Connection>,
}

/// Schema for the cache table.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    generation TEXT NOT NULL,
    entry_key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers BLOB NOT NULL,
    body BLOB NOT NULL,
    inserted_at TEXT NOT NULL,
    PRIMARY KEY (generation, entry_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_generation
    ON cache_entries(generation);
"#;

impl SqliteCacheStore {
  /// Open (or create) the cache database at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open an in-memory cache database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }
}

impl CacheStore for SqliteCacheStore {
  fn put(&self, generation: &str, key: &CacheKey, entry: &CacheEntry) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let headers = serde_json::to_vec(&entry.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries
           (generation, entry_key, method, url, status, headers, body, inserted_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
          generation,
          key.storage_key(),
          key.method.as_str(),
          key.url,
          entry.status,
          headers,
          entry.body,
          entry.inserted_at.to_rfc3339(),
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    Ok(())
  }

  fn get(&self, generation: &str, key: &CacheKey) -> Result<Option<CacheEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT status, headers, body, inserted_at FROM cache_entries
         WHERE generation = ? AND entry_key = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<(u16, Vec<u8>, Vec<u8>, String)> = stmt
      .query_row(params![generation, key.storage_key()], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .ok();

    match row {
      Some((status, headers, body, inserted_at)) => {
        let headers: Vec<(String, String)> = serde_json::from_slice(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;

        Ok(Some(CacheEntry {
          status,
          headers,
          body,
          inserted_at: parse_datetime(&inserted_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn delete_generation(&self, generation: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "DELETE FROM cache_entries WHERE generation = ?",
        params![generation],
      )
      .map_err(|e| eyre!("Failed to delete generation {}: {}", generation, e))?;

    Ok(())
  }

  fn list_generations(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT DISTINCT generation FROM cache_entries ORDER BY generation")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list generations: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(names)
  }

  fn count(&self, generation: &str) -> Result<u64> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let count: u64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE generation = ?",
        params![generation],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count generation {}: {}", generation, e))?;

    Ok(count)
  }
}

/// In-memory cache storage, used in tests.
#[derive(Default)]
pub struct MemoryCacheStore {
  generations: Mutex<HashMap<String, HashMap<String, CacheEntry>>>,
}

impl MemoryCacheStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl CacheStore for MemoryCacheStore {
  fn put(&self, generation: &str, key: &CacheKey, entry: &CacheEntry) -> Result<()> {
    let mut generations = self
      .generations
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    generations
      .entry(generation.to_string())
      .or_default()
      .insert(key.storage_key(), entry.clone());

    Ok(())
  }

  fn get(&self, generation: &str, key: &CacheKey) -> Result<Option<CacheEntry>> {
    let generations = self
      .generations
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    Ok(
      generations
        .get(generation)
        .and_then(|entries| entries.get(&key.storage_key()))
        .cloned(),
    )
  }

  fn delete_generation(&self, generation: &str) -> Result<()> {
    let mut generations = self
      .generations
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    generations.remove(generation);
    Ok(())
  }

  fn list_generations(&self) -> Result<Vec<String>> {
    let generations = self
      .generations
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut names: Vec<String> = generations
      .iter()
      .filter(|(_, entries)| !entries.is_empty())
      .map(|(name, _)| name.clone())
      .collect();
    names.sort();

    Ok(names)
  }

  fn count(&self, generation: &str) -> Result<u64> {
    let generations = self
      .generations
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    Ok(
      generations
        .get(generation)
        .map(|entries| entries.len() as u64)
        .unwrap_or(0),
    )
  }
}

/// Parse an RFC 3339 datetime stored in SQLite.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::origin::{Method, Response};

  fn entry(body: &[u8]) -> CacheEntry {
    CacheEntry::from_response(&Response {
      status: 200,
      headers: vec![("content-type".to_string(), "text/plain".to_string())],
      body: body.to_vec(),
    })
  }

  fn key(url: &str) -> CacheKey {
    CacheKey {
      method: Method::Get,
      url: url.to_string(),
    }
  }

  fn check_store<S: CacheStore>(store: S) {
    let k = key("https://a.example/x");

    assert!(store.get("static-v1", &k).unwrap().is_none());

    store.put("static-v1", &k, &entry(b"hello")).unwrap();
    let got = store.get("static-v1", &k).unwrap().unwrap();
    assert_eq!(got.body, b"hello");
    assert_eq!(got.status, 200);

    // Same key, different generation: independent
    assert!(store.get("dynamic-v1", &k).unwrap().is_none());
    store.put("dynamic-v1", &k, &entry(b"other")).unwrap();

    let mut names = store.list_generations().unwrap();
    names.sort();
    assert_eq!(names, vec!["dynamic-v1", "static-v1"]);
    assert_eq!(store.count("static-v1").unwrap(), 1);

    store.delete_generation("static-v1").unwrap();
    assert!(store.get("static-v1", &k).unwrap().is_none());
    assert_eq!(store.list_generations().unwrap(), vec!["dynamic-v1"]);

    // Entry in the surviving generation is untouched
    assert_eq!(
      store.get("dynamic-v1", &k).unwrap().unwrap().body,
      b"other"
    );
  }

  #[test]
  fn sqlite_store_round_trip() {
    check_store(SqliteCacheStore::open_in_memory().unwrap());
  }

  #[test]
  fn memory_store_round_trip() {
    check_store(MemoryCacheStore::new());
  }

  #[test]
  fn put_replaces_existing_entry() {
    let store = SqliteCacheStore::open_in_memory().unwrap();
    let k = key("https://a.example/x");

    store.put("dynamic-v1", &k, &entry(b"old")).unwrap();
    store.put("dynamic-v1", &k, &entry(b"new")).unwrap();

    assert_eq!(store.get("dynamic-v1", &k).unwrap().unwrap().body, b"new");
    assert_eq!(store.count("dynamic-v1").unwrap(), 1);
  }

  #[test]
  fn inserted_at_survives_round_trip() {
    let store = SqliteCacheStore::open_in_memory().unwrap();
    let k = key("https://a.example/x");
    let e = entry(b"x");

    store.put("static-v1", &k, &e).unwrap();
    let got = store.get("static-v1", &k).unwrap().unwrap();
    assert_eq!(got.inserted_at.timestamp(), e.inserted_at.timestamp());
  }
}
