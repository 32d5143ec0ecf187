//! Registry of named, versioned cache generations.
//!
//! At most one generation is active per purpose (static/dynamic) at a time.
//! Lookups take a per-generation read guard so retirement can wait for
//! in-flight readers; a generation flagged retiring is never opened for a
//! new reader.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;

use crate::origin::{CacheEntry, CacheKey};

use super::store::CacheStore;

/// What a generation is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
  /// Populated atomically at install time from a fixed manifest
  Static,
  /// Populated incrementally at runtime from live responses
  Dynamic,
}

impl Purpose {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Static => "static",
      Self::Dynamic => "dynamic",
    }
  }
}

/// A named, versioned cache generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GenerationId {
  pub purpose: Purpose,
  pub version: String,
}

impl GenerationId {
  pub fn new(purpose: Purpose, version: &str) -> Self {
    Self {
      purpose,
      version: version.to_string(),
    }
  }

  pub fn new_static(version: &str) -> Self {
    Self::new(Purpose::Static, version)
  }

  pub fn new_dynamic(version: &str) -> Self {
    Self::new(Purpose::Dynamic, version)
  }

  /// Storage name, e.g. `static-v1`.
  pub fn name(&self) -> String {
    format!("{}-{}", self.purpose.as_str(), self.version)
  }
}

impl fmt::Display for GenerationId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.name())
  }
}

/// Shared per-generation state for reader tracking and retirement.
struct GenerationHandle {
  readers: AtomicUsize,
  retiring: AtomicBool,
}

impl GenerationHandle {
  fn new() -> Self {
    Self {
      readers: AtomicUsize::new(0),
      retiring: AtomicBool::new(false),
    }
  }

  /// Begin a read against a generation.
  ///
  /// Returns `None` if the generation is retiring; once a guard is handed
  /// out, retirement waits for it to drop.
  fn begin_read(handle: &Arc<GenerationHandle>) -> Option<ReadGuard> {
    handle.readers.fetch_add(1, Ordering::AcqRel);
    if handle.retiring.load(Ordering::Acquire) {
      handle.readers.fetch_sub(1, Ordering::AcqRel);
      return None;
    }
    Some(ReadGuard {
      handle: Arc::clone(handle),
    })
  }
}

/// RAII guard keeping a generation alive while a lookup reads from it.
struct ReadGuard {
  handle: Arc<GenerationHandle>,
}

impl Drop for ReadGuard {
  fn drop(&mut self) {
    self.handle.readers.fetch_sub(1, Ordering::AcqRel);
  }
}

struct Inner {
  /// Handles by generation name
  generations: HashMap<String, Arc<GenerationHandle>>,
  /// Active generation name per purpose
  active: HashMap<Purpose, GenerationId>,
}

/// Registry owning the generation table and the active pair.
pub struct Registry<S: CacheStore> {
  store: Arc<S>,
  inner: RwLock<Inner>,
}

impl<S: CacheStore> Registry<S> {
  pub fn new(store: S) -> Self {
    Self {
      store: Arc::new(store),
      inner: RwLock::new(Inner {
        generations: HashMap::new(),
        active: HashMap::new(),
      }),
    }
  }

  pub fn store(&self) -> &Arc<S> {
    &self.store
  }

  /// Register a generation so readers can be tracked against it.
  pub fn register(&self, id: &GenerationId) -> Result<()> {
    let mut inner = self
      .inner
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    inner
      .generations
      .entry(id.name())
      .or_insert_with(|| Arc::new(GenerationHandle::new()));

    Ok(())
  }

  /// Make the given pair the active generations.
  pub fn activate(&self, static_id: &GenerationId, dynamic_id: &GenerationId) -> Result<()> {
    self.register(static_id)?;
    self.register(dynamic_id)?;

    let mut inner = self
      .inner
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    inner.active.insert(Purpose::Static, static_id.clone());
    inner.active.insert(Purpose::Dynamic, dynamic_id.clone());

    Ok(())
  }

  /// The active generation for a purpose, if one has been activated.
  pub fn active(&self, purpose: Purpose) -> Result<Option<GenerationId>> {
    let inner = self
      .inner
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    Ok(inner.active.get(&purpose).cloned())
  }

  /// Look up an entry in the active generation for a purpose.
  ///
  /// Returns `None` on miss, when no generation is active, or when the
  /// active generation is mid-retirement.
  pub fn lookup(&self, purpose: Purpose, key: &CacheKey) -> Result<Option<CacheEntry>> {
    let (name, handle) = {
      let inner = self
        .inner
        .read()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;

      let Some(id) = inner.active.get(&purpose) else {
        return Ok(None);
      };
      let name = id.name();
      let Some(handle) = inner.generations.get(&name) else {
        return Ok(None);
      };
      (name, Arc::clone(handle))
    };

    let Some(_guard) = GenerationHandle::begin_read(&handle) else {
      return Ok(None);
    };

    self.store.get(&name, key)
  }

  /// Store an entry into the active generation for a purpose.
  pub fn put(&self, purpose: Purpose, key: &CacheKey, entry: &CacheEntry) -> Result<()> {
    let Some(id) = self.active(purpose)? else {
      return Err(eyre!("No active {} generation", purpose.as_str()));
    };

    self.store.put(&id.name(), key, entry)
  }

  /// All generation names known to the registry or present in the store.
  pub fn known_generations(&self) -> Result<Vec<String>> {
    let mut names = self.store.list_generations()?;

    let inner = self
      .inner
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    for name in inner.generations.keys() {
      if !names.contains(name) {
        names.push(name.clone());
      }
    }
    names.sort();

    Ok(names)
  }

  /// Retire a generation: flag it so no new reader opens it, wait for
  /// in-flight readers to finish, then delete its entries.
  pub async fn retire(&self, name: &str) -> Result<()> {
    let handle = {
      let inner = self
        .inner
        .read()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;
      inner.generations.get(name).cloned()
    };

    if let Some(handle) = handle {
      handle.retiring.store(true, Ordering::Release);

      // Wait out readers that started before the flag was set
      while handle.readers.load(Ordering::Acquire) > 0 {
        tokio::time::sleep(Duration::from_millis(2)).await;
      }

      let mut inner = self
        .inner
        .write()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;
      inner.generations.remove(name);
    }

    debug!(generation = name, "deleting retired generation");
    self.store.delete_generation(name)
  }

  #[cfg(test)]
  pub(crate) fn reader_probe(&self, name: &str) -> Option<impl Drop> {
    let inner = self.inner.read().unwrap();
    let handle = inner.generations.get(name)?;
    GenerationHandle::begin_read(handle)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::store::MemoryCacheStore;
  use crate::origin::{CacheEntry, Method, Response};
  use std::time::Duration;

  fn key(url: &str) -> CacheKey {
    CacheKey {
      method: Method::Get,
      url: url.to_string(),
    }
  }

  fn entry(body: &[u8]) -> CacheEntry {
    CacheEntry::from_response(&Response {
      status: 200,
      headers: Vec::new(),
      body: body.to_vec(),
    })
  }

  fn registry_with_active_pair() -> Registry<MemoryCacheStore> {
    let registry = Registry::new(MemoryCacheStore::new());
    registry
      .activate(
        &GenerationId::new_static("v1"),
        &GenerationId::new_dynamic("v1"),
      )
      .unwrap();
    registry
  }

  #[test]
  fn generation_name_includes_purpose_and_version() {
    assert_eq!(GenerationId::new_static("v2").name(), "static-v2");
    assert_eq!(GenerationId::new_dynamic("v2").name(), "dynamic-v2");
  }

  #[test]
  fn lookup_without_active_generation_misses() {
    let registry = Registry::new(MemoryCacheStore::new());
    let got = registry.lookup(Purpose::Static, &key("https://a/x")).unwrap();
    assert!(got.is_none());
  }

  #[test]
  fn put_and_lookup_active_generation() {
    let registry = registry_with_active_pair();
    let k = key("https://a/x");

    registry.put(Purpose::Dynamic, &k, &entry(b"data")).unwrap();

    let got = registry.lookup(Purpose::Dynamic, &k).unwrap().unwrap();
    assert_eq!(got.body, b"data");
    // Static generation stays empty
    assert!(registry.lookup(Purpose::Static, &k).unwrap().is_none());
  }

  #[test]
  fn put_without_active_generation_errors() {
    let registry = Registry::new(MemoryCacheStore::new());
    let result = registry.put(Purpose::Dynamic, &key("https://a/x"), &entry(b"x"));
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn retired_generation_refuses_new_readers() {
    let registry = registry_with_active_pair();
    let k = key("https://a/x");
    registry.put(Purpose::Static, &k, &entry(b"x")).unwrap();

    registry.retire("static-v1").await.unwrap();

    assert!(registry.lookup(Purpose::Static, &k).unwrap().is_none());
    assert!(registry.store().get("static-v1", &k).unwrap().is_none());
  }

  #[tokio::test]
  async fn retire_waits_for_in_flight_readers() {
    let registry = std::sync::Arc::new(registry_with_active_pair());
    let k = key("https://a/x");
    registry.put(Purpose::Static, &k, &entry(b"x")).unwrap();

    let probe = registry.reader_probe("static-v1").unwrap();

    let retiring = {
      let registry = std::sync::Arc::clone(&registry);
      tokio::spawn(async move { registry.retire("static-v1").await })
    };

    // With a reader outstanding, the entries must still be present
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!retiring.is_finished());
    assert!(registry.store().get("static-v1", &k).unwrap().is_some());

    drop(probe);
    retiring.await.unwrap().unwrap();
    assert!(registry.store().get("static-v1", &k).unwrap().is_none());
  }

  #[tokio::test]
  async fn retire_unknown_generation_deletes_store_rows() {
    let registry = registry_with_active_pair();
    let k = key("https://a/x");

    // A generation left behind by an earlier process: rows but no handle
    registry
      .store()
      .put("static-v0", &k, &entry(b"stale"))
      .unwrap();

    registry.retire("static-v0").await.unwrap();
    assert!(registry.store().get("static-v0", &k).unwrap().is_none());
  }

  #[test]
  fn known_generations_merges_store_and_handles() {
    let registry = registry_with_active_pair();
    let k = key("https://a/x");

    registry.put(Purpose::Static, &k, &entry(b"x")).unwrap();
    registry
      .store()
      .put("static-v0", &k, &entry(b"stale"))
      .unwrap();

    let names = registry.known_generations().unwrap();
    // dynamic-v1 has no rows yet but is registered; static-v0 has rows only
    assert_eq!(names, vec!["dynamic-v1", "static-v0", "static-v1"]);
  }
}
