//! Atomic population of a static generation from an asset manifest.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{error, info};
use url::Url;

use crate::origin::{CacheEntry, Fetch, Request};

use super::registry::{GenerationId, Registry};
use super::store::CacheStore;

/// Installs a manifest of assets into a new static generation.
///
/// Population is all-or-nothing: if any single asset cannot be fetched, the
/// whole generation is discarded and the previously active generation keeps
/// serving.
pub struct Populator<F: Fetch> {
  fetcher: Arc<F>,
  origin: Url,
}

impl<F: Fetch> Populator<F> {
  pub fn new(fetcher: Arc<F>, origin: Url) -> Self {
    Self { fetcher, origin }
  }

  /// Resolve a manifest path against the origin.
  fn resolve(&self, asset: &str) -> Result<Url> {
    self
      .origin
      .join(asset)
      .map_err(|e| eyre!("Invalid manifest entry {}: {}", asset, e))
  }

  /// Install every manifest asset into a fresh static generation.
  ///
  /// On success the generation is registered with the registry and its id
  /// returned; activation is a separate step. On any failure the staged
  /// generation is deleted in full and the error propagated.
  pub async fn install<S: CacheStore>(
    &self,
    registry: &Registry<S>,
    manifest: &[String],
    version: &str,
  ) -> Result<GenerationId> {
    let id = GenerationId::new_static(version);
    let name = id.name();

    info!(generation = %name, assets = manifest.len(), "installing static generation");

    // A reinstall of the same version starts from a clean slate
    registry.store().delete_generation(&name)?;

    match self.stage(registry, &name, manifest).await {
      Ok(()) => {
        registry.register(&id)?;
        info!(generation = %name, "install complete");
        Ok(id)
      }
      Err(e) => {
        // All-or-nothing: discard everything staged for this generation
        registry.store().delete_generation(&name)?;
        error!(generation = %name, "install aborted: {}", e);
        Err(e)
      }
    }
  }

  async fn stage<S: CacheStore>(
    &self,
    registry: &Registry<S>,
    name: &str,
    manifest: &[String],
  ) -> Result<()> {
    let fetches = manifest.iter().map(|asset| {
      let request = self.resolve(asset).map(Request::get);
      async move {
        let request = request?;
        let response = self.fetcher.fetch(&request).await?;
        if !response.is_success() {
          return Err(eyre!(
            "Manifest fetch for {} returned {}",
            request.url,
            response.status
          ));
        }
        Ok((request.cache_key(), CacheEntry::from_response(&response)))
      }
    });

    let entries = futures::future::try_join_all(fetches).await?;

    for (key, entry) in &entries {
      registry.store().put(name, key, entry)?;
    }

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::registry::Purpose;
  use crate::cache::store::MemoryCacheStore;
  use crate::origin::{CacheKey, Response};
  use color_eyre::eyre::eyre;
  use std::collections::HashMap;

  /// Fetcher serving canned bodies by path; anything absent fails.
  struct CannedFetcher {
    bodies: HashMap<String, Vec<u8>>,
  }

  impl CannedFetcher {
    fn new(assets: &[(&str, &[u8])]) -> Self {
      Self {
        bodies: assets
          .iter()
          .map(|(path, body)| (path.to_string(), body.to_vec()))
          .collect(),
      }
    }
  }

  impl Fetch for CannedFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response> {
      match self.bodies.get(request.url.path()) {
        Some(body) => Ok(Response {
          status: 200,
          headers: Vec::new(),
          body: body.clone(),
        }),
        None => Err(eyre!("unreachable: {}", request.url)),
      }
    }
  }

  fn origin() -> Url {
    Url::parse("https://app.example.com").unwrap()
  }

  fn manifest(paths: &[&str]) -> Vec<String> {
    paths.iter().map(|p| p.to_string()).collect()
  }

  #[tokio::test]
  async fn install_makes_every_asset_retrievable() {
    let registry = Registry::new(MemoryCacheStore::new());
    let fetcher = CannedFetcher::new(&[
      ("/", b"root".as_slice()),
      ("/index.html", b"<html>".as_slice()),
      ("/css/styles.css", b"body{}".as_slice()),
    ]);
    let populator = Populator::new(Arc::new(fetcher), origin());

    let id = populator
      .install(&registry, &manifest(&["/", "/index.html", "/css/styles.css"]), "v1")
      .await
      .unwrap();
    assert_eq!(id.name(), "static-v1");

    // Byte-identical content for every manifest URL
    for (path, body) in [
      ("/", b"root".as_slice()),
      ("/index.html", b"<html>".as_slice()),
      ("/css/styles.css", b"body{}".as_slice()),
    ] {
      let key = CacheKey::get(&origin().join(path).unwrap());
      let entry = registry.store().get("static-v1", &key).unwrap().unwrap();
      assert_eq!(entry.body, body, "mismatch for {}", path);
    }
  }

  #[tokio::test]
  async fn failed_fetch_discards_whole_generation() {
    let registry = Registry::new(MemoryCacheStore::new());
    // "/missing" is not served, so the install must abort
    let fetcher = CannedFetcher::new(&[("/", b"root".as_slice())]);
    let populator = Populator::new(Arc::new(fetcher), origin());

    let result = populator
      .install(&registry, &manifest(&["/", "/missing"]), "v2")
      .await;

    assert!(result.is_err());
    assert_eq!(registry.store().count("static-v2").unwrap(), 0);
  }

  #[tokio::test]
  async fn failed_install_leaves_previous_generation_serving() {
    let registry = Registry::new(MemoryCacheStore::new());
    let populator = Populator::new(
      Arc::new(CannedFetcher::new(&[("/", b"old".as_slice())])),
      origin(),
    );

    let v1 = populator.install(&registry, &manifest(&["/"]), "v1").await.unwrap();
    registry
      .activate(&v1, &GenerationId::new_dynamic("v1"))
      .unwrap();

    // v2 install fails; v1 must keep serving unchanged
    let failing = Populator::new(Arc::new(CannedFetcher::new(&[])), origin());
    assert!(failing
      .install(&registry, &manifest(&["/"]), "v2")
      .await
      .is_err());

    let key = CacheKey::get(&origin());
    let entry = registry.lookup(Purpose::Static, &key).unwrap().unwrap();
    assert_eq!(entry.body, b"old");
    assert_eq!(registry.store().count("static-v2").unwrap(), 0);
  }

  #[tokio::test]
  async fn non_success_status_aborts_install() {
    struct ErrorPage;
    impl Fetch for ErrorPage {
      async fn fetch(&self, _request: &Request) -> Result<Response> {
        Ok(Response {
          status: 500,
          headers: Vec::new(),
          body: Vec::new(),
        })
      }
    }

    let registry = Registry::new(MemoryCacheStore::new());
    let populator = Populator::new(Arc::new(ErrorPage), origin());

    assert!(populator
      .install(&registry, &manifest(&["/"]), "v1")
      .await
      .is_err());
    assert_eq!(registry.store().count("static-v1").unwrap(), 0);
  }

  #[tokio::test]
  async fn reinstall_same_version_replaces_entries() {
    let registry = Registry::new(MemoryCacheStore::new());

    let first = Populator::new(
      Arc::new(CannedFetcher::new(&[("/", b"one".as_slice())])),
      origin(),
    );
    first.install(&registry, &manifest(&["/"]), "v1").await.unwrap();

    let second = Populator::new(
      Arc::new(CannedFetcher::new(&[("/", b"two".as_slice())])),
      origin(),
    );
    second.install(&registry, &manifest(&["/"]), "v1").await.unwrap();

    let key = CacheKey::get(&origin());
    let entry = registry.store().get("static-v1", &key).unwrap().unwrap();
    assert_eq!(entry.body, b"two");
    assert_eq!(registry.store().count("static-v1").unwrap(), 1);
  }
}
