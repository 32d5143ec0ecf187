//! Retirement of superseded cache generations.

use color_eyre::Result;
use tracing::{info, warn};

use super::registry::{GenerationId, Registry};
use super::store::CacheStore;

/// Delete every known generation that is not part of the newly active pair.
///
/// Deletions of distinct generations are independent and run concurrently.
/// The worker must await this before announcing itself ready, so a new
/// session's lookup can never race the deletion of the generation it reads.
pub async fn reap<S: CacheStore>(registry: &Registry<S>, keep: &[GenerationId]) -> Result<usize> {
  let keep_names: Vec<String> = keep.iter().map(|id| id.name()).collect();

  let doomed: Vec<String> = registry
    .known_generations()?
    .into_iter()
    .filter(|name| !keep_names.contains(name))
    .collect();

  if doomed.is_empty() {
    return Ok(0);
  }

  let results = futures::future::join_all(
    doomed
      .iter()
      .map(|name| async move { (name, registry.retire(name).await) }),
  )
  .await;

  let mut reaped = 0;
  for (name, result) in results {
    match result {
      Ok(()) => {
        info!(generation = %name, "retired superseded generation");
        reaped += 1;
      }
      Err(e) => {
        // A stuck deletion must not block activation of the new pair
        warn!(generation = %name, "failed to retire generation: {}", e);
      }
    }
  }

  Ok(reaped)
}
