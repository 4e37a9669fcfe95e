//! Speculative patches applied to cached data ahead of a mutation's response.

use serde_json::Value;
use tracing::debug;

use super::storage::CacheStore;
use super::traits::{CacheKey, QueryStatus};
use crate::error::{CacheError, Result};

/// Handle to an installed optimistic patch.
///
/// Holds the payload as it was before patching and the revision the entry
/// reached through the patch. Undo only applies while that revision is still
/// current, so a real network result is never overwritten by a rollback.
#[derive(Debug, Clone)]
#[must_use = "dropping the patch handle makes the patch impossible to undo"]
pub struct OptimisticPatch {
  key: CacheKey,
  previous: Value,
  revision: u64,
}

impl OptimisticPatch {
  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  /// Payload as it was before the patch.
  pub fn previous(&self) -> &Value {
    &self.previous
  }

  /// Whether the patched payload is still the entry's latest write.
  pub fn is_current(&self, store: &CacheStore) -> bool {
    store
      .entry(&self.key)
      .is_some_and(|e| e.revision() == self.revision)
  }

  /// Restore the pre-patch payload.
  ///
  /// Fails with [`CacheError::StaleOptimisticConflict`] and leaves the entry
  /// untouched if anything wrote to it after the patch.
  pub fn undo(self, store: &mut CacheStore) -> Result<()> {
    if !self.is_current(store) {
      return Err(CacheError::StaleOptimisticConflict { key: self.key });
    }
    debug!(key = %self.key, "rolling back optimistic patch");
    store.replace_payload(&self.key, self.previous);
    Ok(())
  }
}

/// Apply `patch` to a copy of `key`'s payload and install the copy.
///
/// Only resolved entries are patched; otherwise there is nothing meaningful
/// to patch and `None` is returned.
pub fn begin_optimistic<F>(store: &mut CacheStore, key: &CacheKey, patch: F) -> Option<OptimisticPatch>
where
  F: FnOnce(&mut Value),
{
  let entry = store.entry(key)?;
  if entry.status() != QueryStatus::Resolved {
    debug!(key = %key, "skipping optimistic patch on unresolved entry");
    return None;
  }
  let previous = entry.payload()?.clone();
  let mut draft = previous.clone();
  patch(&mut draft);

  let revision = store.replace_payload(key, draft)?;
  Some(OptimisticPatch {
    key: key.clone(),
    previous,
    revision,
  })
}
