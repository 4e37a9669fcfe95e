//! Subscriber handles onto cache entries.

use futures::stream::{self, Stream};
use tokio::sync::{mpsc, watch};

use super::traits::{CacheKey, EntrySnapshot};
use crate::event::CacheEvent;

/// A live view of one cache entry.
///
/// Holding a subscription keeps the entry alive. Dropping it posts a release
/// to the cache layer, which applies it the next time its events are
/// processed; [`CacheLayer::unsubscribe`](super::CacheLayer::unsubscribe)
/// releases immediately instead.
#[derive(Debug)]
pub struct Subscription {
  key: CacheKey,
  rx: watch::Receiver<EntrySnapshot>,
  release_tx: mpsc::UnboundedSender<CacheEvent>,
  armed: bool,
}

impl Subscription {
  pub(crate) fn new(
    key: CacheKey,
    rx: watch::Receiver<EntrySnapshot>,
    release_tx: mpsc::UnboundedSender<CacheEvent>,
  ) -> Self {
    Self {
      key,
      rx,
      release_tx,
      armed: true,
    }
  }

  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  /// Current status, payload and error of the entry.
  pub fn snapshot(&self) -> EntrySnapshot {
    self.rx.borrow().clone()
  }

  /// Whether the entry changed since the last observed snapshot.
  pub fn has_changed(&self) -> bool {
    self.rx.has_changed().unwrap_or(false)
  }

  /// The latest snapshot if it was not observed yet. Never blocks.
  pub fn poll_update(&mut self) -> Option<EntrySnapshot> {
    if self.has_changed() {
      Some(self.rx.borrow_and_update().clone())
    } else {
      None
    }
  }

  /// Wait for the next change. Returns `None` once the entry was evicted.
  pub async fn changed(&mut self) -> Option<EntrySnapshot> {
    self.rx.changed().await.ok()?;
    Some(self.rx.borrow_and_update().clone())
  }

  /// Stream of every subsequent snapshot, ending when the entry is evicted.
  pub fn into_stream(self) -> impl Stream<Item = EntrySnapshot> {
    stream::unfold(self, |mut sub| async move {
      let snapshot = sub.changed().await?;
      Some((snapshot, sub))
    })
  }

  /// Stop the drop handler from posting a release.
  pub(crate) fn disarm(&mut self) {
    self.armed = false;
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if self.armed {
      // The layer may already be gone, in which case nothing is left to release
      let _ = self.release_tx.send(CacheEvent::Released(self.key.clone()));
    }
  }
}
