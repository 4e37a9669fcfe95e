use serde_json::Value;
use tokio::sync::mpsc;

use crate::cache::CacheKey;
use crate::error::Result;

/// Events the cache layer applies on its owner's loop
#[derive(Debug)]
pub enum CacheEvent {
  /// A query fetch settled
  QueryFinished {
    key: CacheKey,
    request_id: u64,
    result: Result<Value>,
  },
  /// A mutation's network call settled
  MutationFinished { mutation_id: u64, result: Result<Value> },
  /// A subscription was dropped without an explicit unsubscribe
  Released(CacheKey),
  /// The grace period of an unused entry ran out
  EvictionDue { key: CacheKey, epoch: u64 },
}

/// Channel carrying events from spawned network tasks back to the cache owner
pub struct EventHandler {
  tx: mpsc::UnboundedSender<CacheEvent>,
  rx: mpsc::UnboundedReceiver<CacheEvent>,
}

impl EventHandler {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self { tx, rx }
  }

  /// Sender handed to spawned tasks and subscriptions
  pub fn sender(&self) -> mpsc::UnboundedSender<CacheEvent> {
    self.tx.clone()
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<CacheEvent> {
    self.rx.recv().await
  }

  /// Receive an event if one is already queued
  pub fn try_next(&mut self) -> Option<CacheEvent> {
    self.rx.try_recv().ok()
  }
}

impl Default for EventHandler {
  fn default() -> Self {
    Self::new()
  }
}
