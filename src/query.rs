//! Typed view of a cached query.
//!
//! A `Query<T>` follows one cache subscription and deserializes its payload
//! into `T`, remembering the last good value across failed refetches.
//!
//! ```ignore
//! let mut users: Query<Vec<User>> = cache.query("users.list", &json!({}))?;
//! cache.settle().await;
//! users.poll();
//! match users.state() {
//!     QueryState::Success(users) => show(users),
//!     QueryState::Error(e) => eprintln!("{e}"),
//!     QueryState::Idle | QueryState::Loading => {}
//! }
//! ```

use serde::de::DeserializeOwned;

use crate::cache::{EntrySnapshot, QueryStatus, Subscription};

/// Status of a query with its decoded payload
#[derive(Debug, Clone)]
pub enum QueryState<T> {
  /// Nothing fetched and nothing in flight
  Idle,
  /// First fetch in flight
  Loading,
  Success(T),
  /// Fetch failed, or the payload did not decode into `T`
  Error(String),
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error(_))
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

/// Typed view of one cache subscription, holding the last good payload
/// alongside the current state.
pub struct Query<T> {
  subscription: Subscription,
  state: QueryState<T>,
  last_data: Option<T>,
  is_stale: bool,
  is_fetching: bool,
}

impl<T: DeserializeOwned> Query<T> {
  pub fn new(subscription: Subscription) -> Self {
    let snapshot = subscription.snapshot();
    let mut query = Self {
      subscription,
      state: QueryState::Idle,
      last_data: None,
      is_stale: false,
      is_fetching: false,
    };
    query.apply(snapshot);
    query
  }

  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  /// Get the last successfully fetched data, even if a refetch failed since.
  pub fn data(&self) -> Option<&T> {
    self.last_data.as_ref()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn is_success(&self) -> bool {
    self.state.is_success()
  }

  pub fn is_error(&self) -> bool {
    self.state.is_error()
  }

  /// Error message, or the decode failure of a resolved payload.
  pub fn error(&self) -> Option<&str> {
    self.state.error()
  }

  /// Check if the data was invalidated or its latest refetch failed.
  pub fn is_stale(&self) -> bool {
    self.is_stale
  }

  /// Check if a fetch is in flight, including background refetches.
  pub fn is_fetching(&self) -> bool {
    self.is_fetching
  }

  pub fn subscription(&self) -> &Subscription {
    &self.subscription
  }

  pub fn into_subscription(self) -> Subscription {
    self.subscription
  }

  /// Pick up the latest entry snapshot.
  ///
  /// Returns `true` if the state changed. Call this in your event loop tick
  /// handler, after the cache layer processed its events.
  pub fn poll(&mut self) -> bool {
    match self.subscription.poll_update() {
      Some(snapshot) => {
        self.apply(snapshot);
        true
      }
      None => false,
    }
  }

  /// Wait until the entry changes. Returns `false` once it was evicted.
  pub async fn changed(&mut self) -> bool {
    match self.subscription.changed().await {
      Some(snapshot) => {
        self.apply(snapshot);
        true
      }
      None => false,
    }
  }

  fn apply(&mut self, snapshot: EntrySnapshot) {
    self.is_stale = snapshot.is_stale;
    self.is_fetching = snapshot.is_fetching;
    self.last_data = match snapshot.data_as::<T>() {
      Some(Ok(data)) => Some(data),
      _ => None,
    };

    self.state = match snapshot.status {
      QueryStatus::Uninitialized => QueryState::Idle,
      QueryStatus::Loading => QueryState::Loading,
      QueryStatus::Resolved => match snapshot.data_as::<T>() {
        Some(Ok(data)) => QueryState::Success(data),
        Some(Err(e)) => QueryState::Error(e.to_string()),
        None => QueryState::Error("resolved without data".to_string()),
      },
      QueryStatus::Errored => QueryState::Error(
        snapshot
          .error
          .map(|e| e.to_string())
          .unwrap_or_else(|| "unknown error".to_string()),
      ),
    };
  }
}

// Query is not Clone because it owns its subscription. Subscribe again to
// observe the same entry from another place.

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("key", self.subscription.key())
      .field("state", &self.state)
      .field("is_stale", &self.is_stale)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::{QueryDefinition, RequestDescriptor};
  use crate::error::CacheError;
  use crate::test_utils::{layer_with, ScriptedTransport};
  use serde_json::json;

  fn numbers_layer(transport: &ScriptedTransport) -> crate::cache::CacheLayer {
    layer_with(transport, |layer| {
      layer.register_query(QueryDefinition::new("numbers", |_| {
        Ok(RequestDescriptor::get("numbers"))
      }));
    })
  }

  #[tokio::test]
  async fn test_query_success() {
    let transport = ScriptedTransport::new();
    transport.respond("GET numbers", json!([1, 2, 3]));
    let mut cache = numbers_layer(&transport);

    let mut query: Query<Vec<u32>> = cache.query("numbers", &()).unwrap();
    assert!(query.is_loading());

    cache.settle().await;
    assert!(query.poll());
    assert!(query.is_success());
    assert_eq!(query.state().data(), Some(&vec![1, 2, 3]));
    assert!(!query.poll());
  }

  #[tokio::test]
  async fn test_query_error() {
    let transport = ScriptedTransport::new();
    transport.fail("GET numbers", CacheError::network("Something went wrong"));
    let mut cache = numbers_layer(&transport);

    let mut query: Query<i32> = cache.query("numbers", &()).unwrap();
    cache.settle().await;
    query.poll();

    assert!(query.is_error());
    assert_eq!(query.error(), Some("network error: Something went wrong"));
    assert!(query.data().is_none());
  }

  #[tokio::test]
  async fn test_query_keeps_data_through_failed_refetch() {
    let transport = ScriptedTransport::new();
    transport.respond("GET numbers", json!(42));
    let mut cache = numbers_layer(&transport);

    let mut query: Query<i32> = cache.query("numbers", &()).unwrap();
    cache.settle().await;
    query.poll();

    transport.fail("GET numbers", CacheError::network("offline"));
    let key = query.subscription().key().clone();
    cache.refetch(&key);
    cache.settle().await;
    query.poll();

    assert!(query.is_error());
    assert!(query.is_stale());
    assert_eq!(query.data(), Some(&42));
  }

  #[tokio::test]
  async fn test_payload_of_wrong_shape_is_an_error() {
    let transport = ScriptedTransport::new();
    transport.respond("GET numbers", json!({"not": "a number"}));
    let mut cache = numbers_layer(&transport);

    let mut query: Query<i32> = cache.query("numbers", &()).unwrap();
    cache.settle().await;
    query.poll();
    assert!(query.is_error());
  }
}
