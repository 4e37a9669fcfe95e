//! Core types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{CacheError, Result};

/// Identity of one fetch operation instance: operation name plus arguments.
///
/// Arguments are stored in canonical form (compact JSON, object keys sorted),
/// so two structurally equal argument values always map to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
  operation: String,
  args: String,
}

impl CacheKey {
  /// Build a key from an operation name and already-serialized arguments.
  pub fn new(operation: impl Into<String>, args: &Value) -> Self {
    Self {
      operation: operation.into(),
      args: args.to_string(),
    }
  }

  /// Serialize `args` and build the key for it.
  ///
  /// Returns the key together with the argument value, which the cache keeps
  /// around to refetch the entry later.
  pub fn from_args<A: Serialize + ?Sized>(operation: &str, args: &A) -> Result<(Self, Value)> {
    let value = serde_json::to_value(args)?;
    Ok((Self::new(operation, &value), value))
  }

  pub fn operation(&self) -> &str {
    &self.operation
  }

  /// Canonical serialized arguments.
  pub fn args(&self) -> &str {
    &self.args
  }

  /// Stable, fixed-length hash of this key (SHA256, hex encoded).
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.operation.as_bytes());
    hasher.update(b":");
    hasher.update(self.args.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}({})", self.operation, self.args)
  }
}

/// Identifier of an entity. Numeric ids are normalized to their decimal form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(String);

impl EntityId {
  pub fn new(id: impl Into<String>) -> Self {
    Self(id.into())
  }

  /// Read an id out of a JSON value (string or number).
  pub fn from_value(value: &Value) -> Option<Self> {
    match value {
      Value::String(s) => Some(Self(s.clone())),
      Value::Number(n) => Some(Self(n.to_string())),
      _ => None,
    }
  }

  /// Read the id stored under `field` of a JSON object.
  pub fn from_field(value: &Value, field: &str) -> Option<Self> {
    value.get(field).and_then(Self::from_value)
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for EntityId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for EntityId {
  fn from(s: &str) -> Self {
    Self(s.to_string())
  }
}

impl From<String> for EntityId {
  fn from(s: String) -> Self {
    Self(s)
  }
}

impl From<u64> for EntityId {
  fn from(n: u64) -> Self {
    Self(n.to_string())
  }
}

/// Lifecycle status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
  /// Created, no fetch started yet
  Uninitialized,
  /// First fetch in flight, nothing to show yet
  Loading,
  /// Holds data from a successful fetch
  Resolved,
  /// The latest fetch failed
  Errored,
}

/// Point-in-time view of a cache entry, as handed to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySnapshot {
  pub status: QueryStatus,
  /// Last known payload. Survives a failed refetch.
  pub data: Option<Value>,
  pub error: Option<CacheError>,
  /// Data was invalidated or the latest fetch failed
  pub is_stale: bool,
  /// A fetch for this entry is in flight
  pub is_fetching: bool,
  /// Bumped on every payload or status change
  pub revision: u64,
  /// When the current payload arrived from the network
  pub fulfilled_at: Option<DateTime<Utc>>,
}

impl EntrySnapshot {
  pub(crate) fn uninitialized() -> Self {
    Self {
      status: QueryStatus::Uninitialized,
      data: None,
      error: None,
      is_stale: false,
      is_fetching: false,
      revision: 0,
      fulfilled_at: None,
    }
  }

  pub fn is_resolved(&self) -> bool {
    self.status == QueryStatus::Resolved
  }

  pub fn is_errored(&self) -> bool {
    self.status == QueryStatus::Errored
  }

  /// Deserialize the payload into a domain type.
  pub fn data_as<T: DeserializeOwned>(&self) -> Option<Result<T>> {
    self
      .data
      .as_ref()
      .map(|v| T::deserialize(v).map_err(CacheError::from))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_key_is_canonical() {
    let (a, _) = CacheKey::from_args("users.list", &json!({"page": 2, "q": "x"})).unwrap();
    let (b, _) = CacheKey::from_args("users.list", &json!({"q": "x", "page": 2})).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.cache_hash(), b.cache_hash());
    assert_eq!(a.to_string(), r#"users.list({"page":2,"q":"x"})"#);
  }

  #[test]
  fn test_key_distinguishes_operations() {
    let a = CacheKey::new("users.get", &json!("1"));
    let b = CacheKey::new("posts.get", &json!("1"));
    assert_ne!(a, b);
    assert_eq!(a.cache_hash().len(), 64);
  }

  #[test]
  fn test_entity_id_from_value() {
    assert_eq!(EntityId::from_value(&json!(42)), Some(EntityId::from("42")));
    assert_eq!(EntityId::from_value(&json!("abc")), Some(EntityId::from("abc")));
    assert_eq!(EntityId::from_value(&json!(null)), None);
    assert_eq!(
      EntityId::from_field(&json!({"id": 7, "name": "x"}), "id"),
      Some(EntityId::from(7u64))
    );
  }

  #[test]
  fn test_snapshot_data_as() {
    let mut snapshot = EntrySnapshot::uninitialized();
    assert!(snapshot.data_as::<Vec<u32>>().is_none());
    snapshot.data = Some(json!([1, 2, 3]));
    assert_eq!(snapshot.data_as::<Vec<u32>>().unwrap().unwrap(), vec![1, 2, 3]);
    assert!(snapshot.data_as::<String>().unwrap().is_err());
  }
}
