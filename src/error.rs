//! Error types shared by the cache engine and its transports.

use thiserror::Error;

use crate::cache::{CacheKey, Tag};

/// Errors produced by the cache layer.
///
/// Errors are `Clone` because a failed fetch is stored on its cache entry and
/// handed to every subscriber of that entry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
  /// The transport failed or the server answered with a non-success status.
  #[error("network error{}: {message}", fmt_status(.status))]
  Network {
    status: Option<u16>,
    message: String,
  },

  /// An optimistic patch was undone after a newer write landed on its entry.
  #[error("optimistic patch on {key} was superseded by a newer write")]
  StaleOptimisticConflict { key: CacheKey },

  /// An invalidated tag has no cache entries linked to it.
  #[error("tag {tag} has no linked cache entries")]
  OrphanedTag { tag: Tag },

  /// No query or mutation is registered under this name.
  #[error("unknown operation: {0}")]
  UnknownOperation(String),

  /// Arguments or payloads could not be (de)serialized.
  #[error("serialization failed: {0}")]
  Serialization(String),

  /// The request was dropped before it produced an outcome.
  #[error("request was cancelled")]
  Cancelled,

  /// Invalid configuration, e.g. a malformed base URL.
  #[error("invalid configuration: {0}")]
  Config(String),
}

fn fmt_status(status: &Option<u16>) -> String {
  status.map(|s| format!(" ({})", s)).unwrap_or_default()
}

impl CacheError {
  /// Build a network error without an HTTP status.
  pub fn network(message: impl Into<String>) -> Self {
    Self::Network {
      status: None,
      message: message.into(),
    }
  }
}

impl From<serde_json::Error> for CacheError {
  fn from(e: serde_json::Error) -> Self {
    Self::Serialization(e.to_string())
  }
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;
