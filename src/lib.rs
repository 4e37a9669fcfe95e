//! Client-side cache for REST resources.
//!
//! Query results are cached per operation and arguments, linked to
//! invalidation tags, refetched when a mutation invalidates those tags, and
//! patched optimistically while a mutation is in flight.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod query;

#[cfg(test)]
mod test_utils;

pub use api::{HttpTransport, Resource, Transport};
pub use cache::{CacheKey, CacheLayer, Tag};
pub use config::Config;
pub use error::CacheError;
pub use query::{Query, QueryState};
