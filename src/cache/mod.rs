//! Normalized response cache with tag-based invalidation.
//!
//! This module provides a transport-agnostic caching mechanism that:
//! - Keys results by operation name plus canonical arguments
//! - Links every result to the tags its operation declares
//! - Refetches or drops dependent entries when a mutation invalidates tags
//! - Applies optimistic patches and rolls them back when a mutation fails

mod invalidation;
mod layer;
mod optimistic;
mod storage;
mod subscription;
mod tags;
mod traits;

pub use invalidation::{
  affected_keys, invalidate, resolve_templates, InvalidationPolicy, TagSlot, TagTemplate,
};
pub use layer::{CacheLayer, MutationHandle};
pub use optimistic::{begin_optimistic, OptimisticPatch};
pub use storage::{CacheEntry, CacheStore, Released};
pub use subscription::Subscription;
pub use tags::{Discriminator, Tag, TagIndex};
pub use traits::{CacheKey, EntityId, EntrySnapshot, QueryStatus};
