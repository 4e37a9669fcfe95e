//! Invalidation tags and the index mapping them to cache keys.

use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::trace;

use super::traits::{CacheKey, EntityId};
use crate::error::{CacheError, Result};

/// What a tag points at within an entity type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Discriminator {
  /// One specific entity
  Id(EntityId),
  /// Any collection of the entity type
  List,
  /// One page of a paginated collection
  Page(u64),
}

/// Invalidation key: entity type plus discriminator, compared structurally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag {
  entity_type: String,
  discriminator: Discriminator,
}

impl Tag {
  pub fn new(entity_type: impl Into<String>, discriminator: Discriminator) -> Self {
    Self {
      entity_type: entity_type.into(),
      discriminator,
    }
  }

  pub fn id(entity_type: impl Into<String>, id: impl Into<EntityId>) -> Self {
    Self::new(entity_type, Discriminator::Id(id.into()))
  }

  pub fn list(entity_type: impl Into<String>) -> Self {
    Self::new(entity_type, Discriminator::List)
  }

  pub fn page(entity_type: impl Into<String>, page: u64) -> Self {
    Self::new(entity_type, Discriminator::Page(page))
  }

  pub fn entity_type(&self) -> &str {
    &self.entity_type
  }

  pub fn discriminator(&self) -> &Discriminator {
    &self.discriminator
  }
}

impl fmt::Display for Tag {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.discriminator {
      Discriminator::Id(id) => write!(f, "{}/{}", self.entity_type, id),
      Discriminator::List => write!(f, "{}/LIST", self.entity_type),
      Discriminator::Page(n) => write!(f, "{}/PAGE_{}", self.entity_type, n),
    }
  }
}

/// Maps each tag to the set of cache keys whose data depends on it.
///
/// Tags with no linked keys are pruned, so a long-lived cache does not
/// accumulate empty sets.
#[derive(Debug, Default)]
pub struct TagIndex {
  links: HashMap<Tag, HashSet<CacheKey>>,
}

impl TagIndex {
  pub fn new() -> Self {
    Self::default()
  }

  /// Link `key` under `tag`. Returns false if the link already existed.
  pub fn link(&mut self, tag: Tag, key: &CacheKey) -> bool {
    self.links.entry(tag).or_default().insert(key.clone())
  }

  /// Remove the link between `tag` and `key`. Returns false if there was none.
  pub fn unlink(&mut self, tag: &Tag, key: &CacheKey) -> bool {
    let Some(keys) = self.links.get_mut(tag) else {
      return false;
    };
    let removed = keys.remove(key);
    if keys.is_empty() {
      self.links.remove(tag);
    }
    removed
  }

  /// Keys linked to a single tag.
  pub fn lookup(&self, tag: &Tag) -> Result<&HashSet<CacheKey>> {
    self
      .links
      .get(tag)
      .ok_or_else(|| CacheError::OrphanedTag { tag: tag.clone() })
  }

  /// Union of the keys linked to any of `tags`. Orphaned tags contribute nothing.
  pub fn keys_for(&self, tags: &[Tag]) -> HashSet<CacheKey> {
    let mut keys = HashSet::new();
    for tag in tags {
      match self.lookup(tag) {
        Ok(linked) => keys.extend(linked.iter().cloned()),
        Err(e) => trace!("{}", e),
      }
    }
    keys
  }

  /// Whether `key` is linked under `tag`.
  pub fn contains(&self, tag: &Tag, key: &CacheKey) -> bool {
    self.links.get(tag).is_some_and(|keys| keys.contains(key))
  }

  /// Iterate over every (tag, keys) pair.
  pub fn iter(&self) -> impl Iterator<Item = (&Tag, &HashSet<CacheKey>)> {
    self.links.iter()
  }

  /// Number of tags with at least one linked key.
  pub fn len(&self) -> usize {
    self.links.len()
  }

  pub fn is_empty(&self) -> bool {
    self.links.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn key(op: &str, id: u64) -> CacheKey {
    CacheKey::new(op, &json!(id))
  }

  #[test]
  fn test_tags_compare_structurally() {
    // "a/b" + "c" and "a" + "b/c" would collide as concatenated strings
    assert_ne!(Tag::id("a/b", "c"), Tag::id("a", "b/c"));
    assert_ne!(Tag::list("User"), Tag::id("User", "LIST"));
    assert_eq!(Tag::id("User", 42u64), Tag::id("User", "42"));
    assert_eq!(Tag::page("User", 3).to_string(), "User/PAGE_3");
  }

  #[test]
  fn test_link_is_idempotent() {
    let mut index = TagIndex::new();
    let k = key("users.get", 1);
    assert!(index.link(Tag::id("User", "1"), &k));
    assert!(!index.link(Tag::id("User", "1"), &k));
    assert_eq!(index.lookup(&Tag::id("User", "1")).unwrap().len(), 1);
  }

  #[test]
  fn test_unlink_prunes_empty_tags() {
    let mut index = TagIndex::new();
    let k = key("users.get", 1);
    index.link(Tag::id("User", "1"), &k);
    assert!(index.unlink(&Tag::id("User", "1"), &k));
    assert!(index.is_empty());
    assert!(!index.unlink(&Tag::id("User", "1"), &k));
  }

  #[test]
  fn test_keys_for_unions_and_skips_orphans() {
    let mut index = TagIndex::new();
    let list = CacheKey::new("users.list", &json!({}));
    let one = key("users.get", 1);
    index.link(Tag::list("User"), &list);
    index.link(Tag::id("User", "1"), &list);
    index.link(Tag::id("User", "1"), &one);

    let keys = index.keys_for(&[Tag::id("User", "1"), Tag::id("User", "99")]);
    assert_eq!(keys.len(), 2);
    assert!(keys.contains(&list) && keys.contains(&one));

    assert!(matches!(
      index.lookup(&Tag::id("User", "99")),
      Err(CacheError::OrphanedTag { .. })
    ));
  }
}
