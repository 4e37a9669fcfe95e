//! Tag templates and invalidation of dependent cache entries.

use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, trace};

use super::storage::CacheStore;
use super::tags::{Discriminator, Tag};
use super::traits::{CacheKey, EntityId};

/// Where a template takes its discriminator from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagSlot {
  /// A concrete discriminator, used as is
  Fixed(Discriminator),
  /// The id of the operation result, falling back to the argument's id
  ResultId,
  /// The id carried by the arguments
  ArgId,
  /// The `page` carried by the arguments
  ArgPage,
}

/// A tag declared by an operation before its result or arguments are known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagTemplate {
  entity_type: String,
  slot: TagSlot,
  /// Field holding the id in object results and arguments
  id_field: String,
}

impl TagTemplate {
  pub fn new(entity_type: impl Into<String>, slot: TagSlot) -> Self {
    Self {
      entity_type: entity_type.into(),
      slot,
      id_field: "id".to_string(),
    }
  }

  pub fn list(entity_type: impl Into<String>) -> Self {
    Self::new(entity_type, TagSlot::Fixed(Discriminator::List))
  }

  pub fn result_id(entity_type: impl Into<String>) -> Self {
    Self::new(entity_type, TagSlot::ResultId)
  }

  pub fn arg_id(entity_type: impl Into<String>) -> Self {
    Self::new(entity_type, TagSlot::ArgId)
  }

  pub fn arg_page(entity_type: impl Into<String>) -> Self {
    Self::new(entity_type, TagSlot::ArgPage)
  }

  pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
    self.id_field = field.into();
    self
  }

  /// Substitute result/argument values into the template.
  ///
  /// Returns `None` when the value a slot needs is missing.
  pub fn resolve(&self, result: Option<&Value>, args: &Value) -> Option<Tag> {
    let discriminator = match &self.slot {
      TagSlot::Fixed(d) => d.clone(),
      TagSlot::ResultId => Discriminator::Id(
        result
          .and_then(|r| EntityId::from_field(r, &self.id_field))
          .or_else(|| arg_id(args, &self.id_field))?,
      ),
      TagSlot::ArgId => Discriminator::Id(arg_id(args, &self.id_field)?),
      TagSlot::ArgPage => Discriminator::Page(arg_page(args)?),
    };
    Some(Tag::new(self.entity_type.clone(), discriminator))
  }
}

impl From<Tag> for TagTemplate {
  fn from(tag: Tag) -> Self {
    Self::new(tag.entity_type(), TagSlot::Fixed(tag.discriminator().clone()))
  }
}

/// Arguments are either a bare id or an object carrying one.
fn arg_id(args: &Value, id_field: &str) -> Option<EntityId> {
  EntityId::from_value(args).or_else(|| EntityId::from_field(args, id_field))
}

fn arg_page(args: &Value) -> Option<u64> {
  args
    .as_u64()
    .or_else(|| args.get("page").and_then(Value::as_u64))
}

/// Resolve every template, dropping unresolvable ones and duplicates.
pub fn resolve_templates(templates: &[TagTemplate], result: Option<&Value>, args: &Value) -> Vec<Tag> {
  let mut tags: Vec<Tag> = Vec::with_capacity(templates.len());
  for tag in templates.iter().filter_map(|t| t.resolve(result, args)) {
    if !tags.contains(&tag) {
      tags.push(tag);
    }
  }
  tags
}

/// How tags are matched against cache entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvalidationPolicy {
  /// When false, a per-item tag carried by a collection entry only records
  /// membership: invalidating `{E, id}` refetches single-entity entries but
  /// leaves collections of `E` alone unless `{E, List}` is invalidated too.
  pub member_tags_invalidate_collections: bool,
}

/// Per-item tag fanned out onto a collection of the same entity type.
fn is_member_link(store: &CacheStore, tag: &Tag, key: &CacheKey) -> bool {
  matches!(tag.discriminator(), Discriminator::Id(_))
    && store
      .entry(key)
      .is_some_and(|e| e.tags().contains(&Tag::list(tag.entity_type())))
}

/// Keys whose entries depend on any of `tags` under `policy`, sorted.
pub fn affected_keys(store: &CacheStore, tags: &[Tag], policy: InvalidationPolicy) -> Vec<CacheKey> {
  let mut affected: Vec<CacheKey> = if policy.member_tags_invalidate_collections {
    store.tag_index().keys_for(tags).into_iter().collect()
  } else {
    let mut keys = HashSet::new();
    for tag in tags {
      match store.tag_index().lookup(tag) {
        Ok(linked) => keys.extend(
          linked
            .iter()
            .filter(|key| !is_member_link(store, tag, key))
            .cloned(),
        ),
        Err(e) => trace!("{}", e),
      }
    }
    keys.into_iter().collect()
  };
  affected.sort();
  affected
}

/// Mark entries depending on `tags` as stale and drop the unobserved ones.
///
/// Returns the keys that still have subscribers and must be refetched, in a
/// stable order.
pub fn invalidate(store: &mut CacheStore, tags: &[Tag], policy: InvalidationPolicy) -> Vec<CacheKey> {
  let mut refetch = Vec::new();
  for key in affected_keys(store, tags, policy) {
    let observed = store.entry(&key).is_some_and(|e| e.subscribers() > 0);
    if observed {
      store.mark_stale(&key);
      refetch.push(key);
    } else {
      store.remove(&key);
    }
  }
  debug!(tags = tags.len(), refetch = refetch.len(), "invalidated tags");
  refetch
}
