//! In-memory cache store holding one entry per cache key.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

use super::tags::{Tag, TagIndex};
use super::traits::{CacheKey, EntrySnapshot, QueryStatus};
use crate::error::CacheError;

/// Last known result for one cache key.
#[derive(Debug)]
pub struct CacheEntry {
  key: CacheKey,
  /// Arguments that produced this entry, reused for refetches
  args: Value,
  status: QueryStatus,
  payload: Option<Value>,
  error: Option<CacheError>,
  tags: HashSet<Tag>,
  subscribers: usize,
  is_stale: bool,
  /// Monotonic, bumped on every payload or status change
  revision: u64,
  /// Request id of the newest successful response applied to this entry
  applied_request: Option<u64>,
  in_flight: BTreeSet<u64>,
  released_at: Option<Instant>,
  /// Store-wide epoch of the latest release to zero, so an old eviction
  /// timer can tell it has been overtaken
  release_epoch: u64,
  fulfilled_at: Option<DateTime<Utc>>,
  notifier: watch::Sender<EntrySnapshot>,
}

impl CacheEntry {
  fn new(key: CacheKey, args: Value) -> Self {
    let (notifier, _) = watch::channel(EntrySnapshot::uninitialized());
    Self {
      key,
      args,
      status: QueryStatus::Uninitialized,
      payload: None,
      error: None,
      tags: HashSet::new(),
      subscribers: 0,
      is_stale: false,
      revision: 0,
      applied_request: None,
      in_flight: BTreeSet::new(),
      released_at: None,
      release_epoch: 0,
      fulfilled_at: None,
      notifier,
    }
  }

  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  pub fn args(&self) -> &Value {
    &self.args
  }

  pub fn status(&self) -> QueryStatus {
    self.status
  }

  pub fn payload(&self) -> Option<&Value> {
    self.payload.as_ref()
  }

  pub fn error(&self) -> Option<&CacheError> {
    self.error.as_ref()
  }

  pub fn tags(&self) -> &HashSet<Tag> {
    &self.tags
  }

  pub fn subscribers(&self) -> usize {
    self.subscribers
  }

  pub fn is_stale(&self) -> bool {
    self.is_stale
  }

  pub fn is_fetching(&self) -> bool {
    !self.in_flight.is_empty()
  }

  pub fn revision(&self) -> u64 {
    self.revision
  }

  /// Resolved data that has not been invalidated.
  pub fn is_fresh(&self) -> bool {
    self.status == QueryStatus::Resolved && !self.is_stale
  }

  pub fn snapshot(&self) -> EntrySnapshot {
    EntrySnapshot {
      status: self.status,
      data: self.payload.clone(),
      error: self.error.clone(),
      is_stale: self.is_stale,
      is_fetching: self.is_fetching(),
      revision: self.revision,
      fulfilled_at: self.fulfilled_at,
    }
  }

  fn notify(&self) {
    self.notifier.send_replace(self.snapshot());
  }
}

/// Outcome of releasing one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Released {
  pub remaining: usize,
  /// Epoch to hand back to [`CacheStore::evict_if_due`]
  pub epoch: u64,
}

/// Holds every cache entry and keeps the tag index consistent with them.
#[derive(Debug)]
pub struct CacheStore {
  entries: HashMap<CacheKey, CacheEntry>,
  index: TagIndex,
  /// Grace period between the last release and eviction
  keep_unused_for: Duration,
  /// Source of release epochs; never reset, so timers of a dropped entry
  /// cannot match an entry re-created under the same key
  next_epoch: u64,
}

impl CacheStore {
  pub fn new(keep_unused_for: Duration) -> Self {
    Self {
      entries: HashMap::new(),
      index: TagIndex::new(),
      keep_unused_for,
      next_epoch: 1,
    }
  }

  pub fn keep_unused_for(&self) -> Duration {
    self.keep_unused_for
  }

  pub fn entry(&self, key: &CacheKey) -> Option<&CacheEntry> {
    self.entries.get(key)
  }

  pub fn tag_index(&self) -> &TagIndex {
    &self.index
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
    self.entries.keys()
  }

  /// Return the entry for `key`, creating it in `Uninitialized` state if
  /// needed, and count one more subscriber.
  pub fn get_or_create(&mut self, key: &CacheKey, args: &Value) -> &CacheEntry {
    let entry = self
      .entries
      .entry(key.clone())
      .or_insert_with(|| CacheEntry::new(key.clone(), args.clone()));
    entry.subscribers += 1;
    entry.released_at = None;
    entry
  }

  /// Receiver for live snapshots of `key`.
  pub fn watch(&self, key: &CacheKey) -> Option<watch::Receiver<EntrySnapshot>> {
    self.entries.get(key).map(|e| e.notifier.subscribe())
  }

  /// Drop one subscriber. At zero the entry stays cached until the grace
  /// period runs out.
  pub fn release(&mut self, key: &CacheKey) -> Option<Released> {
    let entry = self.entries.get_mut(key)?;
    entry.subscribers = entry.subscribers.saturating_sub(1);
    if entry.subscribers == 0 {
      entry.released_at = Some(Instant::now());
      entry.release_epoch = self.next_epoch;
      self.next_epoch += 1;
    }
    Some(Released {
      remaining: entry.subscribers,
      epoch: entry.release_epoch,
    })
  }

  /// Record that fetch `request_id` started for `key`.
  pub fn begin_fetch(&mut self, key: &CacheKey, request_id: u64) -> bool {
    let Some(entry) = self.entries.get_mut(key) else {
      return false;
    };
    entry.in_flight.insert(request_id);
    if entry.status == QueryStatus::Uninitialized {
      entry.status = QueryStatus::Loading;
      entry.revision += 1;
    }
    entry.notify();
    true
  }

  /// Forget an in-flight fetch without applying anything, e.g. after abort.
  pub fn cancel_fetch(&mut self, key: &CacheKey, request_id: u64) {
    if let Some(entry) = self.entries.get_mut(key) {
      if entry.in_flight.remove(&request_id) {
        if entry.status == QueryStatus::Loading && entry.in_flight.is_empty() {
          entry.status = QueryStatus::Uninitialized;
          entry.revision += 1;
        }
        entry.notify();
      }
    }
  }

  /// Decide whether the response of `request_id` may be applied.
  ///
  /// A response is rejected when its fetch was not in flight for this entry
  /// or when a later-initiated fetch already succeeded. Failures never block
  /// an older fetch that still succeeds.
  pub fn accept_response(&mut self, key: &CacheKey, request_id: u64, succeeded: bool) -> bool {
    let Some(entry) = self.entries.get_mut(key) else {
      return false;
    };
    if !entry.in_flight.remove(&request_id) {
      return false;
    }
    if entry.applied_request.is_some_and(|applied| applied > request_id) {
      debug!(key = %key, request_id, "discarding response older than applied data");
      entry.notify();
      return false;
    }
    if succeeded {
      entry.applied_request = Some(request_id);
    }
    true
  }

  /// Store `payload` as the entry's data and replace its tag links.
  pub fn resolve(&mut self, key: &CacheKey, payload: Value, tags: Vec<Tag>) -> bool {
    let Some(entry) = self.entries.get_mut(key) else {
      return false;
    };
    let new_tags: HashSet<Tag> = tags.into_iter().collect();

    for stale in entry.tags.difference(&new_tags) {
      self.index.unlink(stale, key);
    }
    for tag in new_tags.difference(&entry.tags) {
      self.index.link(tag.clone(), key);
    }
    entry.tags = new_tags;

    entry.status = QueryStatus::Resolved;
    entry.payload = Some(payload);
    entry.error = None;
    entry.is_stale = false;
    entry.fulfilled_at = Some(Utc::now());
    entry.revision += 1;
    entry.notify();
    true
  }

  /// Record a failed fetch. The last good payload is kept but marked stale.
  pub fn fail(&mut self, key: &CacheKey, error: CacheError) -> bool {
    let Some(entry) = self.entries.get_mut(key) else {
      return false;
    };
    entry.status = QueryStatus::Errored;
    entry.error = Some(error);
    entry.is_stale = entry.payload.is_some();
    entry.revision += 1;
    entry.notify();
    true
  }

  /// Flag data as invalidated without touching the payload.
  pub fn mark_stale(&mut self, key: &CacheKey) -> bool {
    let Some(entry) = self.entries.get_mut(key) else {
      return false;
    };
    entry.is_stale = true;
    entry.notify();
    true
  }

  /// Install a payload produced locally (optimistic patch or its undo).
  /// Returns the entry's new revision.
  pub fn replace_payload(&mut self, key: &CacheKey, payload: Value) -> Option<u64> {
    let entry = self.entries.get_mut(key)?;
    entry.payload = Some(payload);
    entry.revision += 1;
    entry.notify();
    Some(entry.revision)
  }

  /// Drop an entry and every tag link pointing at it.
  pub fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
    let entry = self.entries.remove(key)?;
    for tag in &entry.tags {
      self.index.unlink(tag, key);
    }
    debug!(key = %key, "removed cache entry");
    Some(entry)
  }

  /// Evict `key` if it is still unused since the release that produced `epoch`.
  pub fn evict_if_due(&mut self, key: &CacheKey, epoch: u64) -> bool {
    let due = self
      .entries
      .get(key)
      .is_some_and(|e| e.subscribers == 0 && e.release_epoch == epoch && !e.is_fetching());
    if due {
      self.remove(key);
    }
    due
  }

  /// Epoch and remaining grace of an entry that is released and idle, i.e.
  /// one an eviction timer may still remove.
  pub fn idle_eviction(&self, key: &CacheKey) -> Option<(u64, Duration)> {
    let entry = self.entries.get(key)?;
    if entry.subscribers > 0 || entry.is_fetching() {
      return None;
    }
    let released_at = entry.released_at?;
    Some((
      entry.release_epoch,
      self.keep_unused_for.saturating_sub(released_at.elapsed()),
    ))
  }

  /// Evict every unused entry whose grace period ran out by `now`.
  pub fn collect_garbage(&mut self, now: Instant) -> Vec<CacheKey> {
    let expired: Vec<CacheKey> = self
      .entries
      .values()
      .filter(|e| e.subscribers == 0 && !e.is_fetching())
      .filter(|e| {
        e.released_at
          .is_some_and(|at| now.saturating_duration_since(at) >= self.keep_unused_for)
      })
      .map(|e| e.key.clone())
      .collect();
    for key in &expired {
      self.remove(key);
    }
    expired
  }

  /// Check that the tag index and the entries' tag sets mirror each other.
  pub fn check_consistency(&self) -> bool {
    let forward = self.index.iter().all(|(tag, keys)| {
      !keys.is_empty()
        && keys
          .iter()
          .all(|k| self.entries.get(k).is_some_and(|e| e.tags.contains(tag)))
    });
    let backward = self
      .entries
      .values()
      .all(|e| e.tags.iter().all(|t| self.index.contains(t, &e.key)));
    forward && backward
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn store() -> CacheStore {
    CacheStore::new(Duration::from_secs(60))
  }

  fn key(id: &str) -> CacheKey {
    CacheKey::new("items.get", &json!(id))
  }

  #[test]
  fn test_get_or_create_counts_subscribers() {
    let mut store = store();
    let k = key("1");
    assert_eq!(store.get_or_create(&k, &json!("1")).status(), QueryStatus::Uninitialized);
    assert_eq!(store.get_or_create(&k, &json!("1")).subscribers(), 2);
    assert_eq!(store.len(), 1);
  }

  #[test]
  fn test_release_keeps_entry_until_collected() {
    let mut store = CacheStore::new(Duration::ZERO);
    let k = key("1");
    store.get_or_create(&k, &json!("1"));
    let released = store.release(&k).unwrap();
    assert_eq!(released.remaining, 0);
    assert!(store.entry(&k).is_some());

    assert_eq!(store.collect_garbage(Instant::now()), vec![k.clone()]);
    assert!(store.entry(&k).is_none());
  }

  #[test]
  fn test_resubscribe_overtakes_eviction() {
    let mut store = store();
    let k = key("1");
    store.get_or_create(&k, &json!("1"));
    let released = store.release(&k).unwrap();
    store.get_or_create(&k, &json!("1"));
    assert!(!store.evict_if_due(&k, released.epoch));

    let again = store.release(&k).unwrap();
    assert!(!store.evict_if_due(&k, released.epoch));
    assert!(store.evict_if_due(&k, again.epoch));
  }

  #[test]
  fn test_resolve_replaces_tags() {
    let mut store = store();
    let k = CacheKey::new("items.list", &json!({}));
    store.get_or_create(&k, &json!({}));
    store.resolve(
      &k,
      json!([{"id": 1}, {"id": 2}]),
      vec![Tag::list("Item"), Tag::id("Item", "1"), Tag::id("Item", "2")],
    );
    store.resolve(
      &k,
      json!([{"id": 2}, {"id": 3}]),
      vec![Tag::list("Item"), Tag::id("Item", "2"), Tag::id("Item", "3")],
    );

    let index = store.tag_index();
    assert!(index.lookup(&Tag::id("Item", "1")).is_err());
    assert!(index.contains(&Tag::id("Item", "3"), &k));
    assert_eq!(store.entry(&k).unwrap().tags().len(), 3);
    assert!(store.check_consistency());
  }

  #[test]
  fn test_repeated_resolve_is_idempotent() {
    let mut store = store();
    let k = key("1");
    store.get_or_create(&k, &json!("1"));
    let tags = vec![Tag::id("Item", "1"), Tag::list("Item")];
    store.resolve(&k, json!({"id": 1}), tags.clone());
    let before: Vec<usize> = tags
      .iter()
      .map(|t| store.tag_index().lookup(t).unwrap().len())
      .collect();
    store.resolve(&k, json!({"id": 1}), tags.clone());
    let after: Vec<usize> = tags
      .iter()
      .map(|t| store.tag_index().lookup(t).unwrap().len())
      .collect();
    assert_eq!(before, after);
    assert_eq!(store.tag_index().len(), 2);
    assert!(store.check_consistency());
  }

  #[test]
  fn test_fail_keeps_last_good_payload() {
    let mut store = store();
    let k = key("1");
    store.get_or_create(&k, &json!("1"));
    store.resolve(&k, json!({"id": 1, "name": "a"}), vec![Tag::id("Item", "1")]);
    store.fail(&k, CacheError::network("timeout"));

    let entry = store.entry(&k).unwrap();
    assert_eq!(entry.status(), QueryStatus::Errored);
    assert_eq!(entry.payload(), Some(&json!({"id": 1, "name": "a"})));
    assert!(entry.is_stale());
    assert!(!entry.is_fresh());
    assert!(store.tag_index().contains(&Tag::id("Item", "1"), &k));
  }

  #[test]
  fn test_older_response_is_rejected() {
    let mut store = store();
    let k = key("1");
    store.get_or_create(&k, &json!("1"));
    store.begin_fetch(&k, 1);
    store.begin_fetch(&k, 2);
    assert!(store.accept_response(&k, 2, true));
    assert!(!store.accept_response(&k, 1, true));
    assert!(!store.entry(&k).unwrap().is_fetching());
    // Unknown request ids are never applied
    assert!(!store.accept_response(&k, 3, true));
  }

  #[test]
  fn test_newer_failure_does_not_block_older_success() {
    let mut store = store();
    let k = key("1");
    store.get_or_create(&k, &json!("1"));
    store.begin_fetch(&k, 1);
    store.begin_fetch(&k, 2);
    store.begin_fetch(&k, 3);
    assert!(store.accept_response(&k, 3, false));
    assert!(store.accept_response(&k, 1, true));
    store.resolve(&k, json!({"id": 1}), vec![]);

    // Fetch 2 started after the applied success, so its failure still counts
    assert!(store.accept_response(&k, 2, false));
    assert_eq!(store.entry(&k).unwrap().payload(), Some(&json!({"id": 1})));
  }

  #[test]
  fn test_failure_older_than_applied_success_is_rejected() {
    let mut store = store();
    let k = key("1");
    store.get_or_create(&k, &json!("1"));
    store.begin_fetch(&k, 1);
    store.begin_fetch(&k, 2);
    assert!(store.accept_response(&k, 2, true));
    assert!(!store.accept_response(&k, 1, false));
    assert!(!store.entry(&k).unwrap().is_fetching());
  }

  #[test]
  fn test_release_epochs_survive_entry_removal() {
    let mut store = store();
    let k = key("1");
    store.get_or_create(&k, &json!("1"));
    let first = store.release(&k).unwrap();
    store.remove(&k);

    store.get_or_create(&k, &json!("1"));
    let second = store.release(&k).unwrap();
    assert_ne!(first.epoch, second.epoch);
    assert!(!store.evict_if_due(&k, first.epoch));
    assert!(store.entry(&k).is_some());
    assert!(store.evict_if_due(&k, second.epoch));
  }

  #[test]
  fn test_subscribers_see_every_write() {
    let mut store = store();
    let k = key("1");
    store.get_or_create(&k, &json!("1"));
    let mut rx = store.watch(&k).unwrap();
    store.resolve(&k, json!({"id": 1}), vec![]);
    assert!(rx.has_changed().unwrap());
    let snapshot = rx.borrow_and_update().clone();
    assert_eq!(snapshot.status, QueryStatus::Resolved);
    assert_eq!(snapshot.data, Some(json!({"id": 1})));
  }

  #[test]
  fn test_remove_unlinks_tags() {
    let mut store = store();
    let k = key("1");
    store.get_or_create(&k, &json!("1"));
    store.resolve(&k, json!({}), vec![Tag::id("Item", "1")]);
    store.remove(&k);
    assert!(store.tag_index().is_empty());
    assert!(store.check_consistency());
  }
}
