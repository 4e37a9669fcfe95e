//! Cache layer that orchestrates caching logic with network fetching.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::invalidation::{self, InvalidationPolicy};
use super::optimistic::{self, OptimisticPatch};
use super::storage::CacheStore;
use super::subscription::Subscription;
use super::tags::Tag;
use super::traits::CacheKey;
use crate::api::{MutationDefinition, QueryDefinition, Transport};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::event::{CacheEvent, EventHandler};
use crate::query::Query;

struct InFlightFetch {
  key: CacheKey,
  abort: AbortHandle,
}

/// A mutation whose network call has not settled yet.
struct PendingMutation {
  operation: String,
  args: Value,
  /// Patches in application order
  patches: Vec<OptimisticPatch>,
  reply: Option<oneshot::Sender<Result<Value>>>,
}

/// Caller side of a triggered mutation.
#[derive(Debug)]
pub struct MutationHandle {
  id: u64,
  patched: usize,
  rx: oneshot::Receiver<Result<Value>>,
}

impl MutationHandle {
  pub fn id(&self) -> u64 {
    self.id
  }

  /// Number of optimistic patches installed when the mutation was triggered.
  pub fn patched(&self) -> usize {
    self.patched
  }

  /// Outcome if the mutation already settled. Never blocks.
  pub fn try_outcome(&mut self) -> Option<Result<Value>> {
    match self.rx.try_recv() {
      Ok(result) => Some(result),
      Err(oneshot::error::TryRecvError::Empty) => None,
      Err(oneshot::error::TryRecvError::Closed) => Some(Err(CacheError::Cancelled)),
    }
  }

  /// Wait for the network outcome. The layer's events must keep being
  /// processed for this to complete.
  pub async fn outcome(self) -> Result<Value> {
    self.rx.await.unwrap_or(Err(CacheError::Cancelled))
  }
}

/// Cache layer that manages caching logic and network fetching.
///
/// The layer is owned by a single event loop. Network calls run on spawned
/// tasks which never touch cache state; they post a [`CacheEvent`] when they
/// settle, and the owner applies it through [`poll`](Self::poll),
/// [`next_event`](Self::next_event) or [`settle`](Self::settle). Every state
/// change therefore happens between two awaits, without locks.
///
/// Methods that start network calls must run inside a tokio runtime.
pub struct CacheLayer {
  transport: Arc<dyn Transport>,
  store: CacheStore,
  queries: HashMap<String, QueryDefinition>,
  mutations: HashMap<String, MutationDefinition>,
  events: EventHandler,
  fetches: HashMap<u64, InFlightFetch>,
  pending: HashMap<u64, PendingMutation>,
  next_request_id: u64,
  policy: InvalidationPolicy,
}

impl CacheLayer {
  /// Create a new cache layer over the given transport.
  pub fn new<T: Transport + 'static>(transport: T, config: &CacheConfig) -> Self {
    Self {
      transport: Arc::new(transport),
      store: CacheStore::new(config.keep_unused_for()),
      queries: HashMap::new(),
      mutations: HashMap::new(),
      events: EventHandler::new(),
      fetches: HashMap::new(),
      pending: HashMap::new(),
      next_request_id: 1,
      policy: InvalidationPolicy {
        member_tags_invalidate_collections: config.member_tags_invalidate_collections,
      },
    }
  }

  pub fn register_query(&mut self, definition: QueryDefinition) {
    self.queries.insert(definition.name().to_string(), definition);
  }

  pub fn register_mutation(&mut self, definition: MutationDefinition) {
    self.mutations.insert(definition.name().to_string(), definition);
  }

  pub fn store(&self) -> &CacheStore {
    &self.store
  }

  /// Number of mutations still waiting on the network.
  pub fn pending_mutations(&self) -> usize {
    self.pending.len()
  }

  /// Number of query fetches in flight.
  pub fn fetches_in_flight(&self) -> usize {
    self.fetches.len()
  }

  fn next_id(&mut self) -> u64 {
    let id = self.next_request_id;
    self.next_request_id += 1;
    id
  }

  // ==========================================================================
  // Queries
  // ==========================================================================

  /// Subscribe to `operation(args)`.
  ///
  /// The first subscriber of a key starts its fetch; later subscribers share
  /// the entry. An idle entry that is stale or errored is refetched.
  pub fn subscribe<A: Serialize + ?Sized>(&mut self, operation: &str, args: &A) -> Result<Subscription> {
    if !self.queries.contains_key(operation) {
      return Err(CacheError::UnknownOperation(operation.to_string()));
    }
    let (key, args) = CacheKey::from_args(operation, args)?;

    let entry = self.store.get_or_create(&key, &args);
    let needs_fetch = !entry.is_fetching() && !entry.is_fresh();
    if needs_fetch {
      self.start_fetch(&key);
    }

    let rx = self
      .store
      .watch(&key)
      .ok_or_else(|| CacheError::UnknownOperation(key.to_string()))?;
    Ok(Subscription::new(key, rx, self.events.sender()))
  }

  /// Subscribe and wrap the subscription in a typed [`Query`].
  pub fn query<T, A>(&mut self, operation: &str, args: &A) -> Result<Query<T>>
  where
    T: DeserializeOwned,
    A: Serialize + ?Sized,
  {
    Ok(Query::new(self.subscribe(operation, args)?))
  }

  /// Release a subscription right away.
  pub fn unsubscribe(&mut self, mut subscription: Subscription) {
    subscription.disarm();
    self.release(subscription.key());
  }

  /// Drop one subscriber of `key`.
  ///
  /// When the last one goes, in-flight fetches are aborted and eviction is
  /// scheduled after the grace period.
  pub fn release(&mut self, key: &CacheKey) {
    let Some(released) = self.store.release(key) else {
      return;
    };
    if released.remaining > 0 {
      return;
    }

    let cancelled: Vec<u64> = self
      .fetches
      .iter()
      .filter(|(_, f)| &f.key == key)
      .map(|(id, _)| *id)
      .collect();
    for request_id in cancelled {
      if let Some(fetch) = self.fetches.remove(&request_id) {
        fetch.abort.abort();
        self.store.cancel_fetch(key, request_id);
        debug!(key = %key, request_id, "cancelled fetch without subscribers");
      }
    }

    self.schedule_eviction(key, released.epoch, self.store.keep_unused_for());
  }

  fn schedule_eviction(&self, key: &CacheKey, epoch: u64, delay: Duration) {
    let tx = self.events.sender();
    let key = key.clone();
    tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      let _ = tx.send(CacheEvent::EvictionDue { key, epoch });
    });
  }

  /// Re-arm eviction for an unused entry whose timer fired while a fetch
  /// kept it alive.
  fn reschedule_idle_eviction(&self, key: &CacheKey) {
    if let Some((epoch, remaining)) = self.store.idle_eviction(key) {
      debug!(key = %key, ?remaining, "rescheduling eviction after fetch");
      self.schedule_eviction(key, epoch, remaining);
    }
  }

  /// Start another fetch of `key` even if one is in flight.
  ///
  /// Returns the request id, or `None` if the key is not cached or its
  /// request could not be built (the failure is stored on the entry).
  pub fn refetch(&mut self, key: &CacheKey) -> Option<u64> {
    self.start_fetch(key)
  }

  fn start_fetch(&mut self, key: &CacheKey) -> Option<u64> {
    let args = self.store.entry(key)?.args().clone();
    let Some(definition) = self.queries.get(key.operation()) else {
      self
        .store
        .fail(key, CacheError::UnknownOperation(key.operation().to_string()));
      return None;
    };
    let request = match definition.request(&args) {
      Ok(request) => request,
      Err(e) => {
        warn!(key = %key, error = %e, "could not build request");
        self.store.fail(key, e);
        return None;
      }
    };

    let request_id = self.next_id();
    let hash = key.cache_hash();
    debug!(key = %key, hash = &hash[..12], request_id, request = %request, "fetching");

    let future = self.transport.execute(request);
    let tx = self.events.sender();
    let task_key = key.clone();
    let handle = tokio::spawn(async move {
      let result = future.await;
      // Ignore send errors - the layer may have been dropped
      let _ = tx.send(CacheEvent::QueryFinished {
        key: task_key,
        request_id,
        result,
      });
    });

    self.fetches.insert(
      request_id,
      InFlightFetch {
        key: key.clone(),
        abort: handle.abort_handle(),
      },
    );
    self.store.begin_fetch(key, request_id);
    Some(request_id)
  }

  fn finish_fetch(&mut self, key: CacheKey, request_id: u64, result: Result<Value>) {
    if self.fetches.remove(&request_id).is_none() {
      debug!(key = %key, request_id, "ignoring response of cancelled fetch");
      return;
    }
    if self.store.accept_response(&key, request_id, result.is_ok()) {
      self.apply_response(&key, request_id, result);
    }
    self.reschedule_idle_eviction(&key);
  }

  fn apply_response(&mut self, key: &CacheKey, request_id: u64, result: Result<Value>) {
    match result {
      Ok(payload) => {
        let tags = match (self.store.entry(key), self.queries.get(key.operation())) {
          (Some(entry), Some(definition)) => definition.tags(&payload, entry.args()),
          _ => Vec::new(),
        };
        debug!(key = %key, request_id, tags = tags.len(), "resolved");
        self.store.resolve(key, payload, tags);
      }
      Err(e) => {
        debug!(key = %key, request_id, error = %e, "fetch failed");
        self.store.fail(key, e);
      }
    }
  }

  // ==========================================================================
  // Invalidation
  // ==========================================================================

  /// Invalidate every entry depending on `tags`.
  ///
  /// Observed entries are marked stale and refetched with their original
  /// arguments; unobserved ones are dropped. Returns the refetched keys.
  pub fn invalidate(&mut self, tags: &[Tag]) -> Vec<CacheKey> {
    let refetch = invalidation::invalidate(&mut self.store, tags, self.policy);
    for key in &refetch {
      self.start_fetch(key);
    }
    refetch
  }

  // ==========================================================================
  // Mutations and optimistic updates
  // ==========================================================================

  /// Start `operation(args)`.
  ///
  /// Declared optimistic updates are applied before this returns. Tag
  /// invalidation waits for the network response.
  pub fn trigger<A: Serialize + ?Sized>(&mut self, operation: &str, args: &A) -> Result<MutationHandle> {
    let definition = self
      .mutations
      .get(operation)
      .cloned()
      .ok_or_else(|| CacheError::UnknownOperation(operation.to_string()))?;
    let args = serde_json::to_value(args)?;
    let request = definition.request(&args)?;

    let mut patches = Vec::new();
    for update in definition.optimistic_updates() {
      let Some(target) = (update.target_args)(&args) else {
        continue;
      };
      let key = CacheKey::new(update.query.as_str(), &target);
      let patch_fn = Arc::clone(&update.patch);
      if let Some(patch) = optimistic::begin_optimistic(&mut self.store, &key, |draft| patch_fn(&args, draft)) {
        patches.push(patch);
      }
    }

    let mutation_id = self.next_id();
    debug!(operation, mutation_id, request = %request, patched = patches.len(), "triggering mutation");

    let future = self.transport.execute(request);
    let tx = self.events.sender();
    tokio::spawn(async move {
      let result = future.await;
      let _ = tx.send(CacheEvent::MutationFinished { mutation_id, result });
    });

    let (reply, rx) = oneshot::channel();
    let patched = patches.len();
    self.pending.insert(
      mutation_id,
      PendingMutation {
        operation: operation.to_string(),
        args,
        patches,
        reply: Some(reply),
      },
    );
    Ok(MutationHandle {
      id: mutation_id,
      patched,
      rx,
    })
  }

  /// Trigger a mutation and process events until it settles.
  pub async fn mutate<A: Serialize + ?Sized>(&mut self, operation: &str, args: &A) -> Result<Value> {
    let mut handle = self.trigger(operation, args)?;
    loop {
      if let Some(outcome) = handle.try_outcome() {
        return outcome;
      }
      if !self.next_event().await {
        return Err(CacheError::Cancelled);
      }
    }
  }

  /// Patch `key`'s cached payload ahead of a network result.
  pub fn begin_optimistic<F>(&mut self, key: &CacheKey, patch: F) -> Option<OptimisticPatch>
  where
    F: FnOnce(&mut Value),
  {
    optimistic::begin_optimistic(&mut self.store, key, patch)
  }

  /// Roll back a patch. Returns false when a newer write superseded it.
  pub fn undo(&mut self, patch: OptimisticPatch) -> bool {
    match patch.undo(&mut self.store) {
      Ok(()) => true,
      Err(e) => {
        debug!("{}", e);
        false
      }
    }
  }

  /// Attach an extra optimistic patch to a pending mutation; it is rolled
  /// back if the mutation fails. Returns false if nothing was patched.
  pub fn attach_optimistic<F>(&mut self, mutation_id: u64, key: &CacheKey, patch: F) -> bool
  where
    F: FnOnce(&mut Value),
  {
    if !self.pending.contains_key(&mutation_id) {
      return false;
    }
    let Some(patch) = optimistic::begin_optimistic(&mut self.store, key, patch) else {
      return false;
    };
    if let Some(pending) = self.pending.get_mut(&mutation_id) {
      pending.patches.push(patch);
    }
    true
  }

  /// Roll back every optimistic patch of a pending mutation now, without
  /// waiting for its outcome. Returns how many patches were restored.
  pub fn detach_optimistic(&mut self, mutation_id: u64) -> usize {
    let Some(pending) = self.pending.get_mut(&mutation_id) else {
      return 0;
    };
    let patches = std::mem::take(&mut pending.patches);
    self.rollback(patches)
  }

  fn rollback(&mut self, patches: Vec<OptimisticPatch>) -> usize {
    let mut restored = 0;
    // Newest first, so each undo finds its own revision still current
    for patch in patches.into_iter().rev() {
      if self.undo(patch) {
        restored += 1;
      }
    }
    restored
  }

  fn finish_mutation(&mut self, mutation_id: u64, result: Result<Value>) {
    let Some(mut pending) = self.pending.remove(&mutation_id) else {
      return;
    };
    let Some(definition) = self.mutations.get(&pending.operation).cloned() else {
      return;
    };

    let tags = match &result {
      Ok(value) => definition.invalidated_tags(Some(value), &pending.args),
      Err(e) => {
        debug!(operation = %pending.operation, mutation_id, error = %e, "mutation failed");
        let patches = std::mem::take(&mut pending.patches);
        self.rollback(patches);
        definition.invalidated_tags(None, &pending.args)
      }
    };
    if !tags.is_empty() {
      self.invalidate(&tags);
    }

    if let Some(reply) = pending.reply.take() {
      let _ = reply.send(result);
    }
  }

  // ==========================================================================
  // Event processing
  // ==========================================================================

  /// Apply one event.
  pub fn process(&mut self, event: CacheEvent) {
    match event {
      CacheEvent::QueryFinished {
        key,
        request_id,
        result,
      } => self.finish_fetch(key, request_id, result),
      CacheEvent::MutationFinished { mutation_id, result } => {
        self.finish_mutation(mutation_id, result)
      }
      CacheEvent::Released(key) => self.release(&key),
      CacheEvent::EvictionDue { key, epoch } => {
        if self.store.evict_if_due(&key, epoch) {
          debug!(key = %key, "evicted unused entry");
        }
      }
    }
  }

  /// Apply every queued event without waiting.
  ///
  /// Returns `true` if anything was applied. Call this in your event loop
  /// tick handler.
  pub fn poll(&mut self) -> bool {
    let mut changed = false;
    while let Some(event) = self.events.try_next() {
      self.process(event);
      changed = true;
    }
    changed
  }

  /// Wait for the next event and apply it.
  pub async fn next_event(&mut self) -> bool {
    match self.events.next().await {
      Some(event) => {
        self.process(event);
        true
      }
      None => false,
    }
  }

  /// Process events until no fetch or mutation is in flight.
  pub async fn settle(&mut self) {
    self.poll();
    while !self.fetches.is_empty() || !self.pending.is_empty() {
      if !self.next_event().await {
        break;
      }
    }
    self.poll();
  }

  /// Evict every unused entry whose grace period already ran out.
  pub fn collect_garbage(&mut self) -> Vec<CacheKey> {
    self.store.collect_garbage(Instant::now())
  }
}
