//! Scripted transport for driving the cache layer in tests.

use futures::FutureExt;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use crate::api::{BoxFuture, RequestDescriptor, Transport};
use crate::cache::CacheLayer;
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};

#[derive(Default)]
struct Script {
  /// Answer given to every call of a request unless it is held
  standing: HashMap<String, Result<Value>>,
  /// Calls waiting for the test to release them, oldest first
  held: HashMap<String, VecDeque<oneshot::Receiver<Result<Value>>>>,
  calls: Vec<RequestDescriptor>,
}

/// In-memory transport answering requests by their `METHOD path` line.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
  script: Arc<Mutex<Script>>,
}

/// A held call, completed by the test whenever it chooses.
pub struct Gate {
  tx: oneshot::Sender<Result<Value>>,
}

impl Gate {
  pub fn resolve(self, value: Value) {
    let _ = self.tx.send(Ok(value));
  }

  pub fn reject(self, error: CacheError) {
    let _ = self.tx.send(Err(error));
  }
}

impl ScriptedTransport {
  pub fn new() -> Self {
    Self::default()
  }

  /// Answer every call of `request` with `value`.
  pub fn respond(&self, request: &str, value: Value) {
    self.lock().standing.insert(request.to_string(), Ok(value));
  }

  /// Fail every call of `request` with `error`.
  pub fn fail(&self, request: &str, error: CacheError) {
    self.lock().standing.insert(request.to_string(), Err(error));
  }

  /// Hold the next call of `request` until the returned gate is completed.
  pub fn hold(&self, request: &str) -> Gate {
    let (tx, rx) = oneshot::channel();
    self
      .lock()
      .held
      .entry(request.to_string())
      .or_default()
      .push_back(rx);
    Gate { tx }
  }

  /// How many times `request` was sent.
  pub fn call_count(&self, request: &str) -> usize {
    self
      .lock()
      .calls
      .iter()
      .filter(|c| c.to_string() == request)
      .count()
  }

  pub fn calls(&self) -> Vec<RequestDescriptor> {
    self.lock().calls.clone()
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
    self.script.lock().expect("script lock poisoned")
  }
}

impl Transport for ScriptedTransport {
  fn execute(&self, request: RequestDescriptor) -> BoxFuture<Value> {
    let line = request.to_string();
    let mut script = self.lock();
    script.calls.push(request);

    if let Some(rx) = script.held.get_mut(&line).and_then(VecDeque::pop_front) {
      return async move { rx.await.unwrap_or(Err(CacheError::Cancelled)) }.boxed();
    }
    let answer = script
      .standing
      .get(&line)
      .cloned()
      .unwrap_or_else(|| Err(CacheError::network(format!("no scripted response for {}", line))));
    futures::future::ready(answer).boxed()
  }
}

/// Cache layer over `transport` with default settings, set up by `setup`.
pub fn layer_with<F>(transport: &ScriptedTransport, setup: F) -> CacheLayer
where
  F: FnOnce(&mut CacheLayer),
{
  let mut layer = CacheLayer::new(transport.clone(), &CacheConfig::default());
  setup(&mut layer);
  layer
}
