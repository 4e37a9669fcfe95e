//! Declarations of query and mutation operations.
//!
//! A definition tells the cache how to turn arguments into a request and
//! which tags a result provides or invalidates. It never performs I/O.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use super::api_types::RequestDescriptor;
use crate::cache::{resolve_templates, Tag, TagTemplate};
use crate::error::Result;

/// Builds the request for one set of arguments.
pub type RequestFn = Arc<dyn Fn(&Value) -> Result<RequestDescriptor> + Send + Sync>;

/// Computes tags from (result, arguments). Failure producers see `Value::Null`
/// as the result.
pub type TagProducer = Arc<dyn Fn(&Value, &Value) -> Vec<Tag> + Send + Sync>;

/// Maps mutation arguments to the arguments of the query entry to patch.
pub type TargetArgsFn = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

/// Applies a mutation's arguments to a draft of a cached payload.
pub type PatchFn = Arc<dyn Fn(&Value, &mut Value) + Send + Sync>;

/// Tag producer that resolves a fixed list of templates.
pub fn from_templates(templates: Vec<TagTemplate>) -> TagProducer {
  Arc::new(move |result, args| {
    let result = (!result.is_null()).then_some(result);
    resolve_templates(&templates, result, args)
  })
}

fn no_tags() -> TagProducer {
  Arc::new(|_, _| Vec::new())
}

/// A read operation whose results are cached.
#[derive(Clone)]
pub struct QueryDefinition {
  name: String,
  request: RequestFn,
  provides: TagProducer,
}

impl QueryDefinition {
  pub fn new<F>(name: impl Into<String>, request: F) -> Self
  where
    F: Fn(&Value) -> Result<RequestDescriptor> + Send + Sync + 'static,
  {
    Self {
      name: name.into(),
      request: Arc::new(request),
      provides: no_tags(),
    }
  }

  /// Tags attached to the cache entry each time it resolves.
  pub fn provides<F>(mut self, producer: F) -> Self
  where
    F: Fn(&Value, &Value) -> Vec<Tag> + Send + Sync + 'static,
  {
    self.provides = Arc::new(producer);
    self
  }

  pub fn provides_templates(mut self, templates: Vec<TagTemplate>) -> Self {
    self.provides = from_templates(templates);
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn request(&self, args: &Value) -> Result<RequestDescriptor> {
    (self.request)(args)
  }

  pub fn tags(&self, result: &Value, args: &Value) -> Vec<Tag> {
    (self.provides)(result, args)
  }
}

impl fmt::Debug for QueryDefinition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryDefinition")
      .field("name", &self.name)
      .finish_non_exhaustive()
  }
}

/// Speculative patch a mutation applies to a query entry before it settles.
#[derive(Clone)]
pub struct OptimisticUpdate {
  /// Name of the query whose entry is patched
  pub query: String,
  pub target_args: TargetArgsFn,
  pub patch: PatchFn,
}

impl OptimisticUpdate {
  pub fn new<A, P>(query: impl Into<String>, target_args: A, patch: P) -> Self
  where
    A: Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    P: Fn(&Value, &mut Value) + Send + Sync + 'static,
  {
    Self {
      query: query.into(),
      target_args: Arc::new(target_args),
      patch: Arc::new(patch),
    }
  }
}

impl fmt::Debug for OptimisticUpdate {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("OptimisticUpdate")
      .field("query", &self.query)
      .finish_non_exhaustive()
  }
}

/// A write operation. Invalidates tags once its response is observed.
#[derive(Clone)]
pub struct MutationDefinition {
  name: String,
  request: RequestFn,
  invalidates: TagProducer,
  invalidates_on_failure: TagProducer,
  optimistic: Vec<OptimisticUpdate>,
}

impl MutationDefinition {
  pub fn new<F>(name: impl Into<String>, request: F) -> Self
  where
    F: Fn(&Value) -> Result<RequestDescriptor> + Send + Sync + 'static,
  {
    Self {
      name: name.into(),
      request: Arc::new(request),
      invalidates: no_tags(),
      invalidates_on_failure: no_tags(),
      optimistic: Vec::new(),
    }
  }

  /// Tags invalidated after a successful response.
  pub fn invalidates<F>(mut self, producer: F) -> Self
  where
    F: Fn(&Value, &Value) -> Vec<Tag> + Send + Sync + 'static,
  {
    self.invalidates = Arc::new(producer);
    self
  }

  pub fn invalidates_templates(mut self, templates: Vec<TagTemplate>) -> Self {
    self.invalidates = from_templates(templates);
    self
  }

  /// Tags invalidated even when the mutation fails.
  pub fn invalidates_on_failure_templates(mut self, templates: Vec<TagTemplate>) -> Self {
    self.invalidates_on_failure = from_templates(templates);
    self
  }

  pub fn optimistic(mut self, update: OptimisticUpdate) -> Self {
    self.optimistic.push(update);
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn request(&self, args: &Value) -> Result<RequestDescriptor> {
    (self.request)(args)
  }

  /// Tags to invalidate for a settled mutation.
  pub fn invalidated_tags(&self, result: Option<&Value>, args: &Value) -> Vec<Tag> {
    match result {
      Some(result) => (self.invalidates)(result, args),
      None => (self.invalidates_on_failure)(&Value::Null, args),
    }
  }

  pub fn optimistic_updates(&self) -> &[OptimisticUpdate] {
    &self.optimistic
  }
}

impl fmt::Debug for MutationDefinition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MutationDefinition")
      .field("name", &self.name)
      .field("optimistic", &self.optimistic)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_mutation_tags_depend_on_outcome() {
    let def = MutationDefinition::new("users.delete", |args| {
      Ok(RequestDescriptor::delete(format!("users/{}", args)))
    })
    .invalidates_templates(vec![TagTemplate::arg_id("User"), TagTemplate::list("User")])
    .invalidates_on_failure_templates(vec![TagTemplate::arg_id("User")]);

    assert_eq!(
      def.invalidated_tags(Some(&Value::Null), &json!("2")),
      vec![Tag::id("User", "2"), Tag::list("User")]
    );
    assert_eq!(def.invalidated_tags(None, &json!("2")), vec![Tag::id("User", "2")]);
  }

  #[test]
  fn test_query_tags() {
    let def = QueryDefinition::new("users.get", |args| {
      Ok(RequestDescriptor::get(format!("users/{}", args)))
    })
    .provides_templates(vec![TagTemplate::result_id("User")]);
    assert_eq!(
      def.tags(&json!({"id": 3}), &json!("3")),
      vec![Tag::id("User", "3")]
    );
  }
}
