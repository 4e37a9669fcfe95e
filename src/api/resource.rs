//! Standard CRUD operations over one REST resource.
//!
//! Every resource gets the same five operations, named `<name>.<verb>`:
//!
//! | operation | request | tags |
//! |---|---|---|
//! | `list`   | `GET path` (`?page=n` when paginated) | provides `List`, `Page(n)`, `Id` per item |
//! | `get`    | `GET path/{id}` | provides `Id` |
//! | `create` | `POST path` | invalidates `List` |
//! | `update` | `PATCH path/{id}` | invalidates `Id`, `List`; patches `get` optimistically |
//! | `delete` | `DELETE path/{id}` | invalidates `Id`, `List` on success |

use serde::Deserialize;
use serde_json::{Map, Value};

use super::api_types::RequestDescriptor;
use super::endpoints::{MutationDefinition, OptimisticUpdate, QueryDefinition};
use crate::cache::{CacheLayer, EntityId, Tag, TagTemplate};
use crate::error::{CacheError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Resource {
  /// Prefix of the operation names, e.g. `users`
  pub name: String,
  /// Entity type used in tags, e.g. `User`
  pub entity_type: String,
  /// Path relative to the API base URL
  pub path: String,
  #[serde(default = "default_id_field")]
  pub id_field: String,
  /// Field of a list response holding the items; the response itself when unset
  #[serde(default)]
  pub items_field: Option<String>,
  #[serde(default)]
  pub paginated: bool,
}

fn default_id_field() -> String {
  "id".to_string()
}

impl Resource {
  pub fn new(name: impl Into<String>, entity_type: impl Into<String>, path: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      entity_type: entity_type.into(),
      path: path.into(),
      id_field: default_id_field(),
      items_field: None,
      paginated: false,
    }
  }

  pub fn with_items_field(mut self, field: impl Into<String>) -> Self {
    self.items_field = Some(field.into());
    self
  }

  pub fn paginated(mut self) -> Self {
    self.paginated = true;
    self
  }

  pub fn operation(&self, verb: &str) -> String {
    format!("{}.{}", self.name, verb)
  }

  /// Arguments of the `get` operation for `id`.
  ///
  /// Ids are cached as strings, so `get` entries patched by `update` line up
  /// with the ones subscribed through this helper.
  pub fn get_args(id: impl Into<EntityId>) -> Value {
    Value::String(id.into().as_str().to_string())
  }

  /// Arguments of the `list` operation.
  pub fn list_args(page: Option<u64>) -> Value {
    match page {
      Some(page) => serde_json::json!({ "page": page }),
      None => Value::Object(Map::new()),
    }
  }

  /// Register every operation of this resource on `layer`.
  pub fn register(&self, layer: &mut CacheLayer) {
    for query in self.queries() {
      layer.register_query(query);
    }
    for mutation in self.mutations() {
      layer.register_mutation(mutation);
    }
  }

  pub fn queries(&self) -> Vec<QueryDefinition> {
    vec![self.list_query(), self.get_query()]
  }

  pub fn mutations(&self) -> Vec<MutationDefinition> {
    vec![
      self.create_mutation(),
      self.update_mutation(),
      self.delete_mutation(),
    ]
  }

  fn id_of(&self, args: &Value) -> Result<EntityId> {
    EntityId::from_value(args)
      .or_else(|| EntityId::from_field(args, &self.id_field))
      .ok_or_else(|| {
        CacheError::Serialization(format!("{} arguments carry no {}", self.name, self.id_field))
      })
  }

  fn item_path(&self, id: &EntityId) -> String {
    format!("{}/{}", self.path.trim_end_matches('/'), id)
  }

  /// The entity list inside a list response.
  fn items<'a>(&self, result: &'a Value) -> &'a [Value] {
    let list = match &self.items_field {
      Some(field) => result.get(field),
      None => Some(result),
    };
    list
      .and_then(Value::as_array)
      .map(Vec::as_slice)
      .unwrap_or_default()
  }

  fn list_query(&self) -> QueryDefinition {
    let this = self.clone();
    let provider = self.clone();
    QueryDefinition::new(self.operation("list"), move |args| {
      let mut request = RequestDescriptor::get(this.path.clone());
      if this.paginated {
        if let Some(page) = args.get("page").and_then(Value::as_u64) {
          request = request.with_query("page", page);
        }
      }
      Ok(request)
    })
    .provides(move |result, args| {
      let entity = provider.entity_type.as_str();
      let mut tags = vec![Tag::list(entity)];
      if let Some(page) = args.get("page").and_then(Value::as_u64) {
        tags.push(Tag::page(entity, page));
      }
      tags.extend(
        provider
          .items(result)
          .iter()
          .filter_map(|item| EntityId::from_field(item, &provider.id_field))
          .map(|id| Tag::id(entity, id)),
      );
      tags
    })
  }

  fn get_query(&self) -> QueryDefinition {
    let this = self.clone();
    QueryDefinition::new(self.operation("get"), move |args| {
      Ok(RequestDescriptor::get(this.item_path(&this.id_of(args)?)))
    })
    .provides_templates(vec![
      TagTemplate::result_id(self.entity_type.as_str()).with_id_field(self.id_field.as_str())
    ])
  }

  fn create_mutation(&self) -> MutationDefinition {
    let this = self.clone();
    MutationDefinition::new(self.operation("create"), move |args| {
      Ok(RequestDescriptor::post(this.path.clone(), args.clone()))
    })
    .invalidates_templates(vec![TagTemplate::list(self.entity_type.as_str())])
  }

  /// Arguments are the entity's id field plus the fields to change.
  fn update_mutation(&self) -> MutationDefinition {
    let this = self.clone();
    let id_field = self.id_field.clone();
    let target = self.clone();
    MutationDefinition::new(self.operation("update"), move |args| {
      let id = this.id_of(args)?;
      Ok(RequestDescriptor::patch(this.item_path(&id), changes(args, &this.id_field)))
    })
    .invalidates_templates(vec![
      TagTemplate::arg_id(self.entity_type.as_str()).with_id_field(self.id_field.as_str()),
      TagTemplate::list(self.entity_type.as_str()),
    ])
    .optimistic(OptimisticUpdate::new(
      self.operation("get"),
      move |args| target.id_of(args).ok().map(Resource::get_args),
      move |args, draft| {
        if let (Some(draft), Value::Object(fields)) = (draft.as_object_mut(), changes(args, &id_field)) {
          draft.extend(fields);
        }
      },
    ))
  }

  fn delete_mutation(&self) -> MutationDefinition {
    let this = self.clone();
    MutationDefinition::new(self.operation("delete"), move |args| {
      Ok(RequestDescriptor::delete(this.item_path(&this.id_of(args)?)))
    })
    .invalidates_templates(vec![
      TagTemplate::arg_id(self.entity_type.as_str()).with_id_field(self.id_field.as_str()),
      TagTemplate::list(self.entity_type.as_str()),
    ])
  }
}

/// Update arguments without the id field.
fn changes(args: &Value, id_field: &str) -> Value {
  match args {
    Value::Object(fields) => Value::Object(
      fields
        .iter()
        .filter(|(name, _)| name.as_str() != id_field)
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect(),
    ),
    _ => Value::Object(Map::new()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::Method;
  use crate::test_utils::{layer_with, ScriptedTransport};
  use serde_json::json;

  fn users() -> Resource {
    Resource::new("users", "User", "users")
      .paginated()
      .with_items_field("results")
  }

  #[test]
  fn test_requests() {
    let r = users();
    let [list, get] = [r.list_query(), r.get_query()];
    assert_eq!(
      list.request(&Resource::list_args(Some(2))).unwrap().to_string(),
      "GET users?page=2"
    );
    assert_eq!(list.request(&Resource::list_args(None)).unwrap().to_string(), "GET users");
    assert_eq!(get.request(&json!(7)).unwrap().to_string(), "GET users/7");
    assert!(matches!(
      get.request(&json!({"name": "no id"})),
      Err(CacheError::Serialization(_))
    ));

    let update = r.update_mutation().request(&json!({"id": 7, "name": "Ada"})).unwrap();
    assert_eq!(update.method, Method::Patch);
    assert_eq!(update.path, "users/7");
    assert_eq!(update.body, Some(json!({"name": "Ada"})));
  }

  #[test]
  fn test_list_tags_fan_out_to_items() {
    let r = users();
    let tags = r.list_query().tags(
      &json!({"count": 2, "results": [{"id": 1}, {"id": "b"}]}),
      &Resource::list_args(Some(3)),
    );
    assert_eq!(
      tags,
      vec![
        Tag::list("User"),
        Tag::page("User", 3),
        Tag::id("User", "1"),
        Tag::id("User", "b"),
      ]
    );
  }

  #[test]
  fn test_unpaginated_list_reads_bare_array() {
    let r = Resource::new("tags", "Label", "tags/");
    let list = r.list_query();
    assert_eq!(
      list.request(&Resource::list_args(Some(2))).unwrap().to_string(),
      "GET tags/"
    );
    assert_eq!(
      list.tags(&json!([{"id": 4}]), &json!({})),
      vec![Tag::list("Label"), Tag::id("Label", "4")]
    );
    assert_eq!(r.item_path(&EntityId::from("4")), "tags/4");
  }

  #[tokio::test]
  async fn test_update_patches_get_entry_optimistically() {
    let transport = ScriptedTransport::new();
    transport.respond("GET users/7", json!({"id": 7, "name": "Ada", "role": "admin"}));
    let r = users();
    let mut cache = layer_with(&transport, |layer| r.register(layer));

    let sub = cache.subscribe("users.get", &Resource::get_args(7u64)).unwrap();
    cache.settle().await;

    let gate = transport.hold("PATCH users/7");
    let handle = cache
      .trigger("users.update", &json!({"id": 7, "name": "Grace"}))
      .unwrap();
    assert_eq!(handle.patched(), 1);
    assert_eq!(
      sub.snapshot().data,
      Some(json!({"id": 7, "name": "Grace", "role": "admin"}))
    );

    gate.reject(CacheError::Network {
      status: Some(409),
      message: "conflict".into(),
    });
    cache.settle().await;
    assert!(handle.outcome().await.is_err());
    assert_eq!(
      sub.snapshot().data,
      Some(json!({"id": 7, "name": "Ada", "role": "admin"}))
    );
  }

  #[tokio::test]
  async fn test_create_refetches_observed_lists() {
    let transport = ScriptedTransport::new();
    transport.respond("GET users?page=1", json!({"results": [{"id": 1}]}));
    transport.respond("POST users", json!({"id": 2}));
    let r = users();
    let mut cache = layer_with(&transport, |layer| r.register(layer));

    let _page = cache.subscribe("users.list", &Resource::list_args(Some(1))).unwrap();
    cache.settle().await;
    assert_eq!(transport.call_count("GET users?page=1"), 1);

    let created = cache.mutate("users.create", &json!({"name": "Lin"})).await.unwrap();
    assert_eq!(created, json!({"id": 2}));
    cache.settle().await;
    assert_eq!(transport.call_count("GET users?page=1"), 2);
  }
}
