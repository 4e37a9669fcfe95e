//! Operation declarations and the transports that execute them.

mod api_types;
mod client;
mod endpoints;
mod resource;

pub use api_types::{Method, RequestDescriptor};
pub use client::{BoxFuture, HttpTransport, Transport};
pub use endpoints::{
  from_templates, MutationDefinition, OptimisticUpdate, PatchFn, QueryDefinition, RequestFn,
  TagProducer, TargetArgsFn,
};
pub use resource::Resource;
