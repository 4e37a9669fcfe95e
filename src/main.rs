use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use restq::api::{HttpTransport, Resource};
use restq::cache::{CacheLayer, EntrySnapshot, Subscription};
use restq::config::Config;
use restq::logging;
use serde_json::Value;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "restq")]
#[command(about = "Query and mutate REST resources through a tag-invalidated cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/restq/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Log cache activity at debug level
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List entities of a resource
  List {
    resource: String,
    /// Page to fetch from a paginated resource
    #[arg(short, long)]
    page: Option<u64>,
  },
  /// Fetch one entity
  Get { resource: String, id: String },
  /// Create an entity from a JSON body
  Create { resource: String, body: String },
  /// Change fields of an entity; the cached copy is patched optimistically
  Update {
    resource: String,
    id: String,
    body: String,
  },
  /// Delete an entity
  Delete { resource: String, id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(args.verbose);

  let config = Config::load(args.config.as_deref())?;
  let transport = HttpTransport::new(&config.api)?;
  let mut cache = CacheLayer::new(transport, &config.cache);
  for resource in &config.resources {
    resource.register(&mut cache);
  }

  match args.command {
    Command::List { resource, page } => {
      let resource = config.resource(&resource)?;
      let sub = cache.subscribe(&resource.operation("list"), &Resource::list_args(page))?;
      cache.settle().await;
      print_snapshot(&sub.snapshot())?;
    }
    Command::Get { resource, id } => {
      let resource = config.resource(&resource)?;
      let sub = cache.subscribe(&resource.operation("get"), &Resource::get_args(id))?;
      cache.settle().await;
      print_snapshot(&sub.snapshot())?;
    }
    Command::Create { resource, body } => {
      let resource = config.resource(&resource)?;
      let body = parse_body(&body)?;
      let created = cache.mutate(&resource.operation("create"), &body).await?;
      print_json(&created)?;
    }
    Command::Update { resource, id, body } => {
      let resource = config.resource(&resource)?;
      let sub = cache.subscribe(&resource.operation("get"), &Resource::get_args(id.as_str()))?;
      cache.settle().await;

      let mut update_args = parse_body(&body)?;
      let fields = update_args
        .as_object_mut()
        .ok_or_else(|| eyre!("Update body must be a JSON object"))?;
      fields.insert(resource.id_field.clone(), Value::String(id));

      let outcome = cache.mutate(&resource.operation("update"), &update_args).await;
      // Let the invalidated entry refetch before showing it
      cache.settle().await;
      outcome?;
      print_updated(&sub)?;
    }
    Command::Delete { resource, id } => {
      let resource = config.resource(&resource)?;
      cache
        .mutate(&resource.operation("delete"), &Resource::get_args(id.as_str()))
        .await?;
      info!(resource = %resource.name, id = %id, "deleted");
    }
  }

  Ok(())
}

fn parse_body(body: &str) -> Result<Value> {
  serde_json::from_str(body).map_err(|e| eyre!("Invalid JSON body: {}", e))
}

fn print_json(value: &Value) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

fn print_snapshot(snapshot: &EntrySnapshot) -> Result<()> {
  if let Some(error) = &snapshot.error {
    return Err(eyre!("{}", error));
  }
  match &snapshot.data {
    Some(data) => print_json(data),
    None => Err(eyre!("No data")),
  }
}

fn print_updated(sub: &Subscription) -> Result<()> {
  let snapshot = sub.snapshot();
  if snapshot.is_stale {
    info!("showing cached copy, refetch did not complete");
  }
  print_snapshot(&snapshot)
}
