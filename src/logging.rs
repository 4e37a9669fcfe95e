//! Logging setup for the command line tool.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_FILTER: &str = "restq=info";

/// Build the filter from `RUST_LOG`, raising the crate to debug if `verbose`.
pub fn env_filter(verbose: bool) -> EnvFilter {
  let default = if verbose { "restq=debug" } else { DEFAULT_FILTER };
  EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Send log output to stderr through a non-blocking writer.
///
/// Keep the returned guard alive for as long as logs should be flushed.
/// Returns `None` if a global subscriber was already installed.
pub fn init(verbose: bool) -> Option<WorkerGuard> {
  let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());

  tracing_subscriber::registry()
    .with(env_filter(verbose))
    .with(fmt::layer().with_writer(writer).with_target(true))
    .try_init()
    .ok()
    .map(|()| guard)
}
