pub mod buffer_writer;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod launcher;
pub mod layout;
pub mod orchestrator;
pub mod parquet;
pub mod plan;
pub mod progress;
pub mod protocol;
pub mod query;
pub mod source;

pub use error::*;

use tracing_subscriber::EnvFilter;

/// Install the stderr subscriber used by every binary. Stdout stays free for
/// the child message stream. Filter comes from `RUST_LOG`, default `info`.
pub fn init_tracing(service: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
    if installed.is_ok() {
        tracing::debug!(service, pid = std::process::id(), "tracing initialised");
    }
}
