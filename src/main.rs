//! minicached: a text-protocol key/value cache server.
//!
//! - Byte-bounded LRU storage with O(1) operations
//! - Nonblocking mio reactor, single- or multi-threaded
//! - Blocking deployment on an auto-scaling worker pool
//! - Configuration via CLI arguments or TOML file

mod command;
mod config;
mod executor;
mod protocol;
mod runtime;
mod storage;

use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        runtime = ?config.runtime,
        max_size_mb = config.max_size / 1024 / 1024,
        "starting minicached"
    );

    runtime::run(config)?;
    Ok(())
}
