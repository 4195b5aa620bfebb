//! Deployment dispatch.
//!
//! Two runtime flavors share the storage, parser, and command layers:
//! - `blocking`: thread-per-connection on the auto-scaling executor
//! - `nonblocking`: mio reactor threads (1 = single-threaded variant)

mod blocking;
pub mod connection;
mod event_loop;

use crate::config::{Config, RuntimeType};
use crate::storage::LruStorage;
use std::io;
use std::sync::{Arc, Mutex};

pub fn run(config: Config) -> io::Result<()> {
    let storage = Arc::new(Mutex::new(LruStorage::new(config.max_size)));
    match config.runtime {
        RuntimeType::Blocking => blocking::run(&config, storage),
        RuntimeType::Nonblocking => event_loop::run(&config, storage),
    }
}
