mod config;
pub mod gateway;
pub mod keyspace;
// `self` is required for easy access to methods
#[allow(clippy::unused_self)]
pub mod service;
mod utils;

pub mod clap;

// Not async due to services() being used in many closures, and async closures are not stable as of writing
use std::sync::RwLock;

pub use config::Config;
pub use keyspace::KeyspaceAdapter;
pub use service::Services;
pub use utils::error::{Error, ErrorCode, Result};

pub static SERVICES: RwLock<Option<&'static Services>> = RwLock::new(None);

pub fn services() -> &'static Services {
    SERVICES
        .read()
        .unwrap()
        .expect("SERVICES should be initialized when this is called")
}
