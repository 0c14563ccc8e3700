//! go-zero style discovery driver for the transaction coordinator
//!
//! This library provides:
//! - Endpoint publication to etcd (`etcd://`, `discov://`) or Consul (`consul://`)
//! - Resolver installation for dialing those targets
//! - Splitting `scheme://host/server/method` addresses into server and method
//!
//! Hosts call [`register`] once during bootstrap, then select the driver with
//! `dtm_driver::use_driver(DRIVER_NAME)`.

pub mod address;
pub mod config;
pub mod driver;
pub mod error;

pub use address::{normalize_consul_query, parse_server_method};
pub use config::DriverConfig;
pub use driver::{GozeroDriver, DRIVER_NAME};
pub use error::{GozeroError, Result};

use std::sync::Arc;

/// Register the driver, configured from the environment, with the process-wide registry
pub fn register() {
    register_with(DriverConfig::from_env());
}

/// Register the driver with explicit settings
pub fn register_with(config: DriverConfig) {
    dtm_driver::register(Arc::new(GozeroDriver::new(config)));
}
