//! Pluggable discovery drivers for the transaction coordinator
//!
//! A driver tells the coordinator how to publish its own endpoint, which
//! resolvers to install for dialing branches, and how to split branch
//! addresses into server and method.

pub mod driver;
pub mod error;
pub mod registry;

pub use driver::{DefaultDriver, Driver, DEFAULT_DRIVER_NAME};
pub use error::{DriverError, Result};
pub use registry::{get_driver, register, use_driver, DriverRegistry};
