//! Driver registry
//!
//! Hosts register drivers explicitly during bootstrap, then select one by
//! name with [`use_driver`]. Selecting a driver installs its resolvers.

use crate::driver::{DefaultDriver, Driver};
use crate::error::{DriverError, Result};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

/// DriverRegistry maps driver names to implementations and tracks the one in use
pub struct DriverRegistry {
    drivers: RwLock<HashMap<String, Arc<dyn Driver>>>,
    current: RwLock<Option<Arc<dyn Driver>>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self {
            drivers: RwLock::new(HashMap::new()),
            current: RwLock::new(None),
        }
    }

    /// Register a driver under its name, replacing any previous one
    pub fn register(&self, driver: Arc<dyn Driver>) {
        let name = driver.name().to_string();
        self.drivers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), driver);
        debug!("Registered dtm driver: {}", name);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Driver>> {
        self.drivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Make the named driver current and install its resolvers
    pub fn use_driver(&self, name: &str) -> Result<Arc<dyn Driver>> {
        let driver = self
            .get(name)
            .ok_or_else(|| DriverError::NotFound(name.to_string()))?;

        driver.register_addr_resolver();
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(driver.clone());

        info!("Using dtm driver: {}", name);
        Ok(driver)
    }

    /// The driver in use, falling back to [`DefaultDriver`]
    pub fn current(&self) -> Arc<dyn Driver> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| Arc::new(DefaultDriver))
    }

    /// Names of all registered drivers, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .drivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_REGISTRY: Lazy<DriverRegistry> = Lazy::new(DriverRegistry::new);

/// Register a driver with the process-wide registry
pub fn register(driver: Arc<dyn Driver>) {
    GLOBAL_REGISTRY.register(driver);
}

/// Select a driver of the process-wide registry by name
pub fn use_driver(name: &str) -> Result<Arc<dyn Driver>> {
    GLOBAL_REGISTRY.use_driver(name)
}

/// The driver currently in use by this process
pub fn get_driver() -> Arc<dyn Driver> {
    GLOBAL_REGISTRY.current()
}
