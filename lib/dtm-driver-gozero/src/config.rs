//! Driver configuration

use std::time::Duration;
use tracing::warn;
use zero_discov::PublisherConfig;

pub const ENV_LEASE_TTL: &str = "DTM_DRIVER_LEASE_TTL_SECS";
pub const ENV_REQUEST_TIMEOUT: &str = "DTM_DRIVER_REQUEST_TIMEOUT_SECS";
pub const ENV_CONSUL_TTL: &str = "DTM_DRIVER_CONSUL_TTL_SECS";

/// Settings applied to every registration the driver performs
#[derive(Clone, Debug, PartialEq)]
pub struct DriverConfig {
    /// etcd lease time-to-live
    pub lease_ttl: Duration,
    /// Timeout for a single etcd request
    pub request_timeout: Duration,
    /// Consul TTL check period
    pub consul_ttl: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
            consul_ttl: Duration::from_secs(20),
        }
    }
}

impl DriverConfig {
    /// Load from environment variables, keeping defaults for unset or invalid values
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            lease_ttl: seconds(&lookup, ENV_LEASE_TTL).unwrap_or(defaults.lease_ttl),
            request_timeout: seconds(&lookup, ENV_REQUEST_TIMEOUT).unwrap_or(defaults.request_timeout),
            consul_ttl: seconds(&lookup, ENV_CONSUL_TTL).unwrap_or(defaults.consul_ttl),
        }
    }

    /// Publisher settings for an etcd registration
    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            lease_ttl: self.lease_ttl,
            keepalive_interval: self.lease_ttl / 3,
            request_timeout: self.request_timeout,
            ..Default::default()
        }
    }
}

fn seconds(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<Duration> {
    let raw = lookup(name)?;
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
        _ => {
            warn!("Ignoring {}={:?}: expected a positive number of seconds", name, raw);
            None
        }
    }
}
