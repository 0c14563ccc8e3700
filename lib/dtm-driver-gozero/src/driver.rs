//! go-zero discovery driver

use crate::address;
use crate::config::DriverConfig;
use crate::error::{GozeroError, Result};
use async_trait::async_trait;
use dtm_driver::Driver;
use std::collections::HashMap;
use tracing::{debug, error, info};
use zero_discov::resolver::{self, CONSUL_SCHEME, DISCOV_SCHEME, ETCD_SCHEME};
use zero_discov::{consul, DiscovError, Publisher, PublisherConfig, TargetUrl};

pub const DRIVER_NAME: &str = "dtm-driver-gozero";

const CONSUL_TAGS: [&str; 2] = ["tag", "rpc"];
const CONSUL_PROTOCOL: (&str, &str) = ("Protocol", "grpc");

/// Driver publishing through etcd or Consul and dialing through the resolver registry
#[derive(Clone, Debug, Default)]
pub struct GozeroDriver {
    config: DriverConfig,
}

impl GozeroDriver {
    pub fn new(config: DriverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Publish `endpoint` under `target`
    ///
    /// etcd targets return as soon as the keep-alive task is started; Consul
    /// targets return once the agent accepted the registration.
    pub async fn publish(&self, target: &str, endpoint: &str) -> Result<()> {
        if target.is_empty() {
            debug!("No discovery target configured, skipping registration of {}", endpoint);
            return Ok(());
        }

        let url = TargetUrl::parse(target)?;

        match url.scheme.as_str() {
            DISCOV_SCHEME | ETCD_SCHEME => {
                self.keep_publishing(&url, endpoint);
                Ok(())
            }
            CONSUL_SCHEME => {
                let conf = self.consul_conf(&url);
                consul::register_service(endpoint, conf)
                    .await
                    .map_err(GozeroError::Consul)
            }
            other => Err(GozeroError::UnsupportedScheme(other.to_string())),
        }
    }

    /// Publisher for an etcd target: hosts from the authority, key from the path
    pub fn etcd_publisher(
        &self,
        url: &TargetUrl,
        endpoint: &str,
    ) -> std::result::Result<Publisher, DiscovError> {
        let mut config: PublisherConfig = self.config.publisher_config();
        let user = url.query_value("user");
        if !user.is_empty() {
            config = config.with_account(user, url.query_value("password"));
        }

        Publisher::new(url.hosts(), url.key(), endpoint, config)
    }

    /// Consul registration settings for a target
    pub fn consul_conf(&self, url: &TargetUrl) -> consul::Conf {
        consul::Conf {
            host: url.host.clone(),
            key: url.key().to_string(),
            tag: CONSUL_TAGS.iter().map(|t| t.to_string()).collect(),
            meta: HashMap::from([(CONSUL_PROTOCOL.0.to_string(), CONSUL_PROTOCOL.1.to_string())]),
            ttl: self.config.consul_ttl,
            ..Default::default()
        }
    }

    fn keep_publishing(&self, url: &TargetUrl, endpoint: &str) {
        match self.etcd_publisher(url, endpoint) {
            Ok(publisher) => {
                info!(
                    "Publishing {} under {} on {:?}",
                    endpoint,
                    publisher.key(),
                    publisher.hosts()
                );
                // the task outlives the handle
                let _ = publisher.keep_alive();
            }
            Err(e) => {
                error!("Cannot publish {} to {}://{}: {}", endpoint, url.scheme, url.host, e);
            }
        }
    }
}

#[async_trait]
impl Driver for GozeroDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn register_addr_resolver(&self) {
        resolver::register();
    }

    async fn register_service(&self, target: &str, endpoint: &str) -> dtm_driver::Result<()> {
        Ok(self.publish(target, endpoint).await?)
    }

    fn parse_server_method(&self, uri: &str) -> dtm_driver::Result<(String, String)> {
        Ok(address::parse_server_method(uri)?)
    }
}
