//! Address resolvers keyed by target scheme
//!
//! Clients dial targets like `etcd://host/key` or `consul://host/key`; the
//! resolver registered for the scheme turns the target into endpoint addresses.

use crate::consul::ConsulClient;
use crate::error::{DiscovError, Result};
use crate::etcd::{Account, EtcdClient};
use crate::target::TargetUrl;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

pub const DIRECT_SCHEME: &str = "direct";
pub const DISCOV_SCHEME: &str = "discov";
pub const ETCD_SCHEME: &str = "etcd";
pub const CONSUL_SCHEME: &str = "consul";

const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Turns a target of one scheme into endpoint addresses
#[async_trait]
pub trait ResolverBuilder: Send + Sync {
    fn scheme(&self) -> &'static str;

    async fn resolve(&self, target: &TargetUrl) -> Result<Vec<String>>;
}

/// `direct:///10.0.0.1:80,10.0.0.2:80`
pub struct DirectBuilder;

#[async_trait]
impl ResolverBuilder for DirectBuilder {
    fn scheme(&self) -> &'static str {
        DIRECT_SCHEME
    }

    async fn resolve(&self, target: &TargetUrl) -> Result<Vec<String>> {
        Ok(target
            .key()
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// `etcd://host1,host2/key` and its `discov` alias; reads every value under `key/`
pub struct DiscovBuilder {
    scheme: &'static str,
}

impl DiscovBuilder {
    pub fn new(scheme: &'static str) -> Self {
        Self { scheme }
    }
}

#[async_trait]
impl ResolverBuilder for DiscovBuilder {
    fn scheme(&self) -> &'static str {
        self.scheme
    }

    async fn resolve(&self, target: &TargetUrl) -> Result<Vec<String>> {
        let user = target.query_value("user");
        let account = (!user.is_empty()).then(|| Account::new(user, target.query_value("password")));

        let client = EtcdClient::new(target.hosts(), account, RESOLVE_TIMEOUT)?;
        let kvs = client.get_prefix(&format!("{}/", target.key())).await?;

        let mut endpoints: Vec<String> = Vec::with_capacity(kvs.len());
        for (_, value) in kvs {
            if !endpoints.contains(&value) {
                endpoints.push(value);
            }
        }
        Ok(endpoints)
    }
}

/// `consul://agent/service?tag=rpc&token=...`; passing instances only
pub struct ConsulBuilder;

#[async_trait]
impl ResolverBuilder for ConsulBuilder {
    fn scheme(&self) -> &'static str {
        CONSUL_SCHEME
    }

    async fn resolve(&self, target: &TargetUrl) -> Result<Vec<String>> {
        let token = Some(target.query_value("token")).filter(|t| !t.is_empty());
        let tag = target.query_value("tag");

        let client = ConsulClient::new(&target.host, token, RESOLVE_TIMEOUT)?;
        client.healthy_instances(target.key(), Some(tag.as_str())).await
    }
}

/// Registry of resolver builders by scheme
pub struct ResolverRegistry {
    builders: Arc<RwLock<HashMap<String, Arc<dyn ResolverBuilder>>>>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self {
            builders: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Add a builder, replacing any builder for the same scheme
    pub fn register_builder(&self, builder: Arc<dyn ResolverBuilder>) {
        let scheme = builder.scheme().to_string();
        self.builders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(scheme.clone(), builder);
        debug!("Registered resolver for scheme {}", scheme);
    }

    pub fn get(&self, scheme: &str) -> Option<Arc<dyn ResolverBuilder>> {
        self.builders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(scheme)
            .cloned()
    }

    /// Registered schemes, sorted
    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self
            .builders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        schemes.sort();
        schemes
    }

    pub fn len(&self) -> usize {
        self.builders.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve a target string with the builder for its scheme
    pub async fn resolve(&self, target: &str) -> Result<Vec<String>> {
        let target = TargetUrl::parse(target)?;
        let builder = self
            .get(&target.scheme)
            .ok_or_else(|| DiscovError::UnknownScheme(target.scheme.clone()))?;

        let endpoints = builder.resolve(&target).await?;
        debug!("Resolved {}://{}/{} to {:?}", target.scheme, target.host, target.key(), endpoints);
        Ok(endpoints)
    }
}

impl Default for ResolverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry consulted by clients that are not given one explicitly
pub static GLOBAL_REGISTRY: Lazy<ResolverRegistry> = Lazy::new(ResolverRegistry::new);

/// Install the built-in resolvers into the global registry. Safe to call repeatedly.
pub fn register() {
    register_into(&GLOBAL_REGISTRY);
}

/// Install the built-in resolvers into `registry`
pub fn register_into(registry: &ResolverRegistry) {
    registry.register_builder(Arc::new(DirectBuilder));
    registry.register_builder(Arc::new(DiscovBuilder::new(DISCOV_SCHEME)));
    registry.register_builder(Arc::new(DiscovBuilder::new(ETCD_SCHEME)));
    registry.register_builder(Arc::new(ConsulBuilder));
}

/// Resolve a target with the global registry
pub async fn resolve(target: &str) -> Result<Vec<String>> {
    GLOBAL_REGISTRY.resolve(target).await
}
