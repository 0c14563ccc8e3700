//! Service discovery plumbing for RPC endpoints
//!
//! This library provides:
//! - Target URL parsing for `scheme://host[,host...]/key` discovery targets
//! - etcd lease publishing with a self-renewing background keep-alive
//! - Consul agent registration with TTL heartbeats
//! - A scheme-keyed resolver registry for dialing discovery targets

pub mod backoff;
pub mod consul;
pub mod error;
pub mod etcd;
pub mod publisher;
pub mod resolver;
pub mod target;

pub use backoff::Backoff;
pub use error::{DiscovError, Result, TargetError};
pub use etcd::{Account, EtcdClient};
pub use publisher::{Publisher, PublisherConfig, PublisherHandle};
pub use resolver::{ResolverBuilder, ResolverRegistry};
pub use target::TargetUrl;
