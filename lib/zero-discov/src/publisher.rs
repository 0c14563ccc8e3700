//! Publishing an endpoint under an etcd lease
//!
//! A [`Publisher`] writes `key/<id>` = endpoint attached to a lease and keeps
//! that lease alive from a background task. When the lease is lost the task
//! registers again, backing off while etcd is unreachable.

use crate::backoff::Backoff;
use crate::error::{DiscovError, Result};
use crate::etcd::{Account, EtcdClient};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Publisher configuration
#[derive(Clone, Debug)]
pub struct PublisherConfig {
    /// Lease time-to-live
    pub lease_ttl: Duration,
    /// Interval between lease renewals
    pub keepalive_interval: Duration,
    /// Timeout for a single etcd request
    pub request_timeout: Duration,
    /// Backoff between failed registrations
    pub backoff: Backoff,
    /// Optional etcd credentials
    pub account: Option<Account>,
    /// Fixed key suffix instead of the lease id
    pub id: Option<i64>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(10) / 3,
            request_timeout: Duration::from_secs(5),
            backoff: Backoff::default(),
            account: None,
            id: None,
        }
    }
}

impl PublisherConfig {
    /// Authenticate against etcd with the given account
    pub fn with_account(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.account = Some(Account::new(user, password));
        self
    }

    /// Publish under `key/<id>` instead of `key/<lease>`
    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.lease_ttl.as_secs() < 1 {
            return Err(DiscovError::InvalidConfig(format!(
                "lease ttl must be at least 1s, got {:?}",
                self.lease_ttl
            )));
        }
        if self.keepalive_interval.is_zero() {
            return Err(DiscovError::InvalidConfig(
                "keepalive interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Publishes one value under a key prefix in etcd
pub struct Publisher {
    client: Arc<EtcdClient>,
    hosts: Vec<String>,
    key: String,
    value: String,
    config: PublisherConfig,
}

impl Publisher {
    /// Create a publisher for `value` under `key` on the given etcd hosts
    pub fn new(
        hosts: Vec<String>,
        key: impl Into<String>,
        value: impl Into<String>,
        config: PublisherConfig,
    ) -> Result<Self> {
        config.validate()?;
        let client = EtcdClient::new(hosts.clone(), config.account.clone(), config.request_timeout)?;

        Ok(Self {
            client: Arc::new(client),
            hosts,
            key: key.into(),
            value: value.into(),
            config,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// etcd hosts as given
    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    /// Full key the value is stored under for a given lease
    pub fn full_key(&self, lease: i64) -> String {
        let suffix = self.config.id.filter(|id| *id > 0).unwrap_or(lease);
        format!("{}/{}", self.key, suffix)
    }

    /// Grant a lease and write the value once, returning the lease id
    pub async fn register(&self) -> Result<i64> {
        let lease = self.client.grant(self.config.lease_ttl.as_secs() as i64).await?;
        let full_key = self.full_key(lease);
        self.client.put(&full_key, &self.value, lease).await?;

        info!("Published {} under {} (lease {})", self.value, full_key, lease);
        Ok(lease)
    }

    /// Keep the value published from a background task
    ///
    /// Must be called inside a tokio runtime. Dropping the returned handle
    /// leaves the task running for the life of the process.
    pub fn keep_alive(self) -> PublisherHandle {
        let stop = Arc::new(Notify::new());
        let task = tokio::spawn(self.run(stop.clone()));
        PublisherHandle { stop, task }
    }

    async fn run(self, stop: Arc<Notify>) {
        let mut attempt: u32 = 0;

        loop {
            let lease = match self.register().await {
                Ok(lease) => {
                    attempt = 0;
                    lease
                }
                Err(e) => {
                    let delay = self.config.backoff.delay(attempt);
                    attempt = attempt.saturating_add(1);
                    warn!(
                        "Failed to publish {} under {}, retrying in {:?}: {}",
                        self.value, self.key, delay, e
                    );
                    tokio::select! {
                        _ = stop.notified() => return,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            if self.renew(lease, &stop).await {
                if let Err(e) = self.client.revoke(lease).await {
                    warn!("Failed to revoke lease {} on stop: {}", lease, e);
                }
                info!("Stopped publishing {}", self.full_key(lease));
                return;
            }
        }
    }

    /// Renew until stopped (returns true) or the lease is lost (returns false)
    async fn renew(&self, lease: i64, stop: &Notify) -> bool {
        let mut ticker = tokio::time::interval(self.config.keepalive_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop.notified() => return true,
                _ = ticker.tick() => {
                    match self.client.keep_alive_once(lease).await {
                        Ok(ttl) => debug!("Renewed lease {} (ttl {}s)", lease, ttl),
                        Err(e) => {
                            warn!("Keep-alive for lease {} failed, registering again: {}", lease, e);
                            if let Err(e) = self.client.revoke(lease).await {
                                debug!("Revoking lost lease {} failed: {}", lease, e);
                            }
                            return false;
                        }
                    }
                }
            }
        }
    }
}

/// Handle to a running keep-alive task
pub struct PublisherHandle {
    stop: Arc<Notify>,
    task: JoinHandle<()>,
}

impl PublisherHandle {
    /// Stop publishing: revoke the lease and wait for the task to exit
    pub async fn stop(self) {
        self.stop.notify_one();
        if let Err(e) = self.task.await {
            warn!("Publisher task ended abnormally: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use httpmock::prelude::*;
    use serde_json::json;

    fn fast_config() -> PublisherConfig {
        PublisherConfig {
            keepalive_interval: Duration::from_millis(20),
            request_timeout: Duration::from_secs(2),
            backoff: Backoff {
                initial: Duration::from_millis(10),
                max: Duration::from_millis(50),
                jitter: 0.0,
            },
            ..Default::default()
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..300 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[test]
    fn test_default_config() {
        let config = PublisherConfig::default();
        assert_eq!(config.lease_ttl, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert!(config.account.is_none());
        assert!(config.id.is_none());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = PublisherConfig {
            lease_ttl: Duration::from_millis(500),
            ..Default::default()
        };
        let result = Publisher::new(vec!["127.0.0.1:2379".to_string()], "svc", "v", config);
        assert!(matches!(result, Err(DiscovError::InvalidConfig(_))));
    }

    #[test]
    fn test_full_key_uses_lease_or_id() {
        let hosts = vec!["127.0.0.1:2379".to_string()];
        let by_lease = Publisher::new(hosts.clone(), "svc", "v", PublisherConfig::default()).unwrap();
        assert_eq!(by_lease.full_key(99), "svc/99");

        let by_id = Publisher::new(hosts, "svc", "v", PublisherConfig::default().with_id(7)).unwrap();
        assert_eq!(by_id.full_key(99), "svc/7");
    }

    #[tokio::test]
    async fn test_register_grants_and_puts() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v3/lease/grant").json_body(json!({"TTL": 10}));
            then.status(200).json_body(json!({"ID": "5", "TTL": "10"}));
        });
        let put = server.mock(|when, then| {
            when.method(POST).path("/v3/kv/put").json_body(json!({
                "key": STANDARD.encode("dtmservice/5"),
                "value": STANDARD.encode("10.0.0.1:36790"),
                "lease": "5",
            }));
            then.status(200).json_body(json!({}));
        });

        let publisher = Publisher::new(
            vec![server.base_url()],
            "dtmservice",
            "10.0.0.1:36790",
            PublisherConfig::default(),
        )
        .unwrap();

        assert_eq!(publisher.register().await.unwrap(), 5);
        assert_eq!(put.calls(), 1);
    }

    #[tokio::test]
    async fn test_keep_alive_renews_and_revokes_on_stop() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v3/lease/grant");
            then.status(200).json_body(json!({"ID": "5", "TTL": "10"}));
        });
        server.mock(|when, then| {
            when.method(POST).path("/v3/kv/put");
            then.status(200).json_body(json!({}));
        });
        let renew = server.mock(|when, then| {
            when.method(POST).path("/v3/lease/keepalive");
            then.status(200).body("{\"result\":{\"ID\":\"5\",\"TTL\":\"10\"}}\n");
        });
        let revoke = server.mock(|when, then| {
            when.method(POST).path("/v3/lease/revoke").json_body(json!({"ID": "5"}));
            then.status(200).json_body(json!({}));
        });

        let publisher =
            Publisher::new(vec![server.base_url()], "svc", "10.0.0.1:80", fast_config()).unwrap();
        let handle = publisher.keep_alive();

        wait_for(|| renew.calls() >= 2).await;
        assert!(!handle.is_finished());

        handle.stop().await;
        assert_eq!(revoke.calls(), 1);
    }

    #[tokio::test]
    async fn test_lost_lease_registers_again() {
        let server = MockServer::start();
        let grant = server.mock(|when, then| {
            when.method(POST).path("/v3/lease/grant");
            then.status(200).json_body(json!({"ID": "5", "TTL": "10"}));
        });
        server.mock(|when, then| {
            when.method(POST).path("/v3/kv/put");
            then.status(200).json_body(json!({}));
        });
        server.mock(|when, then| {
            when.method(POST).path("/v3/lease/keepalive");
            then.status(200).body("{\"result\":{\"ID\":\"5\"}}\n");
        });
        server.mock(|when, then| {
            when.method(POST).path("/v3/lease/revoke");
            then.status(200).json_body(json!({}));
        });

        let publisher =
            Publisher::new(vec![server.base_url()], "svc", "10.0.0.1:80", fast_config()).unwrap();
        let handle = publisher.keep_alive();

        wait_for(|| grant.calls() >= 2).await;
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_failed_registration_is_retried() {
        let server = MockServer::start();
        let grant = server.mock(|when, then| {
            when.method(POST).path("/v3/lease/grant");
            then.status(503).body("unavailable");
        });

        let publisher =
            Publisher::new(vec![server.base_url()], "svc", "10.0.0.1:80", fast_config()).unwrap();
        let handle = publisher.keep_alive();

        wait_for(|| grant.calls() >= 3).await;
        handle.stop().await;
    }
}
