//! Consul agent registration with TTL health checks
//!
//! [`register_service`] registers synchronously, then hands the TTL check to
//! a background heartbeat that re-registers the service if the agent forgets it.
//! [`deregister_all`] undoes every registration when the process shuts down.

use crate::error::{DiscovError, Result};
use crate::etcd::normalize_endpoint;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, UdpSocket};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const TOKEN_HEADER: &str = "X-Consul-Token";
const DEREGISTER_CRITICAL_AFTER: &str = "1m";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Consul registration settings
#[derive(Clone, Debug)]
pub struct Conf {
    /// Consul agent address
    pub host: String,
    /// Service name
    pub key: String,
    /// ACL token
    pub token: Option<String>,
    pub tag: Vec<String>,
    pub meta: HashMap<String, String>,
    /// TTL of the health check
    pub ttl: Duration,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            host: String::new(),
            key: String::new(),
            token: None,
            tag: Vec::new(),
            meta: HashMap::new(),
            ttl: Duration::from_secs(20),
        }
    }
}

impl Conf {
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(DiscovError::InvalidConfig("empty consul hosts".to_string()));
        }
        if self.key.is_empty() {
            return Err(DiscovError::InvalidConfig("empty consul key".to_string()));
        }
        if self.ttl.as_secs() < 1 {
            return Err(DiscovError::InvalidConfig(format!(
                "consul ttl must be at least 1s, got {:?}",
                self.ttl
            )));
        }
        Ok(())
    }

    /// Interval between TTL check updates
    pub fn heartbeat_interval(&self) -> Duration {
        self.ttl
            .saturating_sub(Duration::from_secs(1))
            .max(Duration::from_secs(1))
    }
}

/// Service definition sent to the agent
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceRegistration {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub tags: Vec<String>,
    pub meta: HashMap<String, String>,
    pub port: u16,
    pub address: String,
    pub check: AgentCheck,
}

/// TTL health check attached to a registration
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct AgentCheck {
    #[serde(rename = "CheckID")]
    pub check_id: String,
    #[serde(rename = "TTL")]
    pub ttl: String,
    pub status: String,
    pub deregister_critical_service_after: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CheckUpdate<'a> {
    status: &'a str,
    output: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceEntry {
    #[serde(default)]
    node: Option<NodeInfo>,
    service: ServiceInfo,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NodeInfo {
    #[serde(default)]
    address: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceInfo {
    #[serde(default)]
    address: String,
    port: u16,
}

/// HTTP client for a Consul agent
#[derive(Clone)]
pub struct ConsulClient {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl ConsulClient {
    pub fn new(host: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        if host.trim().is_empty() {
            return Err(DiscovError::NoEndpoints);
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base: normalize_endpoint(host.trim()),
            token: token.filter(|t| !t.is_empty()),
        })
    }

    /// Register (or replace) a service on the agent
    pub async fn register(&self, registration: &ServiceRegistration) -> Result<()> {
        let req = self
            .http
            .put(format!("{}/v1/agent/service/register", self.base))
            .json(registration);
        self.send(req).await?;
        debug!("Registered consul service {}", registration.id);
        Ok(())
    }

    /// Remove a service from the agent
    pub async fn deregister(&self, service_id: &str) -> Result<()> {
        let req = self
            .http
            .put(format!("{}/v1/agent/service/deregister/{}", self.base, service_id));
        self.send(req).await?;
        debug!("Deregistered consul service {}", service_id);
        Ok(())
    }

    /// Mark a TTL check as passing
    pub async fn pass_ttl(&self, check_id: &str) -> Result<()> {
        let req = self
            .http
            .put(format!("{}/v1/agent/check/update/{}", self.base, check_id))
            .json(&CheckUpdate {
                status: "passing",
                output: "",
            });
        self.send(req).await?;
        Ok(())
    }

    /// `host:port` of every passing instance of a service
    pub async fn healthy_instances(&self, service: &str, tag: Option<&str>) -> Result<Vec<String>> {
        let mut query = vec![("passing", "true")];
        if let Some(tag) = tag.filter(|t| !t.is_empty()) {
            query.push(("tag", tag));
        }

        let req = self
            .http
            .get(format!("{}/v1/health/service/{}", self.base, service))
            .query(&query);
        let text = self.send(req).await?;
        let entries: Vec<ServiceEntry> = serde_json::from_str(&text)?;

        Ok(entries
            .into_iter()
            .map(|entry| {
                let address = if entry.service.address.is_empty() {
                    entry.node.map(|n| n.address).unwrap_or_default()
                } else {
                    entry.service.address
                };
                format!("{}:{}", address, entry.service.port)
            })
            .collect())
    }

    async fn send(&self, mut req: reqwest::RequestBuilder) -> Result<String> {
        if let Some(token) = &self.token {
            req = req.header(TOKEN_HEADER, token);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            return Err(DiscovError::Consul {
                status: status.as_u16(),
                message: text,
            });
        }
        Ok(text)
    }
}

/// Services registered by this process, deregistered on shutdown
#[derive(Default)]
pub struct Registrations {
    services: Mutex<Vec<Registered>>,
}

struct Registered {
    client: ConsulClient,
    service_id: String,
    heartbeat: JoinHandle<()>,
}

impl Registrations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listen_on` with the Consul agent described by `conf`
    ///
    /// Returns once the agent accepted the registration. The TTL check is kept
    /// passing by a detached task, so this must run inside a tokio runtime.
    pub async fn register_service(&self, listen_on: &str, conf: Conf) -> Result<()> {
        conf.validate()?;

        let (host, port) = split_listen_on(listen_on)?;
        let service_id = format!("{}-{}-{}", conf.key, host, port);

        let registration = ServiceRegistration {
            id: service_id.clone(),
            name: conf.key.clone(),
            tags: conf.tag.clone(),
            meta: conf.meta.clone(),
            port,
            address: host,
            check: AgentCheck {
                check_id: service_id.clone(),
                ttl: format!("{}s", conf.ttl.as_secs()),
                status: "passing".to_string(),
                deregister_critical_service_after: DEREGISTER_CRITICAL_AFTER.to_string(),
            },
        };

        let client = ConsulClient::new(&conf.host, conf.token.clone(), REQUEST_TIMEOUT)?;
        client.register(&registration).await?;
        info!("Registered {} with consul at {} as {}", listen_on, conf.host, service_id);

        let heartbeat = tokio::spawn(heartbeat(
            client.clone(),
            registration,
            conf.heartbeat_interval(),
        ));
        self.lock().push(Registered {
            client,
            service_id,
            heartbeat,
        });
        Ok(())
    }

    /// Number of services still registered
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every heartbeat and remove the services from their agents
    ///
    /// Failures are logged; the agent drops the service anyway once its TTL
    /// check stays critical.
    pub async fn deregister_all(&self) {
        let services = std::mem::take(&mut *self.lock());

        for service in services {
            service.heartbeat.abort();
            match service.client.deregister(&service.service_id).await {
                Ok(()) => info!("Deregistered {} from consul", service.service_id),
                Err(e) => warn!("Error deregistering {} from consul: {}", service.service_id, e),
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Registered>> {
        self.services.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

static REGISTRATIONS: Lazy<Registrations> = Lazy::new(Registrations::new);

/// Register `listen_on` in the process-wide [`Registrations`]
pub async fn register_service(listen_on: &str, conf: Conf) -> Result<()> {
    REGISTRATIONS.register_service(listen_on, conf).await
}

/// Deregister everything [`register_service`] published, for process shutdown
pub async fn deregister_all() {
    REGISTRATIONS.deregister_all().await
}

async fn heartbeat(client: ConsulClient, registration: ServiceRegistration, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        ticker.tick().await;

        match client.pass_ttl(&registration.check.check_id).await {
            Ok(()) => debug!("Passed consul TTL check {}", registration.check.check_id),
            Err(e) => {
                warn!(
                    "Consul TTL check {} failed, registering again: {}",
                    registration.check.check_id, e
                );
                if let Err(e) = client.register(&registration).await {
                    warn!("Consul re-registration of {} failed: {}", registration.id, e);
                }
            }
        }
    }
}

/// Split `host:port`, substituting the outbound IP for an unspecified host
fn split_listen_on(listen_on: &str) -> Result<(String, u16)> {
    let (host, port) = listen_on.rsplit_once(':').ok_or_else(|| {
        DiscovError::InvalidConfig(format!("listen address {:?} is not host:port", listen_on))
    })?;

    let port: u16 = port.parse().map_err(|_| {
        DiscovError::InvalidConfig(format!("invalid port in listen address {:?}", listen_on))
    })?;

    let host = host.trim_start_matches('[').trim_end_matches(']');
    let host = match host {
        "" | "0.0.0.0" | "::" => outbound_ip(),
        other => other.to_string(),
    };

    Ok((host, port))
}

/// Local address used for outbound traffic; no packets are sent
fn outbound_ip() -> String {
    let local = UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip());

    match local {
        Ok(ip) if !ip.is_unspecified() => ip.to_string(),
        Ok(_) | Err(_) => {
            warn!("Could not determine outbound IP, using loopback");
            IpAddr::from([127, 0, 0, 1]).to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn conf_for(server: &MockServer) -> Conf {
        Conf {
            host: server.address().to_string(),
            key: "dtmservice".to_string(),
            tag: vec!["tag".to_string(), "rpc".to_string()],
            meta: HashMap::from([("Protocol".to_string(), "grpc".to_string())]),
            ..Default::default()
        }
    }

    #[test]
    fn test_conf_validation() {
        assert!(Conf::default().validate().is_err());

        let missing_key = Conf {
            host: "127.0.0.1:8500".to_string(),
            ..Default::default()
        };
        assert!(matches!(missing_key.validate(), Err(DiscovError::InvalidConfig(m)) if m == "empty consul key"));

        let ok = Conf {
            host: "127.0.0.1:8500".to_string(),
            key: "svc".to_string(),
            ..Default::default()
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_heartbeat_interval() {
        let conf = Conf::default();
        assert_eq!(conf.heartbeat_interval(), Duration::from_secs(19));

        let short = Conf {
            ttl: Duration::from_secs(1),
            ..Default::default()
        };
        assert_eq!(short.heartbeat_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_split_listen_on() {
        assert_eq!(
            split_listen_on("10.0.0.1:36790").unwrap(),
            ("10.0.0.1".to_string(), 36790)
        );
        assert_eq!(split_listen_on("[::1]:80").unwrap(), ("::1".to_string(), 80));
        assert!(split_listen_on("no-port").is_err());
        assert!(split_listen_on("host:http").is_err());

        let (host, port) = split_listen_on(":8080").unwrap();
        assert!(!host.is_empty());
        assert_eq!(port, 8080);
    }

    #[tokio::test]
    async fn test_register_service_sends_ttl_check() {
        let server = MockServer::start();
        let register = server.mock(|when, then| {
            when.method(PUT)
                .path("/v1/agent/service/register")
                .json_body(json!({
                    "ID": "dtmservice-10.0.0.1-36790",
                    "Name": "dtmservice",
                    "Tags": ["tag", "rpc"],
                    "Meta": {"Protocol": "grpc"},
                    "Port": 36790,
                    "Address": "10.0.0.1",
                    "Check": {
                        "CheckID": "dtmservice-10.0.0.1-36790",
                        "TTL": "20s",
                        "Status": "passing",
                        "DeregisterCriticalServiceAfter": "1m",
                    },
                }));
            then.status(200);
        });

        register_service("10.0.0.1:36790", conf_for(&server)).await.unwrap();
        assert_eq!(register.calls(), 1);
    }

    #[tokio::test]
    async fn test_register_failure_is_returned() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(PUT).path("/v1/agent/service/register");
            then.status(500).body("agent unavailable");
        });

        let err = register_service("10.0.0.1:36790", conf_for(&server))
            .await
            .unwrap_err();
        assert!(matches!(err, DiscovError::Consul { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_heartbeat_passes_ttl_check() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(PUT).path("/v1/agent/service/register");
            then.status(200);
        });
        let pass = server.mock(|when, then| {
            when.method(PUT)
                .path("/v1/agent/check/update/dtmservice-10.0.0.1-36790")
                .json_body(json!({"Status": "passing", "Output": ""}));
            then.status(200);
        });

        let conf = Conf {
            ttl: Duration::from_secs(1),
            ..conf_for(&server)
        };
        register_service("10.0.0.1:36790", conf).await.unwrap();

        for _ in 0..50 {
            if pass.calls() >= 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("TTL check was never passed");
    }

    #[tokio::test]
    async fn test_healthy_instances() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET)
                .path("/v1/health/service/dtmservice")
                .query_param("passing", "true")
                .query_param("tag", "rpc")
                .header("X-Consul-Token", "secret");
            then.status(200).json_body(json!([
                {"Node": {"Address": "10.0.0.9"}, "Service": {"Address": "10.0.0.1", "Port": 36790}},
                {"Node": {"Address": "10.0.0.2"}, "Service": {"Address": "", "Port": 36790}},
            ]));
        });

        let client = ConsulClient::new(
            &server.address().to_string(),
            Some("secret".to_string()),
            Duration::from_secs(2),
        )
        .unwrap();
        let instances = client.healthy_instances("dtmservice", Some("rpc")).await.unwrap();

        assert_eq!(instances, vec!["10.0.0.1:36790", "10.0.0.2:36790"]);
    }

    #[tokio::test]
    async fn test_deregister() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(PUT).path("/v1/agent/service/deregister/svc-1");
            then.status(200);
        });

        let client = ConsulClient::new(&server.base_url(), None, Duration::from_secs(2)).unwrap();
        client.deregister("svc-1").await.unwrap();

        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test]
    async fn test_deregister_all_stops_heartbeat() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(PUT).path("/v1/agent/service/register");
            then.status(200);
        });
        let deregister = server.mock(|when, then| {
            when.method(PUT)
                .path("/v1/agent/service/deregister/dtmservice-10.0.0.1-36790");
            then.status(200);
        });
        let pass = server.mock(|when, then| {
            when.method(PUT).path("/v1/agent/check/update/dtmservice-10.0.0.1-36790");
            then.status(200);
        });

        let registrations = Registrations::new();
        let conf = Conf {
            ttl: Duration::from_secs(1),
            ..conf_for(&server)
        };
        registrations.register_service("10.0.0.1:36790", conf).await.unwrap();
        assert_eq!(registrations.len(), 1);

        registrations.deregister_all().await;
        assert_eq!(deregister.calls(), 1);
        assert!(registrations.is_empty());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(pass.calls(), 0);

        // nothing left to undo
        registrations.deregister_all().await;
        assert_eq!(deregister.calls(), 1);
    }
}
