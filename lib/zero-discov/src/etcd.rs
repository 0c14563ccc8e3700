//! Minimal etcd v3 client over the JSON gateway
//!
//! Only the calls needed to publish and resolve endpoints are covered: auth,
//! lease grant/keep-alive/revoke, put and prefix range.

use crate::error::{DiscovError, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::header::AUTHORIZATION;
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// etcd username/password credentials
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Account {
    pub user: String,
    pub password: String,
}

impl Account {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

#[derive(Serialize)]
struct AuthRequest<'a> {
    name: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct AuthResponse {
    token: String,
}

#[derive(Serialize)]
struct LeaseGrantRequest {
    #[serde(rename = "TTL")]
    ttl: i64,
}

#[derive(Serialize)]
struct LeaseIdRequest {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Deserialize, Default)]
struct LeaseResponse {
    #[serde(rename = "ID", default, deserialize_with = "int64")]
    id: i64,
    #[serde(rename = "TTL", default, deserialize_with = "int64")]
    ttl: i64,
}

#[derive(Deserialize)]
struct KeepAliveEnvelope {
    #[serde(default)]
    result: Option<LeaseResponse>,
}

#[derive(Serialize)]
struct PutRequest {
    key: String,
    value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    lease: Option<String>,
}

#[derive(Serialize)]
struct RangeRequest {
    key: String,
    range_end: String,
}

#[derive(Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

#[derive(Deserialize)]
struct KeyValue {
    key: String,
    #[serde(default)]
    value: String,
}

/// The gateway renders int64 as JSON strings; accept numbers too.
fn int64<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StrOrNum {
        Str(String),
        Num(i64),
    }

    match StrOrNum::deserialize(deserializer)? {
        StrOrNum::Str(s) => s.parse().map_err(de::Error::custom),
        StrOrNum::Num(n) => Ok(n),
    }
}

/// Client for a set of etcd endpoints
pub struct EtcdClient {
    http: reqwest::Client,
    endpoints: Vec<String>,
    current: AtomicUsize,
    account: Option<Account>,
    token: RwLock<Option<String>>,
}

impl EtcdClient {
    /// Create a client. Endpoints without a scheme are treated as plain HTTP.
    pub fn new(endpoints: Vec<String>, account: Option<Account>, timeout: Duration) -> Result<Self> {
        let endpoints: Vec<String> = endpoints
            .iter()
            .map(|e| e.trim())
            .filter(|e| !e.is_empty())
            .map(normalize_endpoint)
            .collect();

        if endpoints.is_empty() {
            return Err(DiscovError::NoEndpoints);
        }

        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            endpoints,
            current: AtomicUsize::new(0),
            account,
            token: RwLock::new(None),
        })
    }

    /// Normalized endpoint URLs
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Grant a lease with the given TTL in seconds, returning its id
    pub async fn grant(&self, ttl_secs: i64) -> Result<i64> {
        let resp: LeaseResponse = self
            .post("/v3/lease/grant", &LeaseGrantRequest { ttl: ttl_secs })
            .await?;
        if resp.id == 0 {
            return Err(DiscovError::Etcd {
                status: 200,
                message: "lease grant returned no id".to_string(),
            });
        }
        debug!("Granted etcd lease {} (ttl {}s)", resp.id, resp.ttl);
        Ok(resp.id)
    }

    /// Put a key, optionally attached to a lease (0 means none)
    pub async fn put(&self, key: &str, value: &str, lease: i64) -> Result<()> {
        let req = PutRequest {
            key: STANDARD.encode(key),
            value: STANDARD.encode(value),
            lease: (lease != 0).then(|| lease.to_string()),
        };
        let _: serde_json::Value = self.post("/v3/kv/put", &req).await?;
        debug!("Put etcd key {} (lease {})", key, lease);
        Ok(())
    }

    /// Renew a lease once, returning the remaining TTL
    pub async fn keep_alive_once(&self, lease: i64) -> Result<i64> {
        let text = self
            .post_raw("/v3/lease/keepalive", &LeaseIdRequest { id: lease.to_string() })
            .await?;

        // the gateway streams one JSON object per line
        let first = text
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("{}");
        let envelope: KeepAliveEnvelope = serde_json::from_str(first)?;

        match envelope.result {
            Some(result) if result.ttl > 0 => Ok(result.ttl),
            _ => Err(DiscovError::LeaseExpired(lease)),
        }
    }

    /// Revoke a lease, deleting every key attached to it
    pub async fn revoke(&self, lease: i64) -> Result<()> {
        let _: serde_json::Value = self
            .post("/v3/lease/revoke", &LeaseIdRequest { id: lease.to_string() })
            .await?;
        debug!("Revoked etcd lease {}", lease);
        Ok(())
    }

    /// All key/value pairs under a prefix
    pub async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let req = RangeRequest {
            key: STANDARD.encode(prefix),
            range_end: STANDARD.encode(prefix_range_end(prefix.as_bytes())),
        };
        let resp: RangeResponse = self.post("/v3/kv/range", &req).await?;

        resp.kvs
            .into_iter()
            .map(|kv| -> Result<(String, String)> {
                let key = String::from_utf8_lossy(&STANDARD.decode(kv.key)?).into_owned();
                let value = String::from_utf8_lossy(&STANDARD.decode(kv.value)?).into_owned();
                Ok((key, value))
            })
            .collect()
    }

    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let text = self.post_raw(path, body).await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn post_raw<Req>(&self, path: &str, body: &Req) -> Result<String>
    where
        Req: Serialize + ?Sized,
    {
        let token = self.token().await?;
        let result = self.try_endpoints(path, body, token.as_deref()).await;

        if let Err(DiscovError::Etcd { status: 401, .. }) = &result {
            // stale token, fetch a fresh one on the next call
            *self.token.write().await = None;
        }
        result
    }

    async fn token(&self) -> Result<Option<String>> {
        let Some(account) = &self.account else {
            return Ok(None);
        };

        if let Some(token) = self.token.read().await.clone() {
            return Ok(Some(token));
        }

        let req = AuthRequest {
            name: &account.user,
            password: &account.password,
        };
        let text = self.try_endpoints("/v3/auth/authenticate", &req, None).await?;
        let resp: AuthResponse = serde_json::from_str(&text)?;
        debug!("Authenticated to etcd as {}", account.user);

        *self.token.write().await = Some(resp.token.clone());
        Ok(Some(resp.token))
    }

    async fn try_endpoints<Req>(&self, path: &str, body: &Req, token: Option<&str>) -> Result<String>
    where
        Req: Serialize + ?Sized,
    {
        let start = self.current.load(Ordering::Relaxed);
        let mut last_err = DiscovError::NoEndpoints;

        for offset in 0..self.endpoints.len() {
            let idx = (start + offset) % self.endpoints.len();
            let endpoint = &self.endpoints[idx];

            match self.send(endpoint, path, body, token).await {
                Ok(text) => {
                    self.current.store(idx, Ordering::Relaxed);
                    return Ok(text);
                }
                Err(e) => {
                    debug!("etcd call {} on {} failed: {}", path, endpoint, e);
                    last_err = e;
                }
            }
        }

        Err(last_err)
    }

    async fn send<Req>(&self, endpoint: &str, path: &str, body: &Req, token: Option<&str>) -> Result<String>
    where
        Req: Serialize + ?Sized,
    {
        let mut req = self.http.post(format!("{}{}", endpoint, path)).json(body);
        if let Some(token) = token {
            req = req.header(AUTHORIZATION, token);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            return Err(DiscovError::Etcd {
                status: status.as_u16(),
                message: text,
            });
        }
        Ok(text)
    }
}

pub(crate) fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim_end_matches('/');
    if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("http://{}", endpoint)
    }
}

/// Smallest key greater than every key with the given prefix
fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // all 0xff: range to the end of the keyspace
    vec![0]
}
