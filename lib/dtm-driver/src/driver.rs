//! Driver capability interface

use crate::error::{DriverError, Result};
use async_trait::async_trait;

/// Name of the built-in driver used when none has been selected
pub const DEFAULT_DRIVER_NAME: &str = "default";

/// A discovery driver plugged into the transaction coordinator
#[async_trait]
pub trait Driver: Send + Sync {
    /// Fixed name the driver is registered under
    fn name(&self) -> &str;

    /// Install the address resolvers this driver's targets need
    fn register_addr_resolver(&self);

    /// Publish `endpoint` under the discovery location encoded in `target`
    async fn register_service(&self, target: &str, endpoint: &str) -> Result<()>;

    /// Split an address into `(server, method)`
    fn parse_server_method(&self, uri: &str) -> Result<(String, String)>;
}

/// Driver without discovery: addresses are plain `server/method` strings
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDriver;

#[async_trait]
impl Driver for DefaultDriver {
    fn name(&self) -> &str {
        DEFAULT_DRIVER_NAME
    }

    fn register_addr_resolver(&self) {}

    async fn register_service(&self, _target: &str, _endpoint: &str) -> Result<()> {
        Ok(())
    }

    fn parse_server_method(&self, uri: &str) -> Result<(String, String)> {
        let sep = uri.find('/').ok_or_else(|| DriverError::BadUrl(uri.to_string()))?;
        Ok((uri[..sep].to_string(), uri[sep..].to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_parse() {
        let driver = DefaultDriver;
        assert_eq!(
            driver.parse_server_method("localhost:36790/api.Busi/TransIn").unwrap(),
            ("localhost:36790".to_string(), "/api.Busi/TransIn".to_string())
        );
        assert!(matches!(
            driver.parse_server_method("nothing"),
            Err(DriverError::BadUrl(u)) if u == "nothing"
        ));
    }

    #[tokio::test]
    async fn test_default_register_is_noop() {
        let driver = DefaultDriver;
        driver.register_addr_resolver();
        assert!(driver.register_service("etcd://x/y", "1.2.3.4:5").await.is_ok());
        assert_eq!(driver.name(), DEFAULT_DRIVER_NAME);
    }
}
