use dtm_driver::DriverError;
use thiserror::Error;
use zero_discov::{DiscovError, TargetError};

pub type Result<T> = std::result::Result<T, GozeroError>;

#[derive(Error, Debug)]
pub enum GozeroError {
    /// Target could not be parsed as a URL
    #[error(transparent)]
    Parse(#[from] TargetError),

    #[error("unknown scheme: {0}")]
    UnsupportedScheme(String),

    /// Consul rejected or never received the registration
    #[error(transparent)]
    Consul(DiscovError),

    #[error("bad url: '{0}'. no '/' found")]
    MalformedAddress(String),
}

impl From<GozeroError> for DriverError {
    fn from(err: GozeroError) -> Self {
        DriverError::driver(err)
    }
}
