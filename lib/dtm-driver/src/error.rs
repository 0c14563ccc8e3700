use std::error::Error as StdError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DriverError>;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("no dtm driver: {0}")]
    NotFound(String),

    #[error("bad url: '{0}'. no '/' found")]
    BadUrl(String),

    /// Failure reported by a driver implementation
    #[error(transparent)]
    Driver(Box<dyn StdError + Send + Sync>),
}

impl DriverError {
    pub fn driver<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        DriverError::Driver(Box::new(err))
    }

    /// The driver-specific error, if it is of type `E`
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        match self {
            DriverError::Driver(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }
}
