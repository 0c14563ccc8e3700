use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiscovError>;

/// Failures while splitting a discovery target into its parts
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TargetError {
    #[error("parse {0:?}: net/url: invalid control character in URL")]
    InvalidControlCharacter(String),

    #[error("parse {0:?}: missing protocol scheme")]
    MissingScheme(String),

    #[error("parse {0:?}: first path segment in URL cannot contain colon")]
    ColonInFirstSegment(String),

    #[error("parse {url:?}: invalid port {port:?} after host")]
    InvalidPort { url: String, port: String },

    #[error("parse {url:?}: invalid URL escape {escape:?}")]
    InvalidEscape { url: String, escape: String },

    #[error("parse {url:?}: invalid character {character:?} in host name")]
    InvalidHostCharacter { url: String, character: String },
}

#[derive(Error, Debug)]
pub enum DiscovError {
    #[error("Invalid target: {0}")]
    InvalidTarget(#[from] TargetError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("etcd returned {status}: {message}")]
    Etcd { status: u16, message: String },

    #[error("consul returned {status}: {message}")]
    Consul { status: u16, message: String },

    #[error("lease {0} expired")]
    LeaseExpired(i64),

    #[error("no discovery endpoints configured")]
    NoEndpoints,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no resolver registered for scheme: {0}")]
    UnknownScheme(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] base64::DecodeError),
}
