//! Error taxonomy for the proxy: `Config` and `Crypto` failures are
//! fatal at init, `Io`/`Protocol`/`Lookup` are handled per connection,
//! `Resource` covers allocation/handle exhaustion.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("config error: {0}")]
    Config(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("renegotiation abuse: {0} renegotiations within the configured window")]
    RenegAbuse(usize),

    #[error("lookup failed: {0}")]
    Lookup(String),

    #[error("lookup returned no entry")]
    LookupEmpty,

    #[error("resource exhausted: {0}")]
    Resource(String),
}

impl From<std::io::Error> for ProxyError {
    fn from(e: std::io::Error) -> Self {
        ProxyError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(e: serde_json::Error) -> Self {
        ProxyError::Config(e.to_string())
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(e: reqwest::Error) -> Self {
        ProxyError::Lookup(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
