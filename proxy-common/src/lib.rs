//! Shared library for the TLS-terminating reverse proxy: address
//! parsing, configuration, the HTTP fetch pool, the TLS context table
//! and its SNI/OCSP dispatch, the connection forwarder, and logging
//! setup. The master/worker process binary lives in `proxy-server`.

pub mod address;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod httpfetch;
pub mod logging;
pub mod tls;

pub use config::Config;
pub use error::{ProxyError, Result};
