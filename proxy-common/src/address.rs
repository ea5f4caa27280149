//! Host:port parsing for frontend/backend/pool addresses.
//!
//! Deliberately does no DNS resolution — hostnames must already be
//! numeric addresses by the time they reach the proxy.

use crate::error::{ProxyError, Result};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::str::FromStr;

/// Parses `host` and `port` into a `SocketAddr`, trying IPv4 first and
/// falling back to IPv6. A malformed address is a config-time mistake,
/// so failure to parse either form is reported as `ProxyError::Config`.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(v4) = Ipv4Addr::from_str(host) {
        return Ok(SocketAddr::V4(SocketAddrV4::new(v4, port)));
    }

    // Accept both bracketed ("::1") and unbracketed IPv6 literals.
    let trimmed = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(v6) = Ipv6Addr::from_str(trimmed) {
        return Ok(SocketAddr::V6(SocketAddrV6::new(v6, port, 0, 0)));
    }

    Err(ProxyError::Config(format!(
        "'{host}' is not a numeric IPv4 or IPv6 address"
    )))
}

/// Parses a combined `host:port` string (IPv6 must be bracketed, e.g.
/// `[::1]:443`).
pub fn resolve_hostport(hostport: &str) -> Result<SocketAddr> {
    if let Some(rest) = hostport.strip_prefix('[') {
        let (host, port) = rest
            .split_once("]:")
            .ok_or_else(|| ProxyError::Config(format!("malformed bracketed address '{hostport}'")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| ProxyError::Config(format!("bad port in '{hostport}'")))?;
        return resolve(host, port);
    }

    let (host, port) = hostport
        .rsplit_once(':')
        .ok_or_else(|| ProxyError::Config(format!("missing port in '{hostport}'")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| ProxyError::Config(format!("bad port in '{hostport}'")))?;
    resolve(host, port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_round_trip() {
        let addr = resolve("203.0.113.9", 44321).unwrap();
        assert_eq!(addr.to_string(), "203.0.113.9:44321");
    }

    #[test]
    fn ipv6_round_trip_canonical() {
        let addr = resolve("::1", 443).unwrap();
        assert_eq!(addr.to_string(), "[::1]:443");
    }

    #[test]
    fn bracketed_ipv6_hostport() {
        let addr = resolve_hostport("[2001:db8::1]:8443").unwrap();
        assert_eq!(addr.to_string(), "[2001:db8::1]:8443");
    }

    #[test]
    fn rejects_hostname() {
        assert!(resolve("example.com", 443).is_err());
    }

    #[test]
    fn ipv4_hostport() {
        let addr = resolve_hostport("10.0.0.5:9000").unwrap();
        assert_eq!(addr.to_string(), "10.0.0.5:9000");
    }
}
