//! Small persistent-connection HTTP client used by the SNI and OCSP
//! stapling directory lookups: a thin wrapper around `reqwest` that
//! turns a status code into a typed outcome for the single `lookup`
//! operation callers need.

use crate::error::{ProxyError, Result};
use bytes::Bytes;
use reqwest::Client;
use std::time::Duration;

/// Outcome of a directory lookup.
#[derive(Debug)]
pub enum LookupOutcome {
    Found(Bytes),
    Empty,
}

#[derive(Clone)]
pub struct FetchPool {
    client: Client,
    base_url: String,
    query_template: String,
}

impl FetchPool {
    /// `host`/`port` address the directory service; `query_template`
    /// contains exactly one `%s` placeholder.
    pub fn new(host: &str, port: u16, query_template: &str) -> Result<Self> {
        let client = Client::builder()
            // A handful of idle keep-alive connections per directory
            // service; enough to keep the common case warm without pinning many fds.
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ProxyError::Lookup(format!("building http client: {e}")))?;

        Ok(FetchPool {
            client,
            base_url: format!("http://{host}:{port}"),
            query_template: query_template.to_string(),
        })
    }

    /// Issues `GET <formatted-path>` against the configured directory.
    /// `key` is either a servername (SNI lookups) or a base64 OCSP id
    /// (stapling lookups) — the caller decides which.
    pub async fn lookup(&self, key: &str) -> Result<LookupOutcome> {
        let path = self.query_template.replacen("%s", key, 1);
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProxyError::Lookup(format!("GET {url}: {e}")))?;

        match resp.status().as_u16() {
            200 => {
                let body = resp
                    .bytes()
                    .await
                    .map_err(|e| ProxyError::Lookup(format!("reading body from {url}: {e}")))?;
                Ok(LookupOutcome::Found(body))
            }
            404 => Ok(LookupOutcome::Empty),
            other => Err(ProxyError::Lookup(format!(
                "{url} returned unexpected status {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    /// Minimal HTTP/1.1 stub server: replies to every request with a
    /// fixed status/body, closing the connection after one exchange.
    fn spawn_stub(status_line: &'static str, body: &'static [u8]) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let response = format!(
                    "{status_line}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
                let _ = stream.write_all(body);
            }
        });
        port
    }

    #[tokio::test]
    async fn found_returns_body() {
        let port = spawn_stub("HTTP/1.1 200 OK", b"hello-world");
        let pool = FetchPool::new("127.0.0.1", port, "/sni/%s").unwrap();
        match pool.lookup("example.com").await.unwrap() {
            LookupOutcome::Found(body) => assert_eq!(&body[..], b"hello-world"),
            LookupOutcome::Empty => panic!("expected Found"),
        }
    }

    #[tokio::test]
    async fn not_found_is_empty() {
        let port = spawn_stub("HTTP/1.1 404 Not Found", b"");
        let pool = FetchPool::new("127.0.0.1", port, "/sni/%s").unwrap();
        assert!(matches!(
            pool.lookup("missing.example").await.unwrap(),
            LookupOutcome::Empty
        ));
    }

    #[tokio::test]
    async fn server_error_is_lookup_error() {
        let port = spawn_stub("HTTP/1.1 500 Internal Server Error", b"oops");
        let pool = FetchPool::new("127.0.0.1", port, "/sni/%s").unwrap();
        assert!(pool.lookup("example.com").await.is_err());
    }

    #[test]
    fn query_template_substitutes_once() {
        let template = "/sni/%s";
        let formatted = template.replacen("%s", "a.example", 1);
        assert_eq!(formatted, "/sni/a.example");
    }
}
