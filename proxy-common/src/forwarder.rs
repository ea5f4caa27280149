//! Connection forwarder: dials the backend, optionally emits a proxy
//! line, and pumps plaintext bidirectionally with backpressure.

use crate::error::{ProxyError, Result};
use socket2::{SockRef, TcpKeepalive};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

const HIGH_WATER: usize = 64 * 1024;
const LOW_WATER: usize = 16 * 1024;
const READ_CHUNK: usize = 16 * 1024;

/// Dials the backend and sets a TCP keepalive. Any dial failure is the
/// caller's cue to close the client connection.
pub async fn dial_backend(addr: SocketAddr, keepalive: Duration) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| ProxyError::Io(format!("dialing backend {addr}: {e}")))?;
    let sock_ref = SockRef::from(&stream);
    sock_ref
        .set_tcp_keepalive(&TcpKeepalive::new().with_time(keepalive))
        .map_err(|e| ProxyError::Io(format!("setting backend keepalive: {e}")))?;
    Ok(stream)
}

/// Builds the PROXY protocol v1 preamble sent ahead of plaintext when
/// the frontend is configured to carry the client's address downstream.
pub fn proxy_line(client_addr: SocketAddr, backend_addr: SocketAddr) -> String {
    let fam = if client_addr.is_ipv4() { "TCP4" } else { "TCP6" };
    format!(
        "PROXY {fam} {} {} {} {}\r\n",
        client_addr.ip(),
        backend_addr.ip(),
        client_addr.port(),
        backend_addr.port()
    )
}

/// A fixed-size ring of renegotiation timestamps. `record` reports abuse
/// once the ring is full and its oldest entry still falls inside the
/// window.
///
/// `rustls` servers do not support renegotiation at all (TLS 1.3 removed
/// it, and `rustls`'s TLS 1.2 server refuses renegotiation handshakes by
/// policy), so in this stack the ring never actually fills in practice.
/// It is kept as a connection-level guard so the limit is enforced the
/// same way regardless of which TLS stack terminates the handshake.
pub struct RenegGuard {
    events: VecDeque<Instant>,
    limit: usize,
    window: Duration,
}

impl RenegGuard {
    pub fn new(limit: usize, window: Duration) -> Self {
        RenegGuard {
            events: VecDeque::with_capacity(limit),
            limit,
            window,
        }
    }

    /// Records a renegotiation at `now`. Returns `Err(RenegAbuse)` if the
    /// ring was already full of events all within `window`.
    pub fn record(&mut self, now: Instant) -> Result<()> {
        if self.events.len() >= self.limit {
            if let Some(oldest) = self.events.front() {
                if now.duration_since(*oldest) < self.window {
                    return Err(ProxyError::RenegAbuse(self.limit));
                }
            }
            self.events.pop_front();
        }
        self.events.push_back(now);
        Ok(())
    }
}

/// Bidirectionally shuttles bytes between `client` and `backend`,
/// enforcing a high/low watermark on each direction's staging buffer
/// and half-closing the far side once it sees EOF.
pub async fn pump<C>(client: C, backend: TcpStream) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let (client_r, client_w) = tokio::io::split(client);
    let (backend_r, backend_w) = backend.into_split();

    let to_backend = pump_direction(client_r, backend_w);
    let to_client = pump_direction(backend_r, client_w);

    let (r1, r2) = tokio::join!(to_backend, to_client);
    r1.and(r2).map_err(|e| ProxyError::Io(format!("forwarding: {e}")))
}

async fn pump_direction<R, W>(mut reader: R, mut writer: W) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer: VecDeque<u8> = VecDeque::new();
    let mut read_buf = vec![0u8; READ_CHUNK];
    let mut eof = false;
    let mut paused = false;

    loop {
        if !buffer.is_empty() {
            let (front, _) = buffer.as_slices();
            let n = writer.write(front).await?;
            if n == 0 {
                return Ok(());
            }
            buffer.drain(..n);
        }

        if paused {
            if buffer.len() <= LOW_WATER {
                paused = false;
            }
        } else if buffer.len() >= HIGH_WATER {
            paused = true;
        }

        if eof && buffer.is_empty() {
            let _ = writer.shutdown().await;
            return Ok(());
        }

        if !paused && !eof {
            let n = reader.read(&mut read_buf).await?;
            if n == 0 {
                eof = true;
            } else {
                buffer.extend(&read_buf[..n]);
            }
        }
    }
}
