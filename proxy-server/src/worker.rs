//! Worker event loop: accepts from the shared listening socket, resolves
//! the TLS context for each connection, terminates TLS, and hands the
//! plaintext stream to the forwarder.

use anyhow::{Context, Result};
use proxy_common::address;
use proxy_common::config::Config;
use proxy_common::forwarder;
use proxy_common::tls::{ContextTable, OcspStapler, SniResolver, TlsContext};
use proxy_common::tls::sni::peek_sni;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::os::unix::io::FromRawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

/// A cert resolver fixed to a single already-resolved context; the
/// async SNI/OCSP resolution happens before this is ever constructed
/// (`rustls::server::ResolvesServerCert` has no suspend point of its
/// own), so by the time `rustls` calls `resolve` the answer is just
/// handed back.
#[derive(Debug)]
struct FixedResolver(Arc<CertifiedKey>);

impl ResolvesServerCert for FixedResolver {
    fn resolve(&self, _client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

struct WorkerState {
    resolver: SniResolver,
    stapler: OcspStapler,
    backend_addr: std::net::SocketAddr,
    backend_keepalive: Duration,
    proxyline: bool,
}

impl WorkerState {
    fn build(config: &Config) -> Result<Self> {
        let table = ContextTable::build(config).context("building TLS context table")?;
        let resolver = SniResolver::new(config, table);

        let stapling_pool = config
            .stapling
            .as_ref()
            .filter(|p| p.enabled)
            .map(|p| proxy_common::httpfetch::FetchPool::new(&p.host, p.port, &p.query))
            .transpose()
            .context("building stapling fetch pool")?;
        let stapler = OcspStapler::new(stapling_pool);

        let backend_addr = address::resolve(&config.backend.host, config.backend.port)
            .context("resolving backend address")?;

        Ok(WorkerState {
            resolver,
            stapler,
            backend_addr,
            backend_keepalive: Duration::from_secs(config.backend.keepalive),
            proxyline: config.frontend.proxyline,
        })
    }
}

/// Runs the shared accept loop until a shutdown signal arrives, then
/// drains in-flight connections before returning.
async fn serve(state: Arc<WorkerState>, listener: TcpListener) -> Result<()> {
    let mut connections = tokio::task::JoinSet::new();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = accepted.context("accept failed")?;
                let state = state.clone();
                connections.spawn(async move {
                    if let Err(e) = handle_connection(state, stream, peer_addr).await {
                        tracing::warn!(%peer_addr, error = %e, "connection closed with error");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("SIGINT received, draining connections");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("SIGTERM received, draining connections");
                break;
            }
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = finished {
                    tracing::warn!(error = %e, "connection task panicked");
                }
            }
        }
    }

    let drain_deadline = Duration::from_secs(10);
    let _ = tokio::time::timeout(drain_deadline, async {
        while connections.join_next().await.is_some() {}
    })
    .await;

    Ok(())
}

async fn handle_connection(
    state: Arc<WorkerState>,
    mut stream: TcpStream,
    peer_addr: std::net::SocketAddr,
) -> Result<()> {
    let mut peek_buf = vec![0u8; 4096];
    let peeked = stream.peek(&mut peek_buf).await.context("peeking ClientHello")?;
    let servername = peek_sni(&peek_buf[..peeked]);

    let mut ctx = state.resolver.resolve(servername.as_deref()).await;
    attach_ocsp_staple(&state, &mut ctx).await;

    let server_config = build_server_config(&ctx)?;
    let acceptor = TlsAcceptor::from(Arc::new(server_config));
    let tls_stream = acceptor.accept(stream).await.context("TLS handshake failed")?;

    let mut backend = forwarder::dial_backend(state.backend_addr, state.backend_keepalive).await?;

    if state.proxyline {
        use tokio::io::AsyncWriteExt;
        let line = forwarder::proxy_line(peer_addr, state.backend_addr);
        backend.write_all(line.as_bytes()).await.context("writing proxy line")?;
    }

    forwarder::pump(tls_stream, backend).await?;
    Ok(())
}

async fn attach_ocsp_staple(state: &WorkerState, ctx: &mut TlsContext) {
    if ctx.ocsp_der_b64.is_none() {
        if let Some(issuer) = ctx.issuer_der.as_ref() {
            ctx.ocsp_der_b64 = proxy_common::tls::ocsp::derive_ocsp_key(ctx.leaf_der.as_ref(), issuer.as_ref());
        }
    }
    if !state.stapler.is_configured() {
        return;
    }
    if let Some(staple) = state.stapler.staple_for(ctx).await {
        let cert = ctx.certified_key.cert.clone();
        let key = ctx.certified_key.key.clone();
        ctx.certified_key = Arc::new(CertifiedKey {
            cert,
            key,
            ocsp: Some(staple),
        });
    }
}

fn build_server_config(ctx: &TlsContext) -> Result<ServerConfig> {
    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(FixedResolver(ctx.certified_key.clone())));
    server_config.alpn_protocols = ctx
        .npn_protocols
        .iter()
        .map(|p| p.as_bytes().to_vec())
        .collect();
    Ok(server_config)
}

/// Reconstructs the listener inherited from the master (see
/// `master::spawn_worker`) and serves it.
pub async fn run_inherited(config: Config, listen_fd: i32) -> Result<()> {
    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(listen_fd) };
    std_listener.set_nonblocking(true).context("setting inherited listener non-blocking")?;
    let listener = TcpListener::from_std(std_listener).context("wrapping inherited listener")?;

    let state = Arc::new(WorkerState::build(&config)?);
    serve(state, listener).await
}

/// `workers = 0` path: binds its own listener and runs the worker loop
/// in-process, skipping the master's state machine entirely.
pub async fn run_workerless(config: Config, _config_path: PathBuf) -> Result<()> {
    let addr = address::resolve(&config.frontend.host, config.frontend.port)
        .context("resolving frontend address")?;
    let listener = TcpListener::bind(addr).await.context("binding frontend listener")?;

    let state = Arc::new(WorkerState::build(&config)?);
    serve(state, listener).await
}
