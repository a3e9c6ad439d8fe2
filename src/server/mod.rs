mod admin;
pub mod bootstrap;
mod state;
pub mod tls;

pub use state::ProxyState;

use crate::metrics::Metrics;
use crate::proxy;
use anyhow::Result;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{debug, error, info};

/// Probe a listen address before the real listener starts accepting, so
/// permission and conflict errors surface as fatal startup errors with
/// the errno spelled out. A listening socket that never accepted frees
/// its port immediately on drop, so the follow-up bind is safe.
pub fn preflight_bind(addr: SocketAddr) -> Result<()> {
    match std::net::TcpListener::bind(addr) {
        Ok(probe) => {
            drop(probe);
            Ok(())
        }
        Err(e) => match e.kind() {
            std::io::ErrorKind::PermissionDenied => {
                anyhow::bail!("bind {}: permission denied (EACCES)", addr)
            }
            std::io::ErrorKind::AddrInUse => {
                anyhow::bail!("bind {}: address in use (EADDRINUSE)", addr)
            }
            std::io::ErrorKind::AddrNotAvailable => {
                anyhow::bail!("bind {}: address not available (EADDRNOTAVAIL)", addr)
            }
            _ => anyhow::bail!("bind {}: {}", addr, e),
        },
    }
}

/// Run a proxy listener with graceful shutdown support. With a TLS
/// config the listener terminates TLS and reports scheme `https` to the
/// envelope; otherwise it is the plain HTTP listener.
///
/// When `shutdown` is notified the server stops accepting new
/// connections and waits up to `DRAIN_TIMEOUT` for in-flight
/// connections to complete.
pub async fn run_proxy_server(
    listen: SocketAddr,
    state: ProxyState,
    shutdown: Arc<Notify>,
    tls_config: Option<Arc<rustls::ServerConfig>>,
) -> Result<()> {
    const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

    let scheme: &'static str = if tls_config.is_some() { "https" } else { "http" };
    let listener_port = listen.port();
    let listener = TcpListener::bind(listen).await?;
    info!("server: {} listener ready, addr={}", scheme, listen);

    let tls_acceptor = tls_config.map(tokio_rustls::TlsAcceptor::from);
    let active_conns = Arc::new(AtomicI64::new(0));

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!("server: {}: stop accepting new connections, draining...", scheme);
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => {
                metrics::counter!(
                    "proxy_connections_total",
                    "status" => "accepted",
                )
                .increment(1);
                v
            }
            Err(e) => {
                error!("server: {}: accept failed, error={}", scheme, e);
                metrics::counter!(
                    "proxy_connections_total",
                    "status" => "error",
                )
                .increment(1);
                continue;
            }
        };

        metrics::gauge!("proxy_connections_active").increment(1.0);
        active_conns.fetch_add(1, Ordering::Relaxed);

        let state = state.clone();
        let tls_acceptor = tls_acceptor.clone();
        let active_conns = active_conns.clone();

        tokio::spawn(async move {
            match tls_acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        serve_connection(tls_stream, state, peer_addr, scheme, listener_port).await;
                    }
                    Err(e) => {
                        debug!(
                            "server: https: handshake failed, peer={}, error={}",
                            peer_addr, e
                        );
                    }
                },
                None => {
                    serve_connection(stream, state, peer_addr, scheme, listener_port).await;
                }
            }

            metrics::gauge!("proxy_connections_active").decrement(1.0);
            active_conns.fetch_sub(1, Ordering::Relaxed);
        });
    }

    // Drain phase: wait for in-flight connections to finish (or timeout).
    let active = active_conns.load(Ordering::Relaxed);
    if active > 0 {
        info!(
            "server: {}: waiting for {} active connections to drain",
            scheme, active
        );
        let drain = async {
            loop {
                if active_conns.load(Ordering::Relaxed) == 0 {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        };
        match tokio::time::timeout(DRAIN_TIMEOUT, drain).await {
            Ok(_) => info!("server: {}: all connections drained", scheme),
            Err(_) => info!(
                "server: {}: drain timeout ({}s), {} connections still active",
                scheme,
                DRAIN_TIMEOUT.as_secs(),
                active_conns.load(Ordering::Relaxed)
            ),
        }
    }

    Ok(())
}

async fn serve_connection<I>(
    io: I,
    state: ProxyState,
    peer_addr: SocketAddr,
    scheme: &'static str,
    listener_port: u16,
) where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(io);
    let svc = service_fn(move |req: Request<Incoming>| {
        let state = state.clone();
        async move { proxy::handle_request(req, state, peer_addr, scheme, listener_port).await }
    });

    if let Err(e) = auto::Builder::new(TokioExecutor::new())
        .http1()
        .keep_alive(true)
        .http2()
        .keep_alive_interval(Some(std::time::Duration::from_secs(20)))
        .serve_connection_with_upgrades(io, svc)
        .await
    {
        // Guard aborts surface here as service errors; the socket is
        // dropped without a response, which is the intended behavior.
        debug!(
            "server: {}: connection ended, peer={}, cause={}",
            scheme, peer_addr, e
        );
    }
}

/// Run the admin server for health, metrics, and rule introspection.
pub async fn run_admin_server(listen: &str, state: ProxyState, metrics: Metrics) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: admin listening, addr={}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let state = state.clone();
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                let metrics = metrics.clone();
                async move { admin::handle_admin(req, state, metrics).await }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: admin: connection error, error={}", e);
                }
            }
        });
    }
}
