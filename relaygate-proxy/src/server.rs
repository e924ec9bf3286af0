//! Listeners
//!
//! Both listeners share one [`Gateway`]. The TLS side resolves a fresh
//! server configuration per handshake: the acceptor reads the ClientHello
//! first, hands the offered name to the SNI resolver (which may run a whole
//! ACME order), and only then finishes the handshake.
//!
//! Sockets are bound with `SO_REUSEPORT` so peer worker processes can all
//! accept on the same ports and let the kernel spread the load.

use crate::gateway::Gateway;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use relaygate_tls::SniResolver;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::LazyConfigAcceptor;

/// Bind a listener that peer workers can share.
pub fn bind_reuseport(addr: SocketAddr) -> std::io::Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    TcpListener::from_std(socket.into())
}

/// Accept loop of the plain HTTP listener.
pub async fn run_http(listener: TcpListener, gateway: Arc<Gateway>) -> std::io::Result<()> {
    let local_port = listener.local_addr()?.port();
    tracing::info!(port = local_port, "📡 HTTP listener ready");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed on HTTP listener");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };

        let gateway = gateway.clone();
        tokio::spawn(async move {
            serve_connection(stream, gateway, peer, local_port).await;
        });
    }
}

/// Accept loop of the TLS listener.
pub async fn run_https(
    listener: TcpListener,
    gateway: Arc<Gateway>,
    sni: Arc<SniResolver>,
) -> std::io::Result<()> {
    let local_port = listener.local_addr()?.port();
    tracing::info!(port = local_port, "🔐 HTTPS listener ready");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed on HTTPS listener");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };

        let gateway = gateway.clone();
        let sni = sni.clone();
        tokio::spawn(async move {
            serve_tls_connection(stream, gateway, sni, peer, local_port).await;
        });
    }
}

async fn serve_connection(
    stream: TcpStream,
    gateway: Arc<Gateway>,
    peer: SocketAddr,
    local_port: u16,
) {
    let service = hyper::service::service_fn(move |req| {
        let gateway = gateway.clone();
        async move { gateway.handle(req, peer, local_port, false).await }
    });

    if let Err(e) = auto::Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(TokioIo::new(stream), service)
        .await
    {
        tracing::debug!(%peer, error = %e, "connection closed with error");
    }
}

async fn serve_tls_connection(
    stream: TcpStream,
    gateway: Arc<Gateway>,
    sni: Arc<SniResolver>,
    peer: SocketAddr,
    local_port: u16,
) {
    let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);

    let start = match acceptor.await {
        Ok(start) => start,
        Err(e) => {
            tracing::debug!(%peer, error = %e, "client hello not accepted");
            return;
        }
    };

    let server_name = start
        .client_hello()
        .server_name()
        .map(|name| name.to_string());

    let config = match sni.server_config(server_name.as_deref()).await {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(%peer, server_name = ?server_name, error = %e, "SNI resolution failed, aborting handshake");
            return;
        }
    };

    let tls_stream = match start.into_stream(config).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::debug!(%peer, error = %e, "TLS handshake failed");
            return;
        }
    };

    let service = hyper::service::service_fn(move |req| {
        let gateway = gateway.clone();
        async move { gateway.handle(req, peer, local_port, true).await }
    });

    if let Err(e) = auto::Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(TokioIo::new(tls_stream), service)
        .await
    {
        tracing::debug!(%peer, error = %e, "TLS connection closed with error");
    }
}
