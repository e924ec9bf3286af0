//! One worker process
//!
//! Builds the store, the certificate broker and both listeners, then serves
//! until a shutdown signal arrives. Startup failure propagates to `main`,
//! which exits with code 1 so the supervisor respawns us.

use anyhow::Context;
use relaygate_core::ProxyConfig;
use relaygate_proxy::server::bind_reuseport;
use relaygate_proxy::{run_http, run_https, Gateway, MappingAuthorizer};
use relaygate_store::MappingStore;
use relaygate_tls::SniResolver;
use std::net::SocketAddr;
use std::sync::Arc;

pub async fn run(config: ProxyConfig) -> anyhow::Result<()> {
    let worker_id = config.worker_id.unwrap_or(0);

    let store = Arc::new(
        MappingStore::initialize(&config.db_path)
            .await
            .context("mapping store initialization")?,
    );

    let broker = relaygate_tls::initialize(&config.certs_dir, &config.acme_directory_url)
        .await
        .context("certificate subsystem initialization")?;

    let gateway = Arc::new(Gateway::new(store.clone(), broker.clone()));

    let http_addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let http_listener = bind_reuseport(http_addr)
        .with_context(|| format!("binding HTTP listener on {http_addr}"))?;
    tokio::spawn(run_http(http_listener, gateway.clone()));

    if config.enable_https {
        let https_addr = SocketAddr::from(([0, 0, 0, 0], config.https_port));
        let https_listener = bind_reuseport(https_addr)
            .with_context(|| format!("binding HTTPS listener on {https_addr}"))?;
        let authorizer = Arc::new(MappingAuthorizer(store.clone()));
        let sni = Arc::new(SniResolver::new(broker, authorizer));
        tokio::spawn(run_https(https_listener, gateway, sni));
    }

    tracing::info!(
        worker_id,
        http_port = config.http_port,
        https = config.enable_https,
        "🚀 worker serving"
    );

    wait_for_shutdown().await;

    tracing::info!(worker_id, "worker shutting down");
    store.close().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
