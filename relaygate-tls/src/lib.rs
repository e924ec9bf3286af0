//! Relaygate TLS Module
//!
//! 🔐 Certificate brokerage for the proxy:
//! - On-demand issuance via ACME (Let's Encrypt), HTTP-01 only
//! - Persistent certificate store with an in-memory cache
//! - Self-signed fallback so handshakes never fail for lack of a CA
//! - Per-handshake SNI resolution

pub mod acme;
pub mod broker;
pub mod classify;
pub mod selfsigned;
pub mod sni;
pub mod store;

pub use acme::{AcmeError, AcmeIssuer, ChallengePublisher, DirectoryIssuer, IssuedCert};
pub use broker::CertBroker;
pub use sni::{HostAuthorizer, SniResolver};
pub use store::{CertEntry, CertError, CertStore};

use std::path::Path;
use std::sync::Arc;

/// Build the full certificate subsystem for one worker.
///
/// Ensures the certs directory, bootstraps (or degrades) the ACME account,
/// and preloads unexpired certificates from disk. ACME bootstrap failure is
/// not fatal: the broker then serves self-signed certificates only.
pub async fn initialize(
    certs_dir: impl AsRef<Path>,
    acme_directory_url: &str,
) -> Result<CertBroker, CertError> {
    let store = Arc::new(CertStore::new(certs_dir));
    store.init().await?;

    let issuer = match acme::initialize_account(store.dir(), acme_directory_url).await {
        Some(account) => Some(Arc::new(DirectoryIssuer::new(account)) as Arc<dyn AcmeIssuer>),
        None => None,
    };

    Ok(CertBroker::new(store, issuer))
}
