//! Per-handshake SNI resolution
//!
//! Every TLS handshake gets a freshly built `ServerConfig` for the offered
//! server name. Resolution is fully async (it may run a whole ACME order),
//! which is why the listener side uses a lazy acceptor rather than a rustls
//! certificate resolver.

use crate::broker::CertBroker;
use crate::store::{CertEntry, CertError};
use rustls::pki_types::CertificateDer;
use std::io::Cursor;
use std::sync::Arc;

/// Answers "does the mapping table route this host?". Implemented by the
/// proxy over its mapping store; kept as a trait so the TLS crate never
/// depends on the storage crate.
#[async_trait::async_trait]
pub trait HostAuthorizer: Send + Sync {
    async fn is_authorized(&self, host: &str) -> bool;
}

/// Resolves client-offered server names to TLS server configurations.
pub struct SniResolver {
    broker: CertBroker,
    authorizer: Arc<dyn HostAuthorizer>,
}

impl SniResolver {
    pub fn new(broker: CertBroker, authorizer: Arc<dyn HostAuthorizer>) -> Self {
        Self { broker, authorizer }
    }

    /// Produce the `ServerConfig` to finish a handshake with.
    ///
    /// A handshake without SNI gets the default `localhost` identity. Any
    /// error here aborts the handshake; the client sees a TLS failure and
    /// never an HTTP response.
    pub async fn server_config(
        &self,
        server_name: Option<&str>,
    ) -> Result<Arc<rustls::ServerConfig>, CertError> {
        let entry = match server_name {
            Some(raw) => {
                let host = normalize_sni(raw);
                let authorized = self.authorizer.is_authorized(&host).await;
                self.broker.ensure(&host, authorized).await?
            }
            None => self.broker.store().default_identity().await?,
        };

        build_server_config(&entry)
    }
}

/// Lowercase and strip any port a nonconforming client tacked on.
fn normalize_sni(raw: &str) -> String {
    raw.split(':').next().unwrap_or(raw).to_ascii_lowercase()
}

/// Build a rustls server configuration from a PEM pair.
pub fn build_server_config(entry: &CertEntry) -> Result<Arc<rustls::ServerConfig>, CertError> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut Cursor::new(entry.cert_pem.as_bytes()))
            .collect::<Result<_, _>>()
            .map_err(|e| CertError::Load(format!("bad certificate pem: {e}")))?;

    if certs.is_empty() {
        return Err(CertError::Load("no certificates in pem".to_string()));
    }

    let key = rustls_pemfile::private_key(&mut Cursor::new(entry.key_pem.as_bytes()))
        .map_err(|e| CertError::Load(format!("bad key pem: {e}")))?
        .ok_or_else(|| CertError::Load("no private key in pem".to_string()))?;

    let provider = rustls::crypto::aws_lc_rs::default_provider();
    let mut config = rustls::ServerConfig::builder_with_provider(provider.into())
        .with_safe_default_protocol_versions()
        .map_err(|e| CertError::Load(format!("protocol versions unavailable: {e}")))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| CertError::Load(format!("unusable certificate: {e}")))?;

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::CertBroker;
    use crate::store::CertStore;

    struct DenyAll;

    #[async_trait::async_trait]
    impl HostAuthorizer for DenyAll {
        async fn is_authorized(&self, _host: &str) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_unmapped_host_still_gets_a_config() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CertStore::new(dir.path()));
        store.init().await.unwrap();
        let broker = CertBroker::new(store, None);
        let resolver = SniResolver::new(broker, Arc::new(DenyAll));

        // Self-signed fallback must still yield a working ServerConfig.
        let config = resolver
            .server_config(Some("Not-In-DB.Example:443"))
            .await
            .unwrap();
        assert!(!config.alpn_protocols.is_empty());

        // No SNI at all: default identity.
        resolver.server_config(None).await.unwrap();
    }

    #[test]
    fn test_build_server_config_rejects_garbage() {
        let entry = CertEntry {
            cert_pem: "garbage".into(),
            key_pem: "garbage".into(),
        };
        assert!(build_server_config(&entry).is_err());
    }
}
