//! Certificate Storage
//!
//! 💾 On-disk `<host>.crt`/`<host>.key` pairs with an in-memory cache keyed
//! by exact host. Disk is the source of truth; the cache is per-worker and
//! hydrated at startup from every unexpired certificate found in the
//! directory. The directory also carries the ACME account material and the
//! HTTP-01 challenge files shared between workers.

use crate::classify;
use crate::selfsigned;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors of the certificate subsystem.
#[derive(Debug, Error)]
pub enum CertError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Self-signed generation failed.
    #[error("certificate generation failed: {0}")]
    Generation(String),

    /// Certificate material could not be parsed or used.
    #[error("certificate load failed: {0}")]
    Load(String),
}

/// A PEM certificate chain with its private key.
#[derive(Debug, Clone)]
pub struct CertEntry {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Persistent certificate store with a per-worker read cache.
pub struct CertStore {
    dir: PathBuf,
    cache: RwLock<HashMap<String, CertEntry>>,
}

impl CertStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Root directory of the store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Directory serving `/.well-known/acme-challenge/` lookups.
    pub fn challenge_dir(&self) -> PathBuf {
        self.dir.join(".well-known").join("acme-challenge")
    }

    /// Create the directory layout and hydrate the cache from disk.
    pub async fn init(&self) -> Result<(), CertError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::create_dir_all(self.challenge_dir()).await?;
        self.preload().await;
        Ok(())
    }

    /// Load every `*.crt` whose `notAfter` is still in the future.
    async fn preload(&self) {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), error = %e, "⚠️ could not scan certs directory");
                return;
            }
        };

        let now = chrono::Utc::now().timestamp();
        let mut count = 0usize;

        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(host) = name.strip_suffix(".crt") else { continue };

            let Ok(cert_pem) = tokio::fs::read_to_string(entry.path()).await else {
                continue;
            };
            let Ok(key_pem) = tokio::fs::read_to_string(self.dir.join(format!("{host}.key"))).await
            else {
                tracing::warn!(host, "⚠️ certificate on disk has no matching key, skipping");
                continue;
            };

            match classify::not_after(&cert_pem) {
                Some(ts) if ts > now => {
                    self.cache
                        .write()
                        .await
                        .insert(host.to_string(), CertEntry { cert_pem, key_pem });
                    count += 1;
                }
                Some(_) => {
                    tracing::info!(host, "expired certificate on disk, not caching");
                }
                None => {
                    tracing::warn!(host, "⚠️ unparseable certificate on disk, skipping");
                }
            }
        }

        if count > 0 {
            tracing::info!(count, "📜 hydrated certificates from disk");
        }
    }

    pub async fn cached(&self, host: &str) -> Option<CertEntry> {
        self.cache.read().await.get(host).cloned()
    }

    pub async fn install(&self, host: &str, entry: CertEntry) {
        self.cache.write().await.insert(host.to_string(), entry);
    }

    pub async fn evict(&self, host: &str) {
        self.cache.write().await.remove(host);
    }

    /// Read `<host>.crt`/`<host>.key` from disk, if both exist.
    pub async fn load_from_disk(&self, host: &str) -> Option<CertEntry> {
        if !safe_name(host) {
            return None;
        }
        let cert_pem = tokio::fs::read_to_string(self.dir.join(format!("{host}.crt")))
            .await
            .ok()?;
        let key_pem = tokio::fs::read_to_string(self.dir.join(format!("{host}.key")))
            .await
            .ok()?;
        Some(CertEntry { cert_pem, key_pem })
    }

    /// Write `<host>.crt`/`<host>.key`. Concurrent writers are acceptable:
    /// last writer wins and the contents are logically equivalent.
    pub async fn persist(&self, host: &str, entry: &CertEntry) -> Result<(), CertError> {
        if !safe_name(host) {
            return Err(CertError::Load(format!("unsafe host name '{host}'")));
        }
        tokio::fs::write(self.dir.join(format!("{host}.crt")), &entry.cert_pem).await?;
        tokio::fs::write(self.dir.join(format!("{host}.key")), &entry.key_pem).await?;
        Ok(())
    }

    /// Wildcard material for an apex, when someone has placed it on disk.
    /// Never issued by the proxy itself.
    pub async fn wildcard_from_disk(&self, apex: &str) -> Option<CertEntry> {
        self.load_from_disk(&format!("wildcard.{apex}")).await
    }

    /// The static listener identity: `default.crt`/`default.key`, generated
    /// as a self-signed `localhost` certificate on first use.
    pub async fn default_identity(&self) -> Result<CertEntry, CertError> {
        if let Some(entry) = self.load_from_disk("default").await {
            return Ok(entry);
        }

        let (cert_pem, key_pem) =
            tokio::task::spawn_blocking(|| selfsigned::generate("localhost"))
                .await
                .map_err(|e| CertError::Generation(e.to_string()))??;

        let entry = CertEntry { cert_pem, key_pem };
        self.persist("default", &entry).await?;
        tracing::info!("🔏 generated default self-signed identity for localhost");
        Ok(entry)
    }

    /// Publish an HTTP-01 key authorization where every worker can see it.
    pub async fn write_challenge(&self, token: &str, key_auth: &str) -> Result<(), CertError> {
        if !safe_name(token) {
            return Err(CertError::Load(format!("unsafe challenge token '{token}'")));
        }
        tokio::fs::write(self.challenge_dir().join(token), key_auth).await?;
        Ok(())
    }

    pub async fn read_challenge(&self, token: &str) -> Option<String> {
        if !safe_name(token) {
            return None;
        }
        tokio::fs::read_to_string(self.challenge_dir().join(token))
            .await
            .ok()
    }

    pub async fn remove_challenge(&self, token: &str) {
        if safe_name(token) {
            let _ = tokio::fs::remove_file(self.challenge_dir().join(token)).await;
        }
    }
}

/// Hosts and tokens become file names; anything that could escape the certs
/// directory is rejected outright.
fn safe_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fresh_store() -> (tempfile::TempDir, CertStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CertStore::new(dir.path());
        store.init().await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_persist_and_load_roundtrip() {
        let (_dir, store) = fresh_store().await;

        let (cert_pem, key_pem) = selfsigned::generate("site.example").unwrap();
        let entry = CertEntry { cert_pem, key_pem };

        store.persist("site.example", &entry).await.unwrap();
        let loaded = store.load_from_disk("site.example").await.unwrap();
        assert_eq!(loaded.cert_pem, entry.cert_pem);
        assert_eq!(loaded.key_pem, entry.key_pem);
    }

    #[tokio::test]
    async fn test_default_identity_is_persisted() {
        let (dir, store) = fresh_store().await;

        let first = store.default_identity().await.unwrap();
        assert!(dir.path().join("default.crt").exists());
        assert!(dir.path().join("default.key").exists());

        // Second call must load the same material, not regenerate.
        let second = store.default_identity().await.unwrap();
        assert_eq!(first.cert_pem, second.cert_pem);
    }

    #[tokio::test]
    async fn test_preload_hydrates_unexpired_certs() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = CertStore::new(dir.path());
            store.init().await.unwrap();
            let (cert_pem, key_pem) = selfsigned::generate("warm.example").unwrap();
            store
                .persist("warm.example", &CertEntry { cert_pem, key_pem })
                .await
                .unwrap();
        }

        let store = CertStore::new(dir.path());
        store.init().await.unwrap();
        assert!(store.cached("warm.example").await.is_some());
    }

    #[tokio::test]
    async fn test_challenge_visible_to_other_store_instances() {
        let dir = tempfile::tempdir().unwrap();
        let writer = CertStore::new(dir.path());
        writer.init().await.unwrap();
        writer.write_challenge("tok-123", "tok-123.abcdef").await.unwrap();

        // A peer worker opening the same directory sees the token.
        let reader = CertStore::new(dir.path());
        reader.init().await.unwrap();
        assert_eq!(
            reader.read_challenge("tok-123").await.as_deref(),
            Some("tok-123.abcdef")
        );

        writer.remove_challenge("tok-123").await;
        assert!(reader.read_challenge("tok-123").await.is_none());
    }

    #[tokio::test]
    async fn test_path_escapes_rejected() {
        let (_dir, store) = fresh_store().await;
        assert!(store.read_challenge("../secrets").await.is_none());
        assert!(store.load_from_disk("a/b").await.is_none());
        assert!(store
            .persist("..", &CertEntry { cert_pem: String::new(), key_pem: String::new() })
            .await
            .is_err());
    }
}
