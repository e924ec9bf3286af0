//! Certificate Broker
//!
//! 🛡️ The single entry point the SNI resolver and the forwarder use to get
//! certificate material for a host. Orchestrates disk, cache, wildcard
//! serving, ACME issuance and the self-signed fallback so that a TLS
//! handshake always completes with *something*.
//!
//! Per-worker state only: the caches, the single-flight set and the rate
//! limiter never need cross-process synchronization. Inter-worker ACME
//! coordination lives in the filesystem (see `acme`).

use crate::acme::{AcmeIssuer, ChallengePublisher};
use crate::classify;
use crate::selfsigned;
use crate::store::{CertEntry, CertError, CertStore};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Minimum spacing between ACME attempts for one host.
const MIN_ATTEMPT_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Attempt ceiling per host for the lifetime of the process.
const MAX_ATTEMPTS_PER_HOST: u32 = 5;
/// How long a caller waits on another task already issuing for the host.
const PROCESSING_WAIT: Duration = Duration::from_secs(30);
const PROCESSING_POLL: Duration = Duration::from_millis(100);

#[derive(Default)]
struct AttemptLog {
    last: Option<Instant>,
    count: u32,
}

struct BrokerInner {
    store: Arc<CertStore>,
    issuer: Option<Arc<dyn AcmeIssuer>>,
    /// HTTP-01 token -> key authorization, for this worker's own lookups.
    challenges: RwLock<HashMap<String, String>>,
    /// Hosts with an issuance in flight (single-flight gate).
    processing: parking_lot::Mutex<HashSet<String>>,
    attempts: parking_lot::Mutex<HashMap<String, AttemptLog>>,
}

/// Cheaply clonable handle to the per-worker certificate machinery.
#[derive(Clone)]
pub struct CertBroker {
    inner: Arc<BrokerInner>,
}

impl CertBroker {
    pub fn new(store: Arc<CertStore>, issuer: Option<Arc<dyn AcmeIssuer>>) -> Self {
        if issuer.is_none() {
            tracing::warn!("⚠️ no ACME client available; serving self-signed certificates only");
        }
        Self {
            inner: Arc::new(BrokerInner {
                store,
                issuer,
                challenges: RwLock::new(HashMap::new()),
                processing: parking_lot::Mutex::new(HashSet::new()),
                attempts: parking_lot::Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<CertStore> {
        &self.inner.store
    }

    /// Key authorization for an HTTP-01 token: this worker's memory first,
    /// then the shared challenge directory (another worker may own the
    /// order).
    pub async fn challenge(&self, token: &str) -> Option<String> {
        if let Some(key_auth) = self.inner.challenges.read().await.get(token) {
            return Some(key_auth.clone());
        }
        self.inner.store.read_challenge(token).await
    }

    /// Produce certificate material for `host`.
    ///
    /// `authorized` reflects whether the mapping table routes this host; an
    /// unauthorized host never triggers an ACME order. Whatever happens, the
    /// caller gets material it can complete a handshake with: a CA
    /// certificate when possible, self-signed otherwise.
    pub async fn ensure(&self, host: &str, authorized: bool) -> Result<CertEntry, CertError> {
        // 1. Disk first: another worker (or a previous life) may already
        //    hold what we need.
        if let Some(disk) = self.inner.store.load_from_disk(host).await {
            if classify::is_valid(&disk.cert_pem) {
                if classify::is_real(&disk.cert_pem) {
                    self.inner.store.install(host, disk.clone()).await;
                    return Ok(disk);
                }
                // Disk copy is self-signed; a real cached one outranks it.
                if let Some(cached) = self.inner.store.cached(host).await {
                    if classify::is_valid(&cached.cert_pem) && classify::is_real(&cached.cert_pem)
                    {
                        return Ok(cached);
                    }
                }
                self.inner.store.install(host, disk.clone()).await;
                return Ok(disk);
            }
        }

        // 2. Cache.
        if let Some(cached) = self.inner.store.cached(host).await {
            if classify::is_valid(&cached.cert_pem) {
                return Ok(cached);
            }
            self.inner.store.evict(host).await;
        }

        // 3. Strict subdomains may ride an operator-provided wildcard.
        let apex = apex(host);
        if host != apex && host != format!("www.{apex}") {
            if let Some(wildcard) = self.wildcard_for(&apex).await {
                if classify::is_valid(&wildcard.cert_pem) {
                    tracing::info!(host, apex, "🌿 serving wildcard certificate");
                    self.inner.store.install(host, wildcard.clone()).await;
                    return Ok(wildcard);
                }
            }
        }

        // 4. Unmapped hosts never reach the directory.
        let issuer = match (&self.inner.issuer, authorized) {
            (Some(issuer), true) => issuer.clone(),
            _ => {
                tracing::debug!(host, authorized, "self-signed fallback (no ACME path)");
                return self.self_signed(host).await;
            }
        };

        // 5. Single flight per host; only the winner of the gate counts as
        //    an attempt, so waiters are never rate-limited into self-signed.
        {
            let mut processing = self.inner.processing.lock();
            if processing.contains(host) {
                drop(processing);
                return self.await_processing(host).await;
            }
            if !self.attempt_allowed(host) {
                drop(processing);
                tracing::warn!(host, "⏳ ACME attempt rate-limited, serving self-signed");
                return self.self_signed(host).await;
            }
            processing.insert(host.to_string());
        }

        // 6. Run the order to completion on a detached task: a client
        //    disconnect must not abort it, and the result gets cached
        //    either way.
        let broker = self.clone();
        let owned_host = host.to_string();
        let handle =
            tokio::spawn(async move { broker.attempt_issue(&issuer, &owned_host).await });

        match handle.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(host, error = %e, "issuance task failed");
                self.inner.processing.lock().remove(host);
                self.self_signed(host).await
            }
        }
    }

    async fn attempt_issue(
        &self,
        issuer: &Arc<dyn AcmeIssuer>,
        host: &str,
    ) -> Result<CertEntry, CertError> {
        let result = issuer.issue(host, self).await;

        // The cache is filled before the gate releases so waiters always
        // find the outcome.
        let outcome = match result {
            Ok(issued) => {
                let entry = CertEntry {
                    cert_pem: issued.cert_pem,
                    key_pem: issued.key_pem,
                };
                if let Err(e) = self.inner.store.persist(host, &entry).await {
                    tracing::warn!(host, error = %e, "⚠️ could not persist issued certificate");
                }
                self.inner.store.install(host, entry.clone()).await;
                Ok(entry)
            }
            Err(e) => {
                tracing::warn!(host, error = %e, "⚠️ ACME issuance failed, serving self-signed");
                self.self_signed(host).await
            }
        };

        self.inner.processing.lock().remove(host);
        outcome
    }

    /// Wait for a concurrent issuance of the same host, then hand out
    /// whatever it produced.
    async fn await_processing(&self, host: &str) -> Result<CertEntry, CertError> {
        let deadline = Instant::now() + PROCESSING_WAIT;
        loop {
            if !self.inner.processing.lock().contains(host) {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!(host, "⏳ timed out waiting for in-flight issuance");
                break;
            }
            tokio::time::sleep(PROCESSING_POLL).await;
        }

        match self.inner.store.cached(host).await {
            Some(entry) => Ok(entry),
            None => self.self_signed(host).await,
        }
    }

    /// Generate, cache and return a self-signed certificate for `host`.
    /// Never persisted: only CA-issued material is written per host.
    async fn self_signed(&self, host: &str) -> Result<CertEntry, CertError> {
        let owned = host.to_string();
        match tokio::task::spawn_blocking(move || selfsigned::generate(&owned)).await {
            Ok(Ok((cert_pem, key_pem))) => {
                let entry = CertEntry { cert_pem, key_pem };
                self.inner.store.install(host, entry.clone()).await;
                Ok(entry)
            }
            Ok(Err(e)) => {
                tracing::warn!(host, error = %e, "⚠️ self-signed generation failed, using default identity");
                self.inner.store.default_identity().await
            }
            Err(e) => {
                tracing::warn!(host, error = %e, "⚠️ self-signed generation task failed, using default identity");
                self.inner.store.default_identity().await
            }
        }
    }

    async fn wildcard_for(&self, apex: &str) -> Option<CertEntry> {
        let key = format!("wildcard.{apex}");
        if let Some(cached) = self.inner.store.cached(&key).await {
            return Some(cached);
        }
        self.inner.store.wildcard_from_disk(apex).await
    }

    /// Per-host rate limiting: a minimum spacing between attempts and a hard
    /// ceiling per process lifetime. Records the attempt when it is allowed.
    fn attempt_allowed(&self, host: &str) -> bool {
        let mut attempts = self.inner.attempts.lock();
        let log = attempts.entry(host.to_string()).or_default();

        if log.count >= MAX_ATTEMPTS_PER_HOST {
            return false;
        }
        if let Some(last) = log.last {
            if last.elapsed() < MIN_ATTEMPT_INTERVAL {
                return false;
            }
        }

        log.last = Some(Instant::now());
        log.count += 1;
        true
    }
}

#[async_trait::async_trait]
impl ChallengePublisher for CertBroker {
    async fn publish(&self, token: &str, key_auth: &str) {
        self.inner
            .challenges
            .write()
            .await
            .insert(token.to_string(), key_auth.to_string());
        if let Err(e) = self.inner.store.write_challenge(token, key_auth).await {
            tracing::warn!(token, error = %e, "⚠️ could not write shared challenge file");
        }
    }

    async fn withdraw(&self, token: &str) {
        self.inner.challenges.write().await.remove(token);
        self.inner.store.remove_challenge(token).await;
    }
}

/// Registrable domain under common public suffixes. Compound TLDs first,
/// then the plain last-two-labels rule.
pub fn apex(host: &str) -> String {
    const COMPOUND_TLDS: &[&str] = &[
        "co.uk", "ac.uk", "org.uk", "gov.uk", "co.nz", "com.au", "co.jp", "com.br",
    ];

    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() <= 2 {
        return host.to_string();
    }

    let last_two = labels[labels.len() - 2..].join(".");
    if COMPOUND_TLDS.contains(&last_two.as_str()) {
        labels[labels.len() - 3..].join(".")
    } else {
        last_two
    }
}
