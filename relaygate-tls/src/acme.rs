//! ACME Protocol Client
//!
//! 🔐 Account lifecycle and certificate issuance via Let's Encrypt (or any
//! compatible directory). The RFC 8555 state machine is driven through
//! `instant-acme`; only the HTTP-01 challenge is supported.
//!
//! Account creation is coordinated across worker processes through the
//! filesystem: an exclusive-create lock file serializes registration and a
//! sentinel file records that it happened. Workers that lose the race wait
//! briefly for the sentinel and otherwise degrade to self-signed serving.

use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, OrderStatus, RetryPolicy,
};
use rcgen::{CertificateParams, DistinguishedName, DnType};
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Serialized ACME account material (private key + account URL).
pub const ACCOUNT_KEY_FILE: &str = "account-key.pem";
/// Written once after successful registration; contents: RFC 3339 timestamp.
pub const REGISTERED_SENTINEL: &str = ".account-registered";
/// Advisory lock taken around account registration.
pub const ACCOUNT_LOCK_FILE: &str = ".account-create.lock";

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_POLL: Duration = Duration::from_millis(100);
const SENTINEL_WAIT: Duration = Duration::from_secs(2);

// MARK: - Errors

/// Errors that can occur during ACME operations.
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("protocol error: {0}")]
    Protocol(#[from] instant_acme::Error),

    #[error("account management error: {0}")]
    Account(String),

    #[error("order processing failed: {0}")]
    Order(String),

    #[error("challenge failed: {0}")]
    Challenge(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// MARK: - Capability traits

/// Where HTTP-01 key authorizations get published so the validation request
/// can be answered by this worker or any of its peers.
#[async_trait::async_trait]
pub trait ChallengePublisher: Send + Sync {
    async fn publish(&self, token: &str, key_auth: &str);
    async fn withdraw(&self, token: &str);
}

/// A freshly issued certificate bundle.
#[derive(Debug, Clone)]
pub struct IssuedCert {
    pub cert_pem: String,
    pub key_pem: String,
}

/// The issuance capability the broker is built against. Production uses
/// [`DirectoryIssuer`]; tests substitute their own.
#[async_trait::async_trait]
pub trait AcmeIssuer: Send + Sync {
    async fn issue(
        &self,
        host: &str,
        challenges: &dyn ChallengePublisher,
    ) -> Result<IssuedCert, AcmeError>;
}

// MARK: - Account bootstrap

/// Load or register the ACME account for a certs directory.
///
/// Never fails hard: any problem is logged and `None` is returned, leaving
/// the broker in self-signed-only mode.
pub async fn initialize_account(dir: &Path, directory_url: &str) -> Option<Account> {
    let url = directory_url.to_string();
    let credentials = match coordinate_registration(dir, || register_new_account(url.clone())).await
    {
        Ok(Some(json)) => json,
        Ok(None) => {
            tracing::warn!(
                "⚠️ another worker is still registering the ACME account; \
                 continuing with self-signed certificates only"
            );
            return None;
        }
        Err(e) => {
            tracing::warn!(error = %e, "⚠️ ACME account bootstrap failed, self-signed only");
            return None;
        }
    };

    let credentials: AccountCredentials = match serde_json::from_str(&credentials) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "⚠️ stored ACME account credentials are corrupt");
            return None;
        }
    };

    let builder = match Account::builder() {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(error = %e, "⚠️ could not construct ACME client");
            return None;
        }
    };

    match builder.from_credentials(credentials).await {
        Ok(account) => {
            tracing::info!("🔐 ACME account ready");
            Some(account)
        }
        Err(e) => {
            tracing::warn!(error = %e, "⚠️ could not restore ACME account");
            None
        }
    }
}

/// Filesystem-coordinated, register-exactly-once bootstrap.
///
/// Returns the account credential JSON, or `None` when the lock could not
/// be won and the winner never published the sentinel in time.
pub(crate) async fn coordinate_registration<F, Fut>(
    dir: &Path,
    register: F,
) -> Result<Option<String>, AcmeError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<String, AcmeError>>,
{
    let key_path = dir.join(ACCOUNT_KEY_FILE);
    let sentinel = dir.join(REGISTERED_SENTINEL);
    let lock = dir.join(ACCOUNT_LOCK_FILE);

    if sentinel.exists() {
        return Ok(Some(tokio::fs::read_to_string(&key_path).await?));
    }

    if acquire_lock(&lock).await {
        // Re-check under the lock: another worker may have finished while we
        // were spinning for it.
        let result = if sentinel.exists() {
            tokio::fs::read_to_string(&key_path)
                .await
                .map(Some)
                .map_err(AcmeError::from)
        } else {
            match register().await {
                Ok(credentials) => {
                    tokio::fs::write(&key_path, &credentials).await?;
                    tokio::fs::write(&sentinel, chrono::Utc::now().to_rfc3339()).await?;
                    tracing::info!("👤 ACME account registered");
                    Ok(Some(credentials))
                }
                Err(e) => Err(e),
            }
        };
        let _ = tokio::fs::remove_file(&lock).await;
        return result;
    }

    // Lost the race: give the winner a moment to publish the sentinel.
    let deadline = Instant::now() + SENTINEL_WAIT;
    while Instant::now() < deadline {
        if sentinel.exists() {
            return Ok(Some(tokio::fs::read_to_string(&key_path).await?));
        }
        tokio::time::sleep(LOCK_POLL).await;
    }

    Ok(None)
}

/// Exclusive-create lock acquisition with a bounded spin.
async fn acquire_lock(path: &Path) -> bool {
    let deadline = Instant::now() + LOCK_TIMEOUT;
    loop {
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(file) => {
                drop(file);
                return true;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if Instant::now() >= deadline {
                    return false;
                }
                tokio::time::sleep(LOCK_POLL).await;
            }
            Err(_) => return false,
        }
    }
}

/// Register a new account with the directory: no contacts, terms agreed.
async fn register_new_account(directory_url: String) -> Result<String, AcmeError> {
    let new_account = NewAccount {
        contact: &[],
        terms_of_service_agreed: true,
        only_return_existing: false,
    };

    let builder = Account::builder().map_err(|e| AcmeError::Account(e.to_string()))?;
    let (_, credentials) = builder
        .create(&new_account, directory_url, None)
        .await
        .map_err(|e| AcmeError::Account(format!("registration failed: {e}")))?;

    serde_json::to_string_pretty(&credentials).map_err(|e| AcmeError::Account(e.to_string()))
}

// MARK: - Production issuer

/// Issues single-name certificates through a live ACME directory.
pub struct DirectoryIssuer {
    account: Account,
}

impl DirectoryIssuer {
    pub fn new(account: Account) -> Self {
        Self { account }
    }
}

#[async_trait::async_trait]
impl AcmeIssuer for DirectoryIssuer {
    async fn issue(
        &self,
        host: &str,
        challenges: &dyn ChallengePublisher,
    ) -> Result<IssuedCert, AcmeError> {
        tracing::info!(host, "🚀 starting ACME order");

        let identifiers = vec![Identifier::Dns(host.to_string())];
        let mut order = self
            .account
            .new_order(&NewOrder::new(&identifiers))
            .await
            .map_err(|e| AcmeError::Order(format!("failed to create order: {e}")))?;

        let mut published: Vec<String> = Vec::new();
        let mut authorizations = order.authorizations();
        while let Some(result) = authorizations.next().await {
            let mut authz = result
                .map_err(|e| AcmeError::Order(format!("failed to fetch authorization: {e}")))?;

            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let mut challenge = authz.challenge(ChallengeType::Http01).ok_or_else(|| {
                AcmeError::Challenge(format!("no http-01 challenge offered for {host}"))
            })?;

            let token = challenge.token.clone();
            let key_auth = challenge.key_authorization().as_str().to_string();
            challenges.publish(&token, &key_auth).await;
            published.push(token);

            challenge
                .set_ready()
                .await
                .map_err(|e| AcmeError::Challenge(format!("failed to set ready: {e}")))?;
        }

        let retry_policy = RetryPolicy::default();
        let polled = order.poll_ready(&retry_policy).await;

        // Challenge files are cleaned up whatever the outcome.
        for token in &published {
            challenges.withdraw(token).await;
        }

        let status = polled.map_err(|e| AcmeError::Order(format!("polling failed: {e}")))?;
        if status != OrderStatus::Ready && status != OrderStatus::Valid {
            return Err(AcmeError::Order(format!("order ended in state {status:?}")));
        }

        // CSR with CN = host and that single SAN, signed by a fresh
        // 2048-bit RSA key. Key generation is CPU-bound, so off-thread.
        let (key_pair, key_pem) = tokio::task::spawn_blocking(crate::selfsigned::rsa_key_pair)
            .await
            .map_err(|e| AcmeError::Order(format!("csr key generation failed: {e}")))?
            .map_err(|e| AcmeError::Order(format!("csr key generation failed: {e}")))?;

        let mut params = CertificateParams::new(vec![host.to_string()])
            .map_err(|e| AcmeError::Order(format!("csr parameters: {e}")))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| AcmeError::Order(format!("csr serialization: {e}")))?;

        order
            .finalize_csr(csr.der())
            .await
            .map_err(|e| AcmeError::Order(format!("finalization failed: {e}")))?;
        let cert_pem = order
            .poll_certificate(&retry_policy)
            .await
            .map_err(|e| AcmeError::Order(format!("certificate download failed: {e}")))?;

        tracing::info!(host, "🎉 certificate acquired");

        Ok(IssuedCert { cert_pem, key_pem })
    }
}
