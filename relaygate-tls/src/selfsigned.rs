//! Self-signed certificate generation
//!
//! Used whenever ACME cannot help: unauthorized hosts, rate-limited hosts,
//! failed orders, and the default `localhost` listener identity. The
//! generated certificate is deliberately recognizable as self-signed
//! (subject equals issuer, organization "Test") so the classifier never
//! confuses it with CA-issued material.

use crate::store::CertError;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose,
};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;

/// Generate a fresh 2048-bit RSA key, returned both as an rcgen signing key
/// and as its PKCS#8 PEM. Shared with the ACME order path, which signs its
/// CSRs with the same kind of key.
pub(crate) fn rsa_key_pair() -> Result<(KeyPair, String), CertError> {
    let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048)
        .map_err(|e| CertError::Generation(e.to_string()))?;
    let key_pem = key
        .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
        .map_err(|e| CertError::Generation(e.to_string()))?
        .to_string();
    let key_pair =
        KeyPair::from_pem(&key_pem).map_err(|e| CertError::Generation(e.to_string()))?;
    Ok((key_pair, key_pem))
}

/// Generate a self-signed certificate for `host`, valid for one year.
///
/// Returns `(cert_pem, key_pem)`. RSA key generation is CPU-bound; callers
/// on the hot path should run this on a blocking thread.
pub fn generate(host: &str) -> Result<(String, String), CertError> {
    let mut params = CertificateParams::new(vec![host.to_string()])
        .map_err(|e| CertError::Generation(e.to_string()))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    dn.push(DnType::OrganizationName, "Test");
    params.distinguished_name = dn;

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(365);

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let (key_pair, key_pem) = rsa_key_pair()?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::Generation(e.to_string()))?;

    Ok((cert.pem(), key_pem))
}
