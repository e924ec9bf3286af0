//! Certificate classification
//!
//! Read-time checks over PEM material. "Valid" bakes in the renewal window:
//! a certificate inside its last 30 days is treated as invalid so the broker
//! re-issues on the next access.

use x509_parser::pem::parse_x509_pem;

/// Renewal window: certificates expiring within this margin count as invalid.
pub const RENEWAL_WINDOW_SECS: i64 = 30 * 24 * 60 * 60;

/// Sentinel organization name carried by self-signed material.
const SELF_SIGNED_ORG: &str = "Test";

/// `notBefore <= now < notAfter - 30d`.
pub fn is_valid(cert_pem: &str) -> bool {
    let Ok((_, pem)) = parse_x509_pem(cert_pem.as_bytes()) else {
        return false;
    };
    let Ok(cert) = pem.parse_x509() else {
        return false;
    };

    let now = chrono::Utc::now().timestamp();
    let not_before = cert.validity().not_before.timestamp();
    let not_after = cert.validity().not_after.timestamp();

    now >= not_before && now < not_after - RENEWAL_WINDOW_SECS
}

/// A certificate is "real" (CA-issued) when its subject differs from its
/// issuer and the subject organization is not the self-signed sentinel.
pub fn is_real(cert_pem: &str) -> bool {
    let Ok((_, pem)) = parse_x509_pem(cert_pem.as_bytes()) else {
        return false;
    };
    let Ok(cert) = pem.parse_x509() else {
        return false;
    };

    if cert.subject().as_raw() == cert.issuer().as_raw() {
        return false;
    }

    let org = cert
        .subject()
        .iter_organization()
        .next()
        .and_then(|attr| attr.as_str().ok());

    org != Some(SELF_SIGNED_ORG)
}

/// The `notAfter` timestamp, if the PEM parses. Used when hydrating the
/// cache from disk at startup.
pub fn not_after(cert_pem: &str) -> Option<i64> {
    let (_, pem) = parse_x509_pem(cert_pem.as_bytes()).ok()?;
    let cert = pem.parse_x509().ok()?;
    Some(cert.validity().not_after.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DistinguishedName, DnType};

    fn cert_with_validity(days_left: i64) -> String {
        let mut params = CertificateParams::new(vec!["window.example".to_string()]).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "window.example");
        params.distinguished_name = dn;
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(1);
        params.not_after = now + time::Duration::days(days_left);
        let (key_pair, _) = crate::selfsigned::rsa_key_pair().unwrap();
        params.self_signed(&key_pair).unwrap().pem()
    }

    #[test]
    fn test_renewal_window() {
        // Plenty of runway: valid.
        assert!(is_valid(&cert_with_validity(60)));
        // Inside the 30-day window: invalid even though not yet expired.
        assert!(!is_valid(&cert_with_validity(20)));
        // Expired outright.
        assert!(!is_valid(&cert_with_validity(-1)));
    }

    #[test]
    fn test_self_signed_is_not_real() {
        let (cert_pem, _) = crate::selfsigned::generate("a.example").unwrap();
        assert!(!is_real(&cert_pem));
    }

    #[test]
    fn test_garbage_pem_rejected() {
        assert!(!is_valid("not a pem"));
        assert!(!is_real("not a pem"));
        assert!(not_after("not a pem").is_none());
    }

    #[test]
    fn test_not_after_extraction() {
        let pem = cert_with_validity(90);
        let ts = not_after(&pem).unwrap();
        let now = chrono::Utc::now().timestamp();
        assert!(ts > now + 80 * 86400 && ts < now + 100 * 86400);
    }
}
