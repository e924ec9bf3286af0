//! Forwarded-header rewriting
//!
//! The inbound `Host` header travels upstream verbatim; the standard
//! `X-Forwarded-*` family records who really connected and how.

use http::header::{HeaderMap, HeaderValue, HOST};
use std::net::SocketAddr;

/// Extract the routing host from a request: the `Host` header for HTTP/1,
/// the URI authority for HTTP/2. Returned as sent, port included.
pub fn request_host<B>(req: &http::Request<B>) -> Option<String> {
    req.headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))
}

/// Apply the outbound header contract:
/// - `Host` stays untouched (inserted from the original when HTTP/2 had none)
/// - `X-Forwarded-Host` <- original host, port included
/// - `X-Forwarded-Proto` <- `https` iff the inbound leg was TLS or an
///   earlier proxy already said so
/// - `X-Forwarded-For` <- appended peer address
/// - `X-Forwarded-Port` <- appended listener port
pub fn apply_forwarding_headers(
    headers: &mut HeaderMap,
    original_host: &str,
    peer: SocketAddr,
    local_port: u16,
    tls: bool,
) {
    if !headers.contains_key(HOST) {
        if let Ok(value) = HeaderValue::from_str(original_host) {
            headers.insert(HOST, value);
        }
    }

    if let Ok(value) = HeaderValue::from_str(original_host) {
        headers.insert("x-forwarded-host", value);
    }

    let already_https = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("https"))
        .unwrap_or(false);
    let proto = if tls || already_https { "https" } else { "http" };
    headers.insert("x-forwarded-proto", HeaderValue::from_static(proto));

    let peer_ip = peer.ip().to_string();
    let forwarded_for = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {peer_ip}"),
        None => peer_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert("x-forwarded-for", value);
    }

    let forwarded_port = match headers.get("x-forwarded-port").and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {local_port}"),
        None => local_port.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_port) {
        headers.insert("x-forwarded-port", value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "203.0.113.7:51000".parse().unwrap()
    }

    #[test]
    fn test_fresh_forwarding_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("app.example.com:8443"));

        apply_forwarding_headers(&mut headers, "app.example.com:8443", peer(), 8443, true);

        assert_eq!(headers[HOST], "app.example.com:8443");
        assert_eq!(headers["x-forwarded-host"], "app.example.com:8443");
        assert_eq!(headers["x-forwarded-proto"], "https");
        assert_eq!(headers["x-forwarded-for"], "203.0.113.7");
        assert_eq!(headers["x-forwarded-port"], "8443");
    }

    #[test]
    fn test_appends_to_existing_chain() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("app.example.com"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("198.51.100.1"));
        headers.insert("x-forwarded-port", HeaderValue::from_static("443"));

        apply_forwarding_headers(&mut headers, "app.example.com", peer(), 8080, false);

        assert_eq!(headers["x-forwarded-for"], "198.51.100.1, 203.0.113.7");
        assert_eq!(headers["x-forwarded-port"], "443, 8080");
    }

    #[test]
    fn test_proto_trusts_earlier_https_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("app.example.com"));
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));

        // Plain inbound leg, but an earlier proxy terminated TLS.
        apply_forwarding_headers(&mut headers, "app.example.com", peer(), 8080, false);
        assert_eq!(headers["x-forwarded-proto"], "https");

        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("app.example.com"));
        apply_forwarding_headers(&mut headers, "app.example.com", peer(), 8080, false);
        assert_eq!(headers["x-forwarded-proto"], "http");
    }

    #[test]
    fn test_host_inserted_when_absent() {
        // HTTP/2 requests carry the authority in the URI instead.
        let mut headers = HeaderMap::new();
        apply_forwarding_headers(&mut headers, "h2.example.com", peer(), 8080, false);
        assert_eq!(headers[HOST], "h2.example.com");
    }
}
