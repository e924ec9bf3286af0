//! Request handling
//!
//! One [`Gateway`] is shared by both listeners of a worker. The
//! short-circuits run in a fixed order on every request: health probe,
//! ACME challenge, host validation, routing. Only then does traffic flow
//! upstream, streamed in both directions.

use crate::headers::{apply_forwarding_headers, request_host};
use bytes::Bytes;
use http::header::{CONNECTION, UPGRADE};
use http::{Method, Request, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use relaygate_store::{normalize_host, resolve_route, rewrite_path, target_url, MappingStore};
use relaygate_tls::{CertBroker, HostAuthorizer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Connect and exchange timeout for the upstream leg.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Errors that escape the handler. Surfacing one makes hyper tear the
/// connection down without writing a response, which is exactly the
/// contract for unroutable upgrade sockets.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("upgrade request dropped")]
    UpgradeDropped,
}

/// Shared request-handling state of one worker.
pub struct Gateway {
    store: Arc<MappingStore>,
    broker: CertBroker,
    client: Client<HttpConnector, Incoming>,
}

impl Gateway {
    pub fn new(store: Arc<MappingStore>, broker: CertBroker) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(UPSTREAM_TIMEOUT));

        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            store,
            broker,
            client,
        }
    }

    pub fn broker(&self) -> &CertBroker {
        &self.broker
    }

    /// Handle one request from either listener.
    pub async fn handle(
        &self,
        mut req: Request<Incoming>,
        peer: SocketAddr,
        local_port: u16,
        tls: bool,
    ) -> Result<Response<ProxyBody>, GatewayError> {
        let path = req.uri().path().to_string();

        // 1. Health probe, independent of Host and routing state.
        if req.method() == Method::GET && path == "/health" {
            return Ok(text(StatusCode::OK, "OK"));
        }

        // 2. ACME HTTP-01 answers, for our own orders and our peers'.
        if let Some(token) = path.strip_prefix(ACME_CHALLENGE_PREFIX) {
            return Ok(match self.broker.challenge(token).await {
                Some(key_auth) => text(StatusCode::OK, key_auth),
                None => text(StatusCode::NOT_FOUND, "Challenge not found"),
            });
        }

        let is_upgrade = is_upgrade_request(&req);

        // 3. A request we cannot attribute to a host is unroutable.
        let Some(host_raw) = request_host(&req) else {
            if is_upgrade {
                return Err(GatewayError::UpgradeDropped);
            }
            return Ok(text(
                StatusCode::BAD_REQUEST,
                "Bad Request: Missing Host header",
            ));
        };
        let host = normalize_host(&host_raw);

        // 4. Routing.
        let mapping = match resolve_route(&self.store, &host, &path).await {
            Ok(Some(mapping)) => mapping,
            Ok(None) => {
                if is_upgrade {
                    return Err(GatewayError::UpgradeDropped);
                }
                return Ok(text(StatusCode::NOT_FOUND, "Not Found"));
            }
            Err(e) => {
                tracing::error!(host, error = %e, "mapping lookup failed");
                if is_upgrade {
                    return Err(GatewayError::UpgradeDropped);
                }
                return Ok(text(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error",
                ));
            }
        };

        // 5. On TLS connections the handshake already produced a usable
        //    certificate; this nudges renewal without delaying the request.
        if tls {
            let broker = self.broker.clone();
            let warm_host = host.clone();
            tokio::spawn(async move {
                let _ = broker.ensure(&warm_host, true).await;
            });
        }

        // 6. Upstream URL. When no rewriting is configured the raw path
        //    (query included) passes through untouched.
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let target_path = if mapping.front_uri.is_empty() && mapping.back_uri.is_empty() {
            path_and_query.to_string()
        } else {
            rewrite_path(&mapping.front_uri, &mapping.back_uri, path_and_query)
        };
        let target = target_url(&mapping, &target_path);

        let uri: http::Uri = match target.parse() {
            Ok(uri) => uri,
            Err(e) => {
                tracing::error!(target, error = %e, "built an unparseable upstream url");
                if is_upgrade {
                    return Err(GatewayError::UpgradeDropped);
                }
                return Ok(text(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error",
                ));
            }
        };

        apply_forwarding_headers(req.headers_mut(), &host_raw, peer, local_port, tls);
        *req.uri_mut() = uri;

        // 7. Stream the exchange.
        if is_upgrade {
            self.forward_upgrade(req).await
        } else {
            Ok(self.forward(req).await)
        }
    }

    /// Plain request/response exchange. Bodies stream through; upstream
    /// trouble becomes a 502.
    async fn forward(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let target = req.uri().to_string();

        match tokio::time::timeout(UPSTREAM_TIMEOUT, self.client.request(req)).await {
            Ok(Ok(response)) => response.map(BodyExt::boxed),
            Ok(Err(e)) => {
                tracing::error!(target, error = %e, "upstream request failed");
                text(StatusCode::BAD_GATEWAY, "Bad Gateway")
            }
            Err(_) => {
                tracing::error!(target, "upstream request timed out");
                text(StatusCode::BAD_GATEWAY, "Bad Gateway")
            }
        }
    }

    /// `Connection: Upgrade` exchange. The upgrade request travels upstream
    /// as-is; after a 101 both raw streams are spliced byte-for-byte, which
    /// keeps subprotocols and custom headers intact.
    async fn forward_upgrade(
        &self,
        mut req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, GatewayError> {
        let target = req.uri().to_string();
        let downstream = hyper::upgrade::on(&mut req);

        let mut response =
            match tokio::time::timeout(UPSTREAM_TIMEOUT, self.client.request(req)).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    tracing::error!(target, error = %e, "upstream upgrade failed");
                    return Err(GatewayError::UpgradeDropped);
                }
                Err(_) => {
                    tracing::error!(target, "upstream upgrade timed out");
                    return Err(GatewayError::UpgradeDropped);
                }
            };

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            // Upstream declined: relay whatever it said instead.
            return Ok(response.map(BodyExt::boxed));
        }

        let upstream = hyper::upgrade::on(&mut response);
        tokio::spawn(async move {
            match tokio::try_join!(downstream, upstream) {
                Ok((down, up)) => {
                    let mut down = TokioIo::new(down);
                    let mut up = TokioIo::new(up);
                    if let Err(e) = tokio::io::copy_bidirectional(&mut down, &mut up).await {
                        tracing::debug!(error = %e, "upgrade tunnel closed with error");
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "upgrade handshake did not complete on both sides");
                }
            }
        });

        let (parts, _) = response.into_parts();
        Ok(Response::from_parts(parts, empty()))
    }
}

/// Whether the client asked to switch protocols.
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let wants_upgrade = req
        .headers()
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    wants_upgrade && req.headers().contains_key(UPGRADE)
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain")
        .body(full(body))
        .expect("static response must build")
}

fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed()
}

fn empty() -> ProxyBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// The forwarder's mapping table doubles as the TLS authorization oracle:
/// a host is allowed to trigger issuance iff something routes for it.
pub struct MappingAuthorizer(pub Arc<MappingStore>);

#[async_trait::async_trait]
impl HostAuthorizer for MappingAuthorizer {
    async fn is_authorized(&self, host: &str) -> bool {
        matches!(resolve_route(&self.0, host, "/").await, Ok(Some(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upgrade_detection() {
        let req = Request::builder()
            .header(CONNECTION, "keep-alive, Upgrade")
            .header(UPGRADE, "websocket")
            .body(())
            .unwrap();
        assert!(is_upgrade_request(&req));

        let req = Request::builder()
            .header(CONNECTION, "keep-alive")
            .body(())
            .unwrap();
        assert!(!is_upgrade_request(&req));

        // Upgrade header without Connection: upgrade is not a switch.
        let req = Request::builder()
            .header(UPGRADE, "websocket")
            .body(())
            .unwrap();
        assert!(!is_upgrade_request(&req));
    }
}
