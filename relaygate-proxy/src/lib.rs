//! Relaygate Forwarder
//!
//! 🌐 The request path of the proxy: plain and TLS listeners, the health
//! and ACME-challenge short-circuits, mapping-table routing, forwarded
//! header rewriting, streaming proxying and `Connection: Upgrade`
//! (WebSocket) splicing.

pub mod gateway;
pub mod headers;
pub mod server;

pub use gateway::{Gateway, GatewayError, MappingAuthorizer};
pub use server::{run_http, run_https};
