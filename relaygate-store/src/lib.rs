//! Relaygate Mapping Store
//!
//! The routing engine of the proxy: a persistent, indexed domain+path
//! mapping table backed by SQLite with write-ahead logging, plus the
//! stateless pieces that turn a matched mapping into an upstream URL.
//!
//! The database file can be replaced while workers are serving ("hot swap");
//! WAL mode keeps readers on a consistent snapshot for the life of a query.

pub mod db;
pub mod resolve;
pub mod rewrite;

pub use db::{Mapping, MappingStore, StoreError};
pub use resolve::{normalize_host, resolve_route};
pub use rewrite::{rewrite_path, target_url};
