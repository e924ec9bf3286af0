//! Host normalization and route resolution

use crate::db::{Mapping, MappingStore, StoreError};

/// Lowercase a host header value and strip any port suffix.
///
/// Bracketed IPv6 literals keep their brackets; everything after the closing
/// bracket (or the first colon for plain names) is dropped.
pub fn normalize_host(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_port = if let Some(rest) = trimmed.strip_prefix('[') {
        match rest.find(']') {
            Some(end) => &trimmed[..end + 2],
            None => trimmed,
        }
    } else {
        trimmed.split(':').next().unwrap_or(trimmed)
    };
    without_port.to_ascii_lowercase()
}

/// Resolve `(host, request_path)` to a mapping, if any.
///
/// Stateless and deterministic: this is a thin delegate to the store's
/// longest-prefix lookup.
pub async fn resolve_route(
    store: &MappingStore,
    host: &str,
    request_path: &str,
) -> Result<Option<Mapping>, StoreError> {
    store.get(host, request_path).await
}
