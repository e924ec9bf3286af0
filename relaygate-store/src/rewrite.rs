//! Front-URI to back-URI path rewriting
//!
//! Turns the matched request path into the path sent upstream. The query
//! string rides along untouched; only the path segment is rewritten.

use crate::db::Mapping;

/// Rewrite `request_path` (which may carry a query string) according to the
/// mapping's `front_uri`/`back_uri` pair.
///
/// The result always begins with `/` and never contains `//` runs in the
/// path segment. The query string, if any, is preserved byte-for-byte.
pub fn rewrite_path(front_uri: &str, back_uri: &str, request_path: &str) -> String {
    let (path, query) = match request_path.find('?') {
        Some(idx) => (&request_path[..idx], &request_path[idx..]),
        None => (request_path, ""),
    };

    let front = with_leading_slash(front_uri);
    let back = with_leading_slash(back_uri);

    let rewritten = match (front.is_empty(), back.is_empty()) {
        (true, true) => path.to_string(),
        (false, false) => {
            if let Some(rest) = path.strip_prefix(&front) {
                format!("{}{}", back, rest)
            } else if let Some(rest) = path.strip_prefix(front_uri) {
                // Defensive: the path carried the prefix without its slash.
                format!("{}{}", back, rest)
            } else {
                path.to_string()
            }
        }
        (false, true) => {
            let rest = path.strip_prefix(&front).unwrap_or(path);
            if rest.is_empty() {
                "/".to_string()
            } else {
                rest.to_string()
            }
        }
        (true, false) => format!("{}{}", back, path),
    };

    format!("{}{}", normalize_slashes(&rewritten), query)
}

/// Absolute upstream URL for a mapping and an already-rewritten path.
pub fn target_url(mapping: &Mapping, target_path: &str) -> String {
    format!("http://localhost:{}{}", mapping.back_port, target_path)
}

fn with_leading_slash(uri: &str) -> String {
    if uri.is_empty() || uri.starts_with('/') {
        uri.to_string()
    } else {
        format!("/{}", uri)
    }
}

/// Collapse `//` runs and guarantee a leading slash.
fn normalize_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    if !path.starts_with('/') {
        out.push('/');
    }
    let mut prev_slash = false;
    for c in path.chars() {
        if c == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(c);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}
