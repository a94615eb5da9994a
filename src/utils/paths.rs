//! URL path and ETag helpers.

use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

/// Strips the query string (and anything after it) from a URL path.
///
/// `/app.js?hash=abc` becomes `/app.js`; a path without a query string is
/// returned unchanged.
pub fn url_path_without_query(url_path: &str) -> &str {
    match url_path.find('?') {
        Some(index) => &url_path[..index],
        None => url_path,
    }
}

/// True if the path contains a traversal sequence or escapes a relative root.
///
/// Used to refuse manifest entries whose file path would write outside the
/// bundle directory. File paths are relative by convention, so an absolute
/// path is refused too.
pub fn has_path_traversal(path: &str) -> bool {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        return true;
    }
    candidate.components().any(|c| matches!(c, std::path::Component::ParentDir))
}

/// True if a URL path contains a traversal sequence.
///
/// URL paths start with a slash (`/app.js`), so only `..` segments are
/// suspect here; the leading slash is fine.
pub fn url_path_has_traversal(url_path: &str) -> bool {
    url_path.split('/').any(|segment| segment == "..")
}

fn etag_sha1_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // An ETag that encodes a SHA-1 is a quoted 40-char lowercase hex string,
    // optionally weak (W/ prefix).
    RE.get_or_init(|| Regex::new(r#""([0-9a-f]{40})""#).unwrap())
}

/// Extracts a SHA-1-shaped hash from an ETag header value, if present.
///
/// Servers that derive ETags from content hashes quote the 40-hex digest;
/// anything else (multipart uploads, weak validators over other data) yields
/// `None` and skips hash verification.
pub fn sha1_hash_from_etag(etag: &str) -> Option<&str> {
    etag_sha1_regex().captures(etag).map(|c| c.get(1).unwrap().as_str())
}

/// True if the URL path names a source map.
pub fn is_source_map_path(url_path: &str) -> bool {
    url_path_without_query(url_path).ends_with(".map")
}
