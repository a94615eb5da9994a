//! A single servable file within an asset bundle.

use std::path::PathBuf;

/// One servable file of a bundle. Immutable once constructed.
///
/// Identity within a bundle is the URL path; the owning
/// [`AssetBundle`](crate::bundle::AssetBundle) maps URL paths to assets and
/// resolves an asset's absolute file location.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Asset {
    /// Absolute location of the asset's file inside the bundle directory.
    pub file_path: PathBuf,
    /// Public URL path, query string stripped.
    pub url_path: String,
    /// Declared asset type, if any.
    pub file_type: Option<String>,
    /// Whether the asset may be reused purely by URL path (without a hash).
    pub cacheable: bool,
    /// Content hash declared by the manifest, if any. The entry document
    /// never has one; it is verified via its embedded runtime config instead.
    pub hash: Option<String>,
    /// URL path of this asset's source map, if any.
    pub source_map_url_path: Option<String>,
}

impl std::fmt::Display for Asset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.url_path)
    }
}
