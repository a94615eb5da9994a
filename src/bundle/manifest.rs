//! Asset manifest parsing.
//!
//! The manifest (`program.json`) is the versioned descriptor a server
//! publishes for each release: the format tag, the release version, a
//! per-platform compatibility map, and the list of client assets with their
//! content hashes. Parsing is strict about the envelope (format, version,
//! compatibility) and deliberately lenient about individual entries: a
//! malformed entry is dropped rather than failing the whole manifest, so one
//! bad row in a build cannot brick the update channel.

use crate::constants::{MANIFEST_FILE_NAME, MANIFEST_FORMAT};
use crate::core::{HotPushError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// One client-visible entry of the asset manifest.
#[derive(Debug, Clone)]
pub struct ManifestEntry {
    /// Public URL path the asset is served at (may still carry a query string).
    pub url_path: String,
    /// File path of the asset relative to the bundle directory.
    pub file_path: String,
    /// Declared asset type (`js`, `css`, `asset`, ...).
    pub file_type: String,
    /// Whether the asset may be served from cache without revalidation.
    pub cacheable: bool,
    /// Content hash declared by the server.
    pub hash: Option<String>,
    /// File path of the source map, if the build produced one.
    pub source_map_path: Option<String>,
    /// URL path of the source map, if the build produced one.
    pub source_map_url_path: Option<String>,
}

/// Parsed asset manifest for one release.
#[derive(Debug, Clone)]
pub struct AssetManifest {
    /// Release version string. Opaque; compared only for equality.
    pub version: String,
    /// Compatibility tag for the configured platform. A downloaded release
    /// whose tag differs from the installed shell's tag is rejected.
    pub compatibility_version: String,
    /// Client entries, in manifest order.
    pub entries: Vec<ManifestEntry>,
}

#[derive(Deserialize)]
struct RawManifest {
    format: Option<String>,
    version: Option<String>,
    #[serde(rename = "cordovaCompatibilityVersions")]
    compatibility_versions: Option<HashMap<String, String>>,
    #[serde(default)]
    manifest: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct RawEntry {
    #[serde(rename = "where")]
    location: Option<String>,
    url: String,
    path: String,
    #[serde(rename = "type")]
    file_type: String,
    cacheable: bool,
    hash: String,
    #[serde(rename = "sourceMap")]
    source_map_path: Option<String>,
    #[serde(rename = "sourceMapUrl")]
    source_map_url_path: Option<String>,
}

impl AssetManifest {
    /// Parses a manifest from raw bytes.
    ///
    /// `platform` selects the key looked up in the compatibility map
    /// (see [`crate::constants::DEFAULT_PLATFORM`]).
    ///
    /// # Errors
    ///
    /// Returns [`HotPushError::ManifestFormat`] if the JSON is unparseable,
    /// the format tag is present but not [`MANIFEST_FORMAT`], the version is
    /// missing, or the compatibility map lacks `platform`.
    pub fn parse(data: &[u8], platform: &str) -> Result<Self> {
        let raw: RawManifest = serde_json::from_slice(data).map_err(|e| {
            HotPushError::ManifestFormat { reason: format!("error parsing asset manifest: {e}") }
        })?;

        if let Some(format) = &raw.format
            && format != MANIFEST_FORMAT
        {
            return Err(HotPushError::ManifestFormat {
                reason: format!("the asset manifest format is incompatible: {format}"),
            });
        }

        let version = raw.version.ok_or_else(|| HotPushError::ManifestFormat {
            reason: "asset manifest does not have a version".into(),
        })?;

        let compatibility_version = raw
            .compatibility_versions
            .as_ref()
            .and_then(|versions| versions.get(platform))
            .cloned()
            .ok_or_else(|| HotPushError::ManifestFormat {
                reason: format!(
                    "asset manifest does not have a compatibility version for platform {platform}"
                ),
            })?;

        let entries = raw
            .manifest
            .into_iter()
            .filter_map(|value| {
                // Only client-side assets are relevant; server rows and rows
                // missing required fields are skipped without failing the parse.
                let entry: RawEntry = serde_json::from_value(value).ok()?;
                if entry.location.as_deref() != Some("client") {
                    return None;
                }
                Some(ManifestEntry {
                    url_path: entry.url,
                    file_path: entry.path,
                    file_type: entry.file_type,
                    cacheable: entry.cacheable,
                    hash: Some(entry.hash),
                    source_map_path: entry.source_map_path,
                    source_map_url_path: entry.source_map_url_path,
                })
            })
            .collect();

        Ok(Self { version, compatibility_version, entries })
    }

    /// Reads and parses `program.json` from a bundle directory.
    pub fn load(directory: &Path, platform: &str) -> Result<Self> {
        let manifest_path = directory.join(MANIFEST_FILE_NAME);
        let data = std::fs::read(&manifest_path).map_err(|e| HotPushError::io(&manifest_path, e))?;
        Self::parse(&data, platform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest_json(entries: serde_json::Value) -> Vec<u8> {
        json!({
            "format": "web-program-pre1",
            "version": "v1",
            "cordovaCompatibilityVersions": {"ios": "1.0.0", "android": "1.0.0"},
            "manifest": entries,
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn parses_client_entries() {
        let data = manifest_json(json!([
            {"where": "client", "url": "/app.js?hash=abc", "path": "app/app.js",
             "type": "js", "cacheable": true, "hash": "abc",
             "sourceMap": "app/app.js.map", "sourceMapUrl": "/app.js.map"},
            {"where": "server", "url": "/server.js", "path": "server.js",
             "type": "js", "cacheable": false, "hash": "def"},
        ]));
        let manifest = AssetManifest::parse(&data, "ios").unwrap();
        assert_eq!(manifest.version, "v1");
        assert_eq!(manifest.compatibility_version, "1.0.0");
        assert_eq!(manifest.entries.len(), 1);
        let entry = &manifest.entries[0];
        assert_eq!(entry.url_path, "/app.js?hash=abc");
        assert_eq!(entry.hash.as_deref(), Some("abc"));
        assert_eq!(entry.source_map_url_path.as_deref(), Some("/app.js.map"));
    }

    #[test]
    fn rejects_unknown_format() {
        let data = json!({"format": "web-program-pre2", "version": "v1"}).to_string();
        let err = AssetManifest::parse(data.as_bytes(), "ios").unwrap_err();
        assert!(matches!(err, HotPushError::ManifestFormat { .. }));
        assert!(err.to_string().contains("web-program-pre2"));
    }

    #[test]
    fn accepts_missing_format_tag() {
        let data = json!({
            "version": "v1",
            "cordovaCompatibilityVersions": {"ios": "1.0.0"},
        })
        .to_string();
        let manifest = AssetManifest::parse(data.as_bytes(), "ios").unwrap();
        assert!(manifest.entries.is_empty());
    }

    #[test]
    fn rejects_missing_version() {
        let data = json!({
            "format": "web-program-pre1",
            "cordovaCompatibilityVersions": {"ios": "1.0.0"},
        })
        .to_string();
        let err = AssetManifest::parse(data.as_bytes(), "ios").unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn rejects_missing_platform_key() {
        let data = json!({
            "format": "web-program-pre1",
            "version": "v1",
            "cordovaCompatibilityVersions": {"android": "1.0.0"},
        })
        .to_string();
        assert!(AssetManifest::parse(data.as_bytes(), "ios").is_err());
    }

    #[test]
    fn drops_entries_missing_required_fields() {
        let data = manifest_json(json!([
            {"where": "client", "url": "/ok.js", "path": "ok.js",
             "type": "js", "cacheable": true, "hash": "abc"},
            // No hash: dropped, not fatal.
            {"where": "client", "url": "/bad.js", "path": "bad.js",
             "type": "js", "cacheable": true},
            // Not an object at all.
            "garbage",
        ]));
        let manifest = AssetManifest::parse(&data, "ios").unwrap();
        assert_eq!(manifest.entries.len(), 1);
        assert_eq!(manifest.entries[0].url_path, "/ok.js");
    }

    #[test]
    fn invalid_json_is_a_format_error() {
        let err = AssetManifest::parse(b"not json", "ios").unwrap_err();
        assert!(matches!(err, HotPushError::ManifestFormat { .. }));
    }
}
