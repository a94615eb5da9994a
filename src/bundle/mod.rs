//! Asset bundles: immutable, versioned sets of servable files.
//!
//! An [`AssetBundle`] is constructed from an [`AssetManifest`] rooted at a
//! directory. A bundle may reference a single **parent** bundle (the
//! previously current one): during construction, any manifest entry the
//! parent already satisfies (same URL path with a matching hash, or a
//! matching hashless non-cacheable entry) is *not* duplicated in the child.
//! Lookups fall through to the parent chain instead. This content-addressed
//! reuse is what makes incremental updates cheap: only genuinely changed
//! assets exist in (and are downloaded into) the child bundle.

pub mod asset;
pub mod manifest;
pub mod runtime_config;

pub use asset::Asset;
pub use manifest::{AssetManifest, ManifestEntry};
pub use runtime_config::RuntimeConfig;

use crate::constants::{INDEX_FILE_NAME, INDEX_URL_PATH};
use crate::core::{HotPushError, Result};
use crate::utils::paths::{has_path_traversal, url_path_has_traversal, url_path_without_query};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::warn;
use url::Url;

/// An immutable, versioned collection of [`Asset`]s rooted at a directory.
pub struct AssetBundle {
    directory: PathBuf,
    version: String,
    compatibility_version: String,
    parent: Option<Arc<AssetBundle>>,
    own_assets: HashMap<String, Arc<Asset>>,
    index_asset: Arc<Asset>,
    // Memoized runtime config; parsing reads the entry document once.
    runtime_config: OnceLock<Option<RuntimeConfig>>,
}

impl AssetBundle {
    /// Loads a bundle from a directory containing `program.json`.
    pub fn load(
        directory: impl Into<PathBuf>,
        platform: &str,
        parent: Option<Arc<AssetBundle>>,
    ) -> Result<Self> {
        let directory = directory.into();
        let manifest = AssetManifest::load(&directory, platform)?;
        Self::from_manifest(directory, &manifest, parent)
    }

    /// Builds a bundle from a pre-parsed manifest.
    ///
    /// Entries already satisfied by `parent` are skipped; the entry document
    /// asset is always synthesized. Validation happens before any asset is
    /// recorded, and every violation found is reported together.
    ///
    /// # Errors
    ///
    /// Returns [`HotPushError::BundleValidation`] for duplicate URL paths or
    /// path-traversal sequences anywhere in the manifest.
    pub fn from_manifest(
        directory: impl Into<PathBuf>,
        manifest: &AssetManifest,
        parent: Option<Arc<AssetBundle>>,
    ) -> Result<Self> {
        let directory = directory.into();
        validate_entries(&manifest.entries)?;

        let index_asset = Arc::new(Asset {
            file_path: directory.join(INDEX_FILE_NAME),
            url_path: INDEX_URL_PATH.to_string(),
            file_type: Some("html".into()),
            cacheable: false,
            hash: None,
            source_map_url_path: None,
        });

        let mut own_assets = HashMap::new();
        for entry in &manifest.entries {
            let url_path = url_path_without_query(&entry.url_path).to_string();

            let satisfied_by_parent = parent
                .as_ref()
                .is_some_and(|p| p.cached_asset(&url_path, entry.hash.as_deref()).is_some());
            if !satisfied_by_parent {
                let asset = Arc::new(Asset {
                    file_path: directory.join(&entry.file_path),
                    url_path: url_path.clone(),
                    file_type: Some(entry.file_type.clone()),
                    cacheable: entry.cacheable,
                    hash: entry.hash.clone(),
                    source_map_url_path: entry.source_map_url_path.clone(),
                });
                own_assets.insert(url_path, asset);
            }

            // A source map becomes its own cacheable, hashless asset unless
            // the parent already carries it.
            if let (Some(map_path), Some(map_url_path)) =
                (&entry.source_map_path, &entry.source_map_url_path)
            {
                let map_url_path = url_path_without_query(map_url_path).to_string();
                let satisfied =
                    parent.as_ref().is_some_and(|p| p.cached_asset(&map_url_path, None).is_some());
                if !satisfied {
                    let asset = Arc::new(Asset {
                        file_path: directory.join(map_path),
                        url_path: map_url_path.clone(),
                        file_type: Some("json".into()),
                        cacheable: true,
                        hash: None,
                        source_map_url_path: None,
                    });
                    own_assets.insert(map_url_path, asset);
                }
            }
        }

        // The entry document is always owned by the bundle itself, even if
        // the manifest listed something at "/".
        own_assets.insert(index_asset.url_path.clone(), Arc::clone(&index_asset));

        Ok(Self {
            directory,
            version: manifest.version.clone(),
            compatibility_version: manifest.compatibility_version.clone(),
            parent,
            own_assets,
            index_asset,
            runtime_config: OnceLock::new(),
        })
    }

    /// The directory this bundle is rooted at.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// The bundle's release version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// The compatibility tag the manifest declared for this platform.
    pub fn compatibility_version(&self) -> &str {
        &self.compatibility_version
    }

    /// The synthesized entry document asset.
    pub fn index_asset(&self) -> &Arc<Asset> {
        &self.index_asset
    }

    /// Assets stored in this bundle itself (parent-satisfied entries excluded).
    pub fn own_assets(&self) -> impl Iterator<Item = &Arc<Asset>> {
        self.own_assets.values()
    }

    /// Resolves a URL path to an asset, falling back through the parent chain.
    pub fn asset_for_url_path(&self, url_path: &str) -> Option<Arc<Asset>> {
        self.own_assets
            .get(url_path)
            .cloned()
            .or_else(|| self.parent.as_ref().and_then(|p| p.asset_for_url_path(url_path)))
    }

    /// True if this bundle itself (not a parent) defines the URL path.
    pub fn asset_exists(&self, url_path: &str) -> bool {
        self.own_assets.contains_key(url_path)
    }

    /// Returns an asset suitable for reuse at `url_path`, searching the
    /// whole parent chain.
    ///
    /// This is the diffing gate: an asset is reusable only if it is cacheable
    /// or carries a hash, *and* its hash equals the requested one exactly.
    /// Two absent hashes compare equal, which covers cacheable hashless
    /// entries like source maps; a non-cacheable hashless asset is never
    /// reused.
    pub fn cached_asset(&self, url_path: &str, hash: Option<&str>) -> Option<Arc<Asset>> {
        let own = self.own_assets.get(url_path).filter(|asset| {
            (asset.cacheable || asset.hash.is_some()) && asset.hash.as_deref() == hash
        });
        match own {
            Some(asset) => Some(Arc::clone(asset)),
            None => self.parent.as_ref().and_then(|p| p.cached_asset(url_path, hash)),
        }
    }

    /// The runtime configuration embedded in this bundle's entry document.
    ///
    /// Parsed on first access and memoized; a bundle whose entry document
    /// carries no (or broken) config yields `None` on every access.
    pub fn runtime_config(&self) -> Option<&RuntimeConfig> {
        self.runtime_config
            .get_or_init(|| match RuntimeConfig::from_index_file(&self.index_asset.file_path) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!(version = %self.version, "error loading runtime config: {e}");
                    None
                }
            })
            .as_ref()
    }

    /// The app identifier from the runtime config.
    pub fn app_id(&self) -> Option<&str> {
        self.runtime_config().and_then(RuntimeConfig::app_id)
    }

    /// The server origin from the runtime config.
    pub fn root_url(&self) -> Option<Url> {
        self.runtime_config().and_then(RuntimeConfig::root_url)
    }
}

impl std::fmt::Debug for AssetBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetBundle")
            .field("version", &self.version)
            .field("directory", &self.directory)
            .field("own_assets", &self.own_assets.len())
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

/// Rejects duplicate URL paths and traversal sequences, reporting every
/// violation found so a broken build is diagnosable in one pass.
fn validate_entries(entries: &[ManifestEntry]) -> Result<()> {
    let mut violations = Vec::new();
    let mut seen = HashMap::new();

    for entry in entries {
        let url_path = url_path_without_query(&entry.url_path);
        let count = seen.entry(url_path.to_string()).or_insert(0u32);
        *count += 1;
        if *count == 2 {
            violations.push(format!("duplicate URL path: {url_path}"));
        }

        if url_path_has_traversal(url_path) {
            violations.push(format!("path traversal in URL path: {url_path}"));
        }
        if has_path_traversal(&entry.file_path) {
            violations.push(format!("path traversal in file path: {}", entry.file_path));
        }
        if let Some(map_path) = &entry.source_map_path
            && has_path_traversal(map_path)
        {
            violations.push(format!("path traversal in source map path: {map_path}"));
        }
    }

    if violations.is_empty() { Ok(()) } else { Err(HotPushError::BundleValidation { violations }) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn entry(url: &str, path: &str, hash: Option<&str>, cacheable: bool) -> ManifestEntry {
        ManifestEntry {
            url_path: url.into(),
            file_path: path.into(),
            file_type: "js".into(),
            cacheable,
            hash: hash.map(Into::into),
            source_map_path: None,
            source_map_url_path: None,
        }
    }

    fn manifest(version: &str, entries: Vec<ManifestEntry>) -> AssetManifest {
        AssetManifest { version: version.into(), compatibility_version: "1.0.0".into(), entries }
    }

    #[test]
    fn index_is_synthesized() {
        let dir = TempDir::new().unwrap();
        let bundle =
            AssetBundle::from_manifest(dir.path(), &manifest("v1", vec![]), None).unwrap();
        assert!(bundle.asset_exists("/"));
        assert_eq!(bundle.index_asset().file_path, dir.path().join("index.html"));
        assert!(!bundle.index_asset().cacheable);
        assert!(bundle.index_asset().hash.is_none());
    }

    #[test]
    fn query_strings_are_stripped_from_url_paths() {
        let dir = TempDir::new().unwrap();
        let m = manifest("v1", vec![entry("/app.js?hash=abc", "app.js", Some("abc"), true)]);
        let bundle = AssetBundle::from_manifest(dir.path(), &m, None).unwrap();
        assert!(bundle.asset_exists("/app.js"));
        assert!(!bundle.asset_exists("/app.js?hash=abc"));
    }

    #[test]
    fn unchanged_assets_resolve_through_parent() {
        let parent_dir = TempDir::new().unwrap();
        let child_dir = TempDir::new().unwrap();

        let v1 = manifest(
            "v1",
            vec![
                entry("/same.js", "same.js", Some("aaa"), true),
                entry("/changed.js", "changed.js", Some("bbb"), true),
            ],
        );
        let parent = Arc::new(AssetBundle::from_manifest(parent_dir.path(), &v1, None).unwrap());

        let v2 = manifest(
            "v2",
            vec![
                entry("/same.js", "same.js", Some("aaa"), true),
                entry("/changed.js", "changed.js", Some("ccc"), true),
            ],
        );
        let child =
            AssetBundle::from_manifest(child_dir.path(), &v2, Some(Arc::clone(&parent))).unwrap();

        // Unchanged asset: not duplicated, but resolvable via the parent.
        assert!(!child.asset_exists("/same.js"));
        let resolved = child.asset_for_url_path("/same.js").unwrap();
        assert!(resolved.file_path.starts_with(parent_dir.path()));

        // Changed asset: owned by the child.
        assert!(child.asset_exists("/changed.js"));
        let changed = child.asset_for_url_path("/changed.js").unwrap();
        assert!(changed.file_path.starts_with(child_dir.path()));
    }

    #[test]
    fn hashless_non_cacheable_entries_are_never_reused() {
        let parent_dir = TempDir::new().unwrap();
        let child_dir = TempDir::new().unwrap();

        let v1 = manifest("v1", vec![entry("/dynamic", "dynamic.html", None, false)]);
        let parent = Arc::new(AssetBundle::from_manifest(parent_dir.path(), &v1, None).unwrap());

        let v2 = manifest("v2", vec![entry("/dynamic", "dynamic.html", None, false)]);
        let child = AssetBundle::from_manifest(child_dir.path(), &v2, Some(parent)).unwrap();

        // Without a hash there is nothing to prove the content is unchanged.
        assert!(child.asset_exists("/dynamic"));
    }

    #[test]
    fn reuse_reaches_through_the_whole_parent_chain() {
        let dirs = [TempDir::new().unwrap(), TempDir::new().unwrap(), TempDir::new().unwrap()];

        let v1 = manifest("v1", vec![entry("/lib.js", "lib.js", Some("aaa"), true)]);
        let grandparent = Arc::new(AssetBundle::from_manifest(dirs[0].path(), &v1, None).unwrap());

        // v2 changes nothing about /lib.js, so it owns only its index.
        let v2 = manifest("v2", vec![entry("/lib.js", "lib.js", Some("aaa"), true)]);
        let parent = Arc::new(
            AssetBundle::from_manifest(dirs[1].path(), &v2, Some(grandparent)).unwrap(),
        );
        assert!(!parent.asset_exists("/lib.js"));

        // v3 must still find the grandparent's copy.
        let v3 = manifest("v3", vec![entry("/lib.js", "lib.js", Some("aaa"), true)]);
        let child =
            AssetBundle::from_manifest(dirs[2].path(), &v3, Some(Arc::clone(&parent))).unwrap();
        assert!(!child.asset_exists("/lib.js"));
        let resolved = child.asset_for_url_path("/lib.js").unwrap();
        assert!(resolved.file_path.starts_with(dirs[0].path()));
    }

    #[test]
    fn cached_asset_requires_hash_match() {
        let dir = TempDir::new().unwrap();
        let m = manifest(
            "v1",
            vec![
                entry("/a.js", "a.js", Some("aaa"), true),
                entry("/b", "b.html", None, false),
            ],
        );
        let bundle = AssetBundle::from_manifest(dir.path(), &m, None).unwrap();

        assert!(bundle.cached_asset("/a.js", Some("aaa")).is_some());
        assert!(bundle.cached_asset("/a.js", Some("zzz")).is_none());
        assert!(bundle.cached_asset("/a.js", None).is_none());
        // Non-cacheable and hashless: never reusable.
        assert!(bundle.cached_asset("/b", None).is_none());
        assert!(bundle.cached_asset("/missing", Some("aaa")).is_none());
    }

    #[test]
    fn source_maps_become_own_assets() {
        let dir = TempDir::new().unwrap();
        let mut e = entry("/app.js", "app.js", Some("abc"), true);
        e.source_map_path = Some("app.js.map".into());
        e.source_map_url_path = Some("/app.js.map".into());
        let bundle = AssetBundle::from_manifest(dir.path(), &manifest("v1", vec![e]), None).unwrap();

        let map = bundle.asset_for_url_path("/app.js.map").unwrap();
        assert!(map.cacheable);
        assert!(map.hash.is_none());
    }

    #[test]
    fn slash_prefixed_url_paths_are_accepted() {
        // URL paths always start with a slash; only `..` segments are
        // traversal, the leading slash is not.
        let dir = TempDir::new().unwrap();
        let m = manifest(
            "v1",
            vec![
                entry("/app.js", "app/app.js", Some("a"), true),
                entry("/merged-stylesheets.css", "app/merged-stylesheets.css", Some("b"), true),
            ],
        );
        let bundle = AssetBundle::from_manifest(dir.path(), &m, None).unwrap();
        assert!(bundle.asset_exists("/app.js"));
        assert!(bundle.asset_exists("/merged-stylesheets.css"));
    }

    #[test]
    fn parent_segments_in_url_paths_are_rejected() {
        let dir = TempDir::new().unwrap();
        let m = manifest("v1", vec![entry("/../escape.js", "escape.js", Some("a"), true)]);
        let err = AssetBundle::from_manifest(dir.path(), &m, None).unwrap_err();
        assert!(err.to_string().contains("/../escape.js"));
    }

    #[test]
    fn validation_collects_all_violations() {
        let dir = TempDir::new().unwrap();
        let m = manifest(
            "v1",
            vec![
                entry("/dup.js", "dup.js", Some("a"), true),
                entry("/dup.js", "dup2.js", Some("b"), true),
                entry("/evil.js", "../outside.js", Some("c"), true),
            ],
        );
        let err = AssetBundle::from_manifest(dir.path(), &m, None).unwrap_err();
        let HotPushError::BundleValidation { violations } = err else {
            panic!("expected validation error");
        };
        assert_eq!(violations.len(), 2);
        assert!(violations[0].contains("/dup.js"));
        assert!(violations[1].contains("../outside.js"));
    }

    #[test]
    fn runtime_config_is_memoized_from_index() {
        let dir = TempDir::new().unwrap();
        let html = runtime_config::index_html_with_config(&json!({
            "appId": "app-1",
            "ROOT_URL": "https://example.com/",
        }));
        std::fs::write(dir.path().join("index.html"), html).unwrap();

        let bundle =
            AssetBundle::from_manifest(dir.path(), &manifest("v1", vec![]), None).unwrap();
        assert_eq!(bundle.app_id(), Some("app-1"));

        // Deleting the file after the first read must not change the answer.
        std::fs::remove_file(dir.path().join("index.html")).unwrap();
        assert_eq!(bundle.app_id(), Some("app-1"));
    }

    #[test]
    fn missing_index_yields_no_runtime_config() {
        let dir = TempDir::new().unwrap();
        let bundle =
            AssetBundle::from_manifest(dir.path(), &manifest("v1", vec![]), None).unwrap();
        assert!(bundle.runtime_config().is_none());
        assert!(bundle.app_id().is_none());
    }
}
