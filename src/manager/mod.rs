//! Update checking and on-disk bundle management.
//!
//! [`BundleManager`] owns the versions directory and runs the update-check
//! protocol: fetch the remote manifest, ask the injected [`UpdatePolicy`]
//! whether the version is even worth considering, diff against what is
//! already on disk, and drive a [`BundleDownloader`] for the assets nothing
//! satisfies. Completed bundles are staged in a scratch directory
//! and renamed into place, so a version directory only ever exists fully
//! verified. Old version directories are pruned once a startup has been
//! confirmed good.

use crate::bundle::{AssetBundle, AssetManifest};
use crate::constants::{
    CONNECT_TIMEOUT, DOWNLOADING_DIR_NAME, MANIFEST_FILE_NAME, REQUEST_TIMEOUT,
};
use crate::core::{HotPushError, Result};
use crate::downloader::{BundleDownloader, ReachabilityStatus, WorkLease};
use crate::state::VersionStore;
use crate::utils::backoff::RetryPolicy;
use crate::utils::fs::{atomic_write, ensure_dir, remove_dir_if_exists};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

/// Gate consulted before a manifest version is downloaded.
///
/// Implemented by the update orchestrator; the fixed method set replaces an
/// open-ended callback so the manager cannot reenter orchestrator state.
pub trait UpdatePolicy: Send + Sync {
    /// Whether the version described by `manifest` should be downloaded.
    /// Returning `false` makes the check a no-op, not an error.
    fn should_download(&self, manifest: &AssetManifest) -> bool;
}

/// Result of a completed update check.
#[derive(Debug)]
pub enum CheckOutcome {
    /// The remote version was declined by policy (already current or
    /// pending, blacklisted, or incompatible). Nothing was downloaded.
    UpToDate,
    /// A fully verified bundle is available on disk.
    Downloaded(Arc<AssetBundle>),
}

/// Tuning knobs threaded through to the downloader.
#[derive(Default)]
pub struct DownloaderOptions {
    /// Retry curve override; `None` uses the production curve.
    pub retry: Option<RetryPolicy>,
    /// Reachability subscription for shortening retry waits.
    pub reachability: Option<watch::Receiver<ReachabilityStatus>>,
    /// Platform long-running-work lease.
    pub lease: Option<Arc<dyn WorkLease>>,
}

/// Manages downloaded bundle versions on disk and runs update checks.
pub struct BundleManager {
    client: reqwest::Client,
    store: Arc<VersionStore>,
    versions_dir: PathBuf,
    initial_bundle: Arc<AssetBundle>,
    platform: String,
    options: DownloaderOptions,
    active: Mutex<Option<Arc<BundleDownloader>>>,
}

impl BundleManager {
    /// Creates a manager rooted at `versions_dir`.
    ///
    /// `initial_bundle` is the installer-bundled version; it serves as the
    /// parent for bundles reloaded from disk.
    pub fn new(
        store: Arc<VersionStore>,
        versions_dir: impl Into<PathBuf>,
        initial_bundle: Arc<AssetBundle>,
        platform: impl Into<String>,
        options: DownloaderOptions,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| HotPushError::Initialization {
                reason: format!("could not build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            store,
            versions_dir: versions_dir.into(),
            initial_bundle,
            platform: platform.into(),
            options,
            active: Mutex::new(None),
        })
    }

    /// The installer-bundled bundle.
    pub fn initial_bundle(&self) -> &Arc<AssetBundle> {
        &self.initial_bundle
    }

    fn version_directory(&self, version: &str) -> PathBuf {
        self.versions_dir.join(version)
    }

    fn downloading_directory(&self) -> PathBuf {
        self.versions_dir.join(DOWNLOADING_DIR_NAME)
    }

    /// Loads a previously downloaded bundle, if its directory still exists.
    pub fn downloaded_bundle_with_version(&self, version: &str) -> Option<Arc<AssetBundle>> {
        let directory = self.version_directory(version);
        if !directory.join(MANIFEST_FILE_NAME).exists() {
            return None;
        }
        match AssetBundle::load(
            &directory,
            &self.platform,
            Some(Arc::clone(&self.initial_bundle)),
        ) {
            Ok(bundle) => Some(Arc::new(bundle)),
            Err(e) => {
                warn!(version, "could not load downloaded asset bundle: {e}");
                None
            }
        }
    }

    /// Runs one update check against `base_url`.
    ///
    /// `current` is the bundle currently being served; its assets satisfy
    /// matching manifest entries so only genuinely changed assets are
    /// downloaded. The entry document is always re-fetched and re-verified.
    ///
    /// # Errors
    ///
    /// Manifest, validation, integrity, and transport errors per the crate
    /// taxonomy. On any download failure the staged candidate directory is
    /// discarded; no partially downloaded bundle survives.
    pub async fn check_for_updates(
        &self,
        base_url: &Url,
        current: Arc<AssetBundle>,
        policy: &dyn UpdatePolicy,
    ) -> Result<CheckOutcome> {
        let (manifest_bytes, manifest) = self.fetch_manifest(base_url).await?;
        let version = manifest.version.clone();
        debug!(version, "downloaded asset manifest");

        if !policy.should_download(&manifest) {
            debug!(version, "version declined by policy, not downloading");
            return Ok(CheckOutcome::UpToDate);
        }

        // A fully downloaded copy of this version may already be on disk
        // from an earlier check that never got switched to.
        if let Some(existing) = self.downloaded_bundle_with_version(&version) {
            info!(version, "using previously downloaded asset bundle");
            return Ok(CheckOutcome::Downloaded(existing));
        }

        info!(version, "downloading new asset bundle");
        match self.download_candidate(base_url, &manifest, &manifest_bytes, current).await {
            Ok(bundle) => Ok(CheckOutcome::Downloaded(bundle)),
            Err(e) => {
                // All-or-nothing: a failed candidate leaves no trace.
                if let Err(cleanup) = remove_dir_if_exists(&self.downloading_directory()) {
                    warn!("could not remove staging directory: {cleanup}");
                }
                Err(e)
            }
        }
    }

    async fn fetch_manifest(&self, base_url: &Url) -> Result<(Vec<u8>, AssetManifest)> {
        let manifest_url = base_url.join("manifest.json").map_err(|e| {
            HotPushError::Initialization { reason: format!("invalid base URL: {e}") }
        })?;
        let response = self
            .client
            .get(manifest_url.clone())
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| HotPushError::Transport { operation: "manifest fetch".into(), source: e })?;
        let data = response.bytes().await.map_err(|e| HotPushError::Transport {
            operation: "manifest fetch".into(),
            source: e,
        })?;
        let manifest = AssetManifest::parse(&data, &self.platform)?;
        Ok((data.to_vec(), manifest))
    }

    /// Stages, downloads, and commits a candidate bundle.
    async fn download_candidate(
        &self,
        base_url: &Url,
        manifest: &AssetManifest,
        manifest_bytes: &[u8],
        current: Arc<AssetBundle>,
    ) -> Result<Arc<AssetBundle>> {
        let staging = self.downloading_directory();
        remove_dir_if_exists(&staging)?;
        ensure_dir(&staging)?;

        // The manifest lands first, verbatim, so the staged tree is loadable
        // as a bundle the moment its assets do.
        atomic_write(&staging.join(MANIFEST_FILE_NAME), manifest_bytes)?;

        // Construction against the current bundle as parent computes the
        // exact set of unsatisfied assets; everything else is inherited.
        let candidate =
            Arc::new(AssetBundle::from_manifest(&staging, manifest, Some(current))?);
        let missing = candidate.own_assets().cloned().collect();

        let mut downloader = BundleDownloader::new(
            Arc::clone(&self.store),
            Arc::clone(&candidate),
            base_url.clone(),
            missing,
        )?;
        if let Some(retry) = &self.options.retry {
            downloader = downloader.with_retry_policy(retry.clone());
        }
        if let Some(rx) = &self.options.reachability {
            downloader = downloader.with_reachability(rx.clone());
        }
        if let Some(lease) = &self.options.lease {
            downloader = downloader.with_work_lease(Arc::clone(lease));
        }
        let downloader = Arc::new(downloader);

        *self.active.lock().expect("active downloader lock") = Some(Arc::clone(&downloader));
        let result = downloader.run().await;
        *self.active.lock().expect("active downloader lock") = None;
        result?;

        // Commit: the staged tree becomes the version directory atomically.
        let final_dir = self.version_directory(&manifest.version);
        remove_dir_if_exists(&final_dir)?;
        std::fs::rename(&staging, &final_dir).map_err(|e| HotPushError::io(&final_dir, e))?;

        let bundle = AssetBundle::load(
            &final_dir,
            &self.platform,
            Some(Arc::clone(&self.initial_bundle)),
        )?;
        Ok(Arc::new(bundle))
    }

    /// Suspends the in-flight download, if any (app went to background).
    pub fn suspend_active(&self) {
        if let Some(dl) = self.active.lock().expect("active downloader lock").as_ref() {
            dl.suspend();
        }
    }

    /// Resumes a suspended download, if any (app returned to foreground).
    pub fn resume_active(&self) {
        if let Some(dl) = self.active.lock().expect("active downloader lock").as_ref() {
            dl.resume();
        }
    }

    /// Cancels the in-flight download, if any.
    pub fn cancel_active(&self) {
        if let Some(dl) = self.active.lock().expect("active downloader lock").as_ref() {
            dl.cancel();
        }
    }

    /// Removes every downloaded version directory except `keep_version`.
    ///
    /// Called after a startup has been confirmed good so old versions do not
    /// accumulate. The staging directory is left alone.
    pub fn remove_downloaded_bundles_except(&self, keep_version: &str) -> Result<()> {
        let entries = match std::fs::read_dir(&self.versions_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(HotPushError::io(&self.versions_dir, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| HotPushError::io(&self.versions_dir, e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == keep_version || name == DOWNLOADING_DIR_NAME {
                continue;
            }
            if entry.path().is_dir() {
                info!(version = %name, "removing old asset bundle");
                remove_dir_if_exists(&entry.path())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::Path;
    use tempfile::TempDir;

    fn write_bundle_dir(dir: &Path, version: &str) {
        std::fs::create_dir_all(dir).unwrap();
        let manifest = json!({
            "format": "web-program-pre1",
            "version": version,
            "cordovaCompatibilityVersions": {"ios": "1.0.0"},
            "manifest": [
                {"where": "client", "url": "/app.js", "path": "app.js",
                 "type": "js", "cacheable": true, "hash": "abc"},
            ],
        });
        std::fs::write(dir.join(MANIFEST_FILE_NAME), manifest.to_string()).unwrap();
        std::fs::write(dir.join("index.html"), "<html></html>").unwrap();
    }

    fn manager(root: &Path) -> BundleManager {
        let initial_dir = root.join("www");
        write_bundle_dir(&initial_dir, "v1");
        let initial = Arc::new(AssetBundle::load(&initial_dir, "ios", None).unwrap());
        let store = Arc::new(VersionStore::load(root.join("state.toml")).unwrap());
        BundleManager::new(
            store,
            root.join("versions"),
            initial,
            "ios",
            DownloaderOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn missing_version_directory_loads_nothing() {
        let root = TempDir::new().unwrap();
        let manager = manager(root.path());
        assert!(manager.downloaded_bundle_with_version("v2").is_none());
    }

    #[test]
    fn existing_version_directory_loads_with_initial_parent() {
        let root = TempDir::new().unwrap();
        let manager = manager(root.path());
        write_bundle_dir(&root.path().join("versions").join("v2"), "v2");

        let bundle = manager.downloaded_bundle_with_version("v2").unwrap();
        assert_eq!(bundle.version(), "v2");
        // Assets already present in the installer bundle are inherited.
        assert!(!bundle.asset_exists("/app.js"));
        assert!(bundle.asset_for_url_path("/app.js").is_some());
    }

    #[test]
    fn unreadable_version_directory_loads_nothing() {
        let root = TempDir::new().unwrap();
        let manager = manager(root.path());
        let dir = root.path().join("versions").join("v2");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(MANIFEST_FILE_NAME), "not json").unwrap();

        assert!(manager.downloaded_bundle_with_version("v2").is_none());
    }

    #[test]
    fn retention_keeps_target_and_staging() {
        let root = TempDir::new().unwrap();
        let manager = manager(root.path());
        let versions = root.path().join("versions");
        write_bundle_dir(&versions.join("v2"), "v2");
        write_bundle_dir(&versions.join("v3"), "v3");
        std::fs::create_dir_all(versions.join(DOWNLOADING_DIR_NAME)).unwrap();

        manager.remove_downloaded_bundles_except("v3").unwrap();

        assert!(!versions.join("v2").exists());
        assert!(versions.join("v3").exists());
        assert!(versions.join(DOWNLOADING_DIR_NAME).exists());
    }

    #[test]
    fn retention_tolerates_missing_versions_directory() {
        let root = TempDir::new().unwrap();
        let manager = manager(root.path());
        manager.remove_downloaded_bundles_except("v1").unwrap();
    }
}
