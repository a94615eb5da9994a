//! Update lifecycle orchestration.
//!
//! [`UpdateOrchestrator`] ties the pieces together: it selects which bundle is
//! current at startup, gates which remote versions get downloaded, holds the
//! downloaded bundle as pending until the embedding application applies it,
//! and supervises every switch with a startup watchdog. A version only
//! becomes last-known-good when the application explicitly reports a
//! successful startup; until then the watchdog stands ready to roll back and
//! record the failure under the two-strike rule.
//!
//! The pieces the host platform must supply are trait seams:
//! [`ServingBridge`] points whatever serves the assets at a directory and
//! triggers page reloads, and [`BundleOrganizer`] materializes a bundle's
//! full asset tree (own assets plus inherited ones) into a serving directory.

use crate::bundle::{AssetBundle, AssetManifest};
use crate::constants::{DEFAULT_STARTUP_TIMEOUT, SERVER_PATH_PREFIX};
use crate::core::{HotPushError, Result};
use crate::manager::{BundleManager, CheckOutcome, DownloaderOptions, UpdatePolicy};
use crate::state::VersionStore;
use crate::utils::fs::{ensure_dir, remove_dir_if_exists};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Connection to whatever serves bundle assets to the application.
pub trait ServingBridge: Send + Sync {
    /// Points the server at a new asset directory. Takes effect on the next
    /// page load.
    fn set_server_base_path(&self, path: &Path);
    /// Requests an ordinary page reload.
    fn reload(&self);
    /// Requests a reload that bypasses any client-side caches. Used for
    /// rollbacks, where the version being abandoned cannot be trusted to
    /// serve even its own reload.
    fn force_reload(&self);
}

/// Materializes a bundle's complete asset tree into a serving directory.
///
/// A bundle stores only the assets that differ from its parent chain; the
/// organizer walks the chain and lays out the full set under `target` so a
/// plain file server can serve the version.
pub trait BundleOrganizer: Send + Sync {
    fn organize(&self, bundle: &AssetBundle, target: &Path) -> Result<()>;
}

/// Notifications delivered to the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateEvent {
    /// A new version finished downloading and is pending.
    UpdateAvailable { version: String },
    /// An update check failed or a version was refused.
    UpdateFailed { message: String },
}

/// Construction parameters for [`UpdateOrchestrator`].
pub struct OrchestratorConfig {
    /// Directory holding the installer-bundled web assets (`program.json`
    /// and friends).
    pub initial_bundle_dir: PathBuf,
    /// Writable directory the engine owns. Version and serving trees and the
    /// persistent state file live underneath.
    pub data_dir: PathBuf,
    /// Key looked up in the manifest compatibility map.
    pub platform: String,
    /// How long a freshly switched version gets to report a successful
    /// startup before it is rolled back.
    pub startup_timeout: Duration,
    /// Tuning passed through to the downloader.
    pub downloader: DownloaderOptions,
}

impl OrchestratorConfig {
    pub fn new(initial_bundle_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            initial_bundle_dir: initial_bundle_dir.into(),
            data_dir: data_dir.into(),
            platform: crate::constants::DEFAULT_PLATFORM.to_string(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            downloader: DownloaderOptions::default(),
        }
    }
}

struct Versions {
    current: Arc<AssetBundle>,
    pending: Option<Arc<AssetBundle>>,
}

/// Coordinates startup selection, update checks, switches, and rollback.
pub struct UpdateOrchestrator {
    store: Arc<VersionStore>,
    manager: Arc<BundleManager>,
    bridge: Arc<dyn ServingBridge>,
    organizer: Arc<dyn BundleOrganizer>,
    events: mpsc::UnboundedSender<UpdateEvent>,
    serving_dir: PathBuf,
    startup_timeout: Duration,
    state: tokio::sync::Mutex<Versions>,
    // One update check at a time; a second caller waits for the first.
    check_lock: tokio::sync::Mutex<()>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl UpdateOrchestrator {
    /// Initializes the engine and starts serving a bundle.
    ///
    /// Loads the installer bundle, detects installer upgrades (a changed
    /// initial version wipes all downloaded state), selects the bundle to
    /// serve, points `bridge` at it, and arms the watchdog if the selected
    /// version has not yet proven itself.
    ///
    /// Returns the orchestrator together with the receiving end of its event
    /// channel.
    ///
    /// Must be called from within a Tokio runtime: the startup watchdog,
    /// when armed, is spawned onto it.
    ///
    /// # Errors
    ///
    /// [`HotPushError::Initialization`] if the installer bundle cannot be
    /// loaded, plus I/O errors from preparing the directory tree.
    pub fn new(
        config: OrchestratorConfig,
        bridge: Arc<dyn ServingBridge>,
        organizer: Arc<dyn BundleOrganizer>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<UpdateEvent>)> {
        let store = Arc::new(VersionStore::load(config.data_dir.join("state.toml"))?);

        let initial = AssetBundle::load(&config.initial_bundle_dir, &config.platform, None)
            .map_err(|e| HotPushError::Initialization {
                reason: format!("could not load initial asset bundle: {e}"),
            })?;
        let initial = Arc::new(initial);

        let versions_dir = config.data_dir.join("versions");
        let serving_dir = config.data_dir.join("serving");

        // A changed installer bundle invalidates everything downloaded
        // against the previous install.
        if store.last_seen_initial_version().as_deref() != Some(initial.version()) {
            info!(version = initial.version(), "new initial version detected, clearing state");
            remove_dir_if_exists(&versions_dir)?;
            remove_dir_if_exists(&serving_dir)?;
            store.reset()?;
            store.set_last_seen_initial_version(initial.version())?;
        }
        ensure_dir(&versions_dir)?;
        ensure_dir(&serving_dir)?;

        let manager = Arc::new(BundleManager::new(
            Arc::clone(&store),
            versions_dir,
            Arc::clone(&initial),
            config.platform.clone(),
            config.downloader,
        )?);

        let current = store
            .last_downloaded_version()
            .and_then(|v| manager.downloaded_bundle_with_version(&v))
            .unwrap_or_else(|| Arc::clone(&initial));
        info!(version = current.version(), "serving asset bundle");

        let (events, receiver) = mpsc::unbounded_channel();
        let orchestrator = Arc::new(Self {
            store,
            manager,
            bridge,
            organizer,
            events,
            serving_dir,
            startup_timeout: config.startup_timeout,
            state: tokio::sync::Mutex::new(Versions {
                current: Arc::clone(&current),
                pending: None,
            }),
            check_lock: tokio::sync::Mutex::new(()),
            watchdog: Mutex::new(None),
        });

        orchestrator.sync_identity(&current)?;
        orchestrator.serve(&current)?;

        // The selected version may still be unproven (a fresh download that
        // crashed before confirming, or a first run of a new install).
        if orchestrator.store.last_known_good_version().as_deref() != Some(current.version()) {
            orchestrator.arm_watchdog();
        }

        Ok((orchestrator, receiver))
    }

    /// The version currently being served.
    pub async fn current_version(&self) -> String {
        self.state.lock().await.current.version().to_string()
    }

    /// Whether a downloaded version is waiting to be applied.
    pub async fn is_update_available(&self) -> bool {
        self.state.lock().await.pending.is_some()
    }

    /// Checks the update origin for a new version and downloads it.
    ///
    /// The origin is the `ROOT_URL` from the current bundle's runtime
    /// configuration. Outcomes are reported on the event channel: a
    /// successful download emits [`UpdateEvent::UpdateAvailable`], a refusal
    /// (blacklist or compatibility) or failure emits
    /// [`UpdateEvent::UpdateFailed`]. A version that is already current or
    /// already pending is a silent no-op.
    pub async fn check_for_updates(&self) -> Result<()> {
        let _guard = self.check_lock.lock().await;

        let (current, gate) = {
            let state = self.state.lock().await;
            let gate = UpdateGate {
                current_version: state.current.version().to_string(),
                pending_version: state.pending.as_ref().map(|b| b.version().to_string()),
                compatibility_version: state.current.compatibility_version().to_string(),
                store: Arc::clone(&self.store),
                decline: Mutex::new(None),
            };
            (Arc::clone(&state.current), gate)
        };

        let root_url = current.root_url().ok_or_else(|| HotPushError::Initialization {
            reason: "checkForUpdates requires a rootURL to be configured".into(),
        })?;
        let base_url = root_url.join(SERVER_PATH_PREFIX).map_err(|e| {
            HotPushError::Initialization { reason: format!("invalid rootURL: {e}") }
        })?;

        match self.manager.check_for_updates(&base_url, current, &gate).await {
            Ok(CheckOutcome::Downloaded(bundle)) => {
                let version = bundle.version().to_string();
                self.store.set_last_downloaded_version(&version)?;
                self.state.lock().await.pending = Some(bundle);
                info!(version, "update downloaded and pending");
                self.emit(UpdateEvent::UpdateAvailable { version });
                Ok(())
            }
            Ok(CheckOutcome::UpToDate) => {
                if let Some(message) = gate.decline.lock().expect("gate lock").take() {
                    warn!("{message}");
                    self.emit(UpdateEvent::UpdateFailed { message });
                }
                Ok(())
            }
            Err(e) => {
                error!("update check failed: {e}");
                self.emit(UpdateEvent::UpdateFailed { message: e.to_string() });
                Err(e)
            }
        }
    }

    /// Switches to the pending version and asks the bridge to reload.
    ///
    /// # Errors
    ///
    /// [`HotPushError::NoPendingVersion`] when nothing is pending, so callers
    /// cannot mistake a dropped switch for an applied one.
    pub async fn reload(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock().await;
        let pending = state.pending.clone().ok_or(HotPushError::NoPendingVersion)?;
        self.switch_to(&mut state, pending)?;
        state.pending = None;
        drop(state);

        self.bridge.reload();
        self.arm_watchdog();
        Ok(())
    }

    /// Marks the running version as having started up successfully.
    ///
    /// Disarms the watchdog, records the version as last-known-good, and
    /// prunes older downloaded versions in the background.
    pub async fn startup_did_complete(&self) -> Result<()> {
        self.disarm_watchdog();
        let version = self.current_version().await;
        info!(version, "startup confirmed");
        self.store.set_last_known_good_version(&version)?;

        let manager = Arc::clone(&self.manager);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = manager.remove_downloaded_bundles_except(&version) {
                warn!("could not remove old asset bundles: {e}");
            }
        });
        Ok(())
    }

    /// The application is moving to the background. Suspends the active
    /// download and disarms the watchdog so a backgrounded app is not
    /// penalized for not starting up.
    pub fn on_background(&self) {
        self.disarm_watchdog();
        self.manager.suspend_active();
    }

    /// The application returned to the foreground.
    pub fn on_foreground(&self) {
        self.manager.resume_active();
    }

    /// Organizes `bundle` into the serving tree and makes it current.
    fn switch_to(&self, state: &mut Versions, bundle: Arc<AssetBundle>) -> Result<()> {
        self.serve(&bundle)?;
        self.sync_identity(&bundle)?;
        info!(from = state.current.version(), to = bundle.version(), "switching asset bundle");
        state.current = bundle;
        Ok(())
    }

    fn serve(&self, bundle: &Arc<AssetBundle>) -> Result<()> {
        let target = self.serving_dir.join(bundle.version());
        self.organizer.organize(bundle, &target)?;
        self.bridge.set_server_base_path(&target);
        Ok(())
    }

    /// Records the served bundle's identity so later downloads can be
    /// checked against it.
    fn sync_identity(&self, bundle: &Arc<AssetBundle>) -> Result<()> {
        if let Some(app_id) = bundle.app_id() {
            self.store.set_app_id(app_id)?;
        }
        if let Some(root_url) = bundle.root_url() {
            self.store.set_root_url(root_url.as_str())?;
        }
        self.store.set_compatibility_version(bundle.compatibility_version())
    }

    fn emit(&self, event: UpdateEvent) {
        // A dropped receiver just means nobody is listening.
        let _ = self.events.send(event);
    }

    /// Arms (or re-arms) the startup watchdog. Requires a Tokio runtime.
    pub fn arm_watchdog(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let timeout = self.startup_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(orchestrator) = weak.upgrade() {
                warn!("version failed to start up in time, reverting");
                orchestrator.revert_to_last_good().await;
            }
        });
        if let Some(previous) = self.watchdog.lock().expect("watchdog lock").replace(handle) {
            previous.abort();
        }
    }

    fn disarm_watchdog(&self) {
        if let Some(handle) = self.watchdog.lock().expect("watchdog lock").take() {
            handle.abort();
        }
    }

    /// Rolls back after a startup watchdog expiry.
    ///
    /// The running version is recorded as faulty (two-strike rule). The
    /// fallback is the last-known-good downloaded version if it still loads,
    /// else the installer bundle. With no usable fallback the engine stays
    /// put and logs.
    async fn revert_to_last_good(self: Arc<Self>) {
        let mut state = self.state.lock().await;
        let failed_version = state.current.version().to_string();

        if let Err(e) = self.store.add_faulty_version(&failed_version) {
            warn!("could not record faulty version: {e}");
        }

        let initial = self.manager.initial_bundle();
        let fallback = self
            .store
            .last_known_good_version()
            .filter(|v| *v != failed_version)
            .and_then(|v| {
                if v == initial.version() {
                    Some(Arc::clone(initial))
                } else {
                    self.manager.downloaded_bundle_with_version(&v)
                }
            })
            .or_else(|| {
                (failed_version != initial.version()).then(|| Arc::clone(initial))
            });

        let Some(fallback) = fallback else {
            warn!(version = failed_version, "no previous version to revert to");
            return;
        };

        info!(from = failed_version, to = fallback.version(), "reverting asset bundle");
        if let Err(e) = self.switch_to(&mut state, fallback) {
            error!("could not revert to previous version: {e}");
            return;
        }
        state.pending = None;
        drop(state);

        self.bridge.force_reload();
        // The fallback must prove itself too, unless it is already known good.
        if self.store.last_known_good_version() != Some(self.current_version().await) {
            self.arm_watchdog();
        }
    }
}

/// Download gate snapshotting the orchestrator's decision inputs.
///
/// Declines for blacklist or compatibility reasons leave a message behind so
/// the orchestrator can surface them as events; declines because the version
/// is already current or pending stay silent.
struct UpdateGate {
    current_version: String,
    pending_version: Option<String>,
    compatibility_version: String,
    store: Arc<VersionStore>,
    decline: Mutex<Option<String>>,
}

impl UpdatePolicy for UpdateGate {
    fn should_download(&self, manifest: &AssetManifest) -> bool {
        let version = &manifest.version;
        if *version == self.current_version {
            debug!(version, "remote version is already current");
            return false;
        }
        if self.pending_version.as_ref() == Some(version) {
            debug!(version, "remote version is already pending");
            return false;
        }
        if self.store.is_blacklisted(version) {
            *self.decline.lock().expect("gate lock") =
                Some(format!("Skipping downloading blacklisted version: {version}"));
            return false;
        }
        if manifest.compatibility_version != self.compatibility_version {
            *self.decline.lock().expect("gate lock") = Some(format!(
                "Skipping downloading new version because the native side has \
                 changed and may be incompatible: {version}"
            ));
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn gate(dir: &TempDir) -> UpdateGate {
        UpdateGate {
            current_version: "v1".into(),
            pending_version: Some("v2".into()),
            compatibility_version: "1.0.0".into(),
            store: Arc::new(VersionStore::load(dir.path().join("state.toml")).unwrap()),
            decline: Mutex::new(None),
        }
    }

    fn manifest(version: &str, compatibility: &str) -> AssetManifest {
        AssetManifest {
            version: version.into(),
            compatibility_version: compatibility.into(),
            entries: Vec::new(),
        }
    }

    #[test]
    fn gate_accepts_a_new_compatible_version() {
        let dir = TempDir::new().unwrap();
        let gate = gate(&dir);
        assert!(gate.should_download(&manifest("v3", "1.0.0")));
        assert!(gate.decline.lock().unwrap().is_none());
    }

    #[test]
    fn gate_declines_current_and_pending_silently() {
        let dir = TempDir::new().unwrap();
        let gate = gate(&dir);
        assert!(!gate.should_download(&manifest("v1", "1.0.0")));
        assert!(!gate.should_download(&manifest("v2", "1.0.0")));
        assert!(gate.decline.lock().unwrap().is_none());
    }

    #[test]
    fn gate_declines_blacklisted_version_with_message() {
        let dir = TempDir::new().unwrap();
        let gate = gate(&dir);
        gate.store.add_faulty_version("v3").unwrap();
        gate.store.add_faulty_version("v3").unwrap();

        assert!(!gate.should_download(&manifest("v3", "1.0.0")));
        let message = gate.decline.lock().unwrap().take().unwrap();
        assert!(message.contains("blacklisted"));
    }

    #[test]
    fn gate_allows_a_version_awaiting_its_second_chance() {
        let dir = TempDir::new().unwrap();
        let gate = gate(&dir);
        gate.store.add_faulty_version("v3").unwrap();

        assert!(gate.should_download(&manifest("v3", "1.0.0")));
    }

    #[test]
    fn gate_declines_incompatible_version_with_message() {
        let dir = TempDir::new().unwrap();
        let gate = gate(&dir);
        assert!(!gate.should_download(&manifest("v3", "2.0.0")));
        let message = gate.decline.lock().unwrap().take().unwrap();
        assert!(message.contains("incompatible"));
    }
}
