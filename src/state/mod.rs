//! Durable version state.
//!
//! A small key/value record of version pointers and failure lists, consulted
//! and mutated throughout the update lifecycle. The store is an explicit
//! instance passed to every component that needs it (constructor injection),
//! so concurrent engines and tests get isolated state. It persists as a TOML
//! file, rewritten atomically on every mutation.
//!
//! Blacklisting follows a two-strike rule: the first startup failure of a
//! version records intent to retry once; a second failure moves it to the
//! blacklist. A version is never in both lists at the same time.

use crate::core::Result;
use crate::utils::fs::atomic_write;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StoreData {
    /// Version shipped in the app installer, as last observed.
    last_seen_initial_version: Option<String>,
    /// Version of the most recently downloaded bundle.
    last_downloaded_version: Option<String>,
    /// Most recent version that completed startup successfully.
    last_known_good_version: Option<String>,
    /// Versions excluded from being selected as an update target.
    #[serde(default)]
    blacklisted_versions: BTreeSet<String>,
    /// Versions that failed startup once and get one more attempt.
    #[serde(default)]
    versions_to_retry: BTreeSet<String>,
    /// App identifier from the current bundle's runtime config.
    app_id: Option<String>,
    /// Server origin from the current bundle's runtime config.
    root_url: Option<String>,
    /// Compatibility tag of the currently installed native shell.
    compatibility_version: Option<String>,
}

/// Durable store of version pointers and blacklist/retry lists.
#[derive(Debug)]
pub struct VersionStore {
    path: PathBuf,
    data: Mutex<StoreData>,
}

impl VersionStore {
    /// Opens the store at `path`, starting from defaults if the file does
    /// not exist yet.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = match std::fs::read_to_string(&path) {
            Ok(text) => toml::from_str(&text).unwrap_or_else(|e| {
                warn!(path = %path.display(), "version store unreadable, starting fresh: {e}");
                StoreData::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreData::default(),
            Err(e) => return Err(crate::core::HotPushError::io(&path, e)),
        };
        Ok(Self { path, data: Mutex::new(data) })
    }

    /// Where the store persists itself.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, data: &StoreData) -> Result<()> {
        let text = toml::to_string_pretty(data).expect("version store serializes");
        atomic_write(&self.path, text.as_bytes())
    }

    fn update<R>(&self, mutate: impl FnOnce(&mut StoreData) -> R) -> Result<R> {
        let mut data = self.data.lock().expect("version store lock");
        let result = mutate(&mut data);
        self.persist(&data)?;
        Ok(result)
    }

    fn read<R>(&self, get: impl FnOnce(&StoreData) -> R) -> R {
        get(&self.data.lock().expect("version store lock"))
    }

    /// The installer-bundled version as last observed.
    pub fn last_seen_initial_version(&self) -> Option<String> {
        self.read(|d| d.last_seen_initial_version.clone())
    }

    pub fn set_last_seen_initial_version(&self, version: &str) -> Result<()> {
        self.update(|d| d.last_seen_initial_version = Some(version.to_string()))
    }

    /// The most recently downloaded version, if any.
    pub fn last_downloaded_version(&self) -> Option<String> {
        self.read(|d| d.last_downloaded_version.clone())
    }

    pub fn set_last_downloaded_version(&self, version: &str) -> Result<()> {
        self.update(|d| d.last_downloaded_version = Some(version.to_string()))
    }

    /// The most recent version that completed startup.
    pub fn last_known_good_version(&self) -> Option<String> {
        self.read(|d| d.last_known_good_version.clone())
    }

    pub fn set_last_known_good_version(&self, version: &str) -> Result<()> {
        debug!(version, "recording last known good version");
        self.update(|d| d.last_known_good_version = Some(version.to_string()))
    }

    /// The app identifier the engine is currently bound to.
    pub fn app_id(&self) -> Option<String> {
        self.read(|d| d.app_id.clone())
    }

    /// Records the app identifier, warning on identity drift.
    pub fn set_app_id(&self, app_id: &str) -> Result<()> {
        self.update(|d| {
            if let Some(old) = &d.app_id
                && old != app_id
            {
                warn!(new = app_id, old, "appId seems to have changed");
            }
            d.app_id = Some(app_id.to_string());
        })
    }

    /// The server origin the engine checks for updates.
    pub fn root_url(&self) -> Option<String> {
        self.read(|d| d.root_url.clone())
    }

    /// Records the server origin, warning on identity drift.
    pub fn set_root_url(&self, root_url: &str) -> Result<()> {
        self.update(|d| {
            if let Some(old) = &d.root_url
                && old != root_url
            {
                warn!(new = root_url, old, "ROOT_URL seems to have changed");
            }
            d.root_url = Some(root_url.to_string());
        })
    }

    /// The compatibility tag of the installed native shell.
    pub fn compatibility_version(&self) -> Option<String> {
        self.read(|d| d.compatibility_version.clone())
    }

    pub fn set_compatibility_version(&self, version: &str) -> Result<()> {
        self.update(|d| d.compatibility_version = Some(version.to_string()))
    }

    /// True if the version has been blacklisted.
    pub fn is_blacklisted(&self, version: &str) -> bool {
        self.read(|d| d.blacklisted_versions.contains(version))
    }

    /// Versions currently blacklisted.
    pub fn blacklisted_versions(&self) -> BTreeSet<String> {
        self.read(|d| d.blacklisted_versions.clone())
    }

    /// Versions awaiting their second (final) startup attempt.
    pub fn versions_to_retry(&self) -> BTreeSet<String> {
        self.read(|d| d.versions_to_retry.clone())
    }

    /// Records a startup failure for `version` under the two-strike rule.
    ///
    /// First failure: the version goes on the retry list and stays eligible
    /// for one more attempt. Any further failure: it leaves the retry list
    /// and joins the blacklist.
    pub fn add_faulty_version(&self, version: &str) -> Result<()> {
        self.update(|d| {
            let known =
                d.versions_to_retry.contains(version) || d.blacklisted_versions.contains(version);
            if !known {
                info!(version, "adding faulty version to retry list");
                d.versions_to_retry.insert(version.to_string());
            } else {
                d.versions_to_retry.remove(version);
                if d.blacklisted_versions.insert(version.to_string()) {
                    info!(version, "blacklisting version");
                }
            }
        })
    }

    /// Clears all state. Used when the installer-bundled version changes,
    /// which invalidates everything downloaded against the old install.
    pub fn reset(&self) -> Result<()> {
        info!("resetting version store");
        self.update(|d| *d = StoreData::default())
    }
}
