//! Concurrent, resumable bundle downloading.
//!
//! [`BundleDownloader`] fetches the missing assets of a candidate bundle
//! from the update origin. The bundle manager computes the missing set by
//! diffing; the downloader's job is transport and verification:
//!
//! - a bounded number of in-flight requests against the single origin,
//!   with no asset ever scheduled twice concurrently;
//! - per-asset verification (status code, ETag hash, and for the entry
//!   document the embedded runtime config);
//! - transient transport failures kept as partial data and retried on the
//!   [`RetryPolicy`] curve, resumed early when reachability returns;
//! - any verification failure cancels the whole download: a bundle is
//!   delivered fully verified or not at all.
//!
//! The state machine: `Suspended → Running → {Waiting, Canceling → Invalid}`.
//! Cancellation is idempotent and releases the acquired work lease exactly
//! once (on exit from [`BundleDownloader::run`]).

pub mod reachability;

pub use reachability::{ReachabilityMonitor, ReachabilityStatus};

use crate::bundle::{Asset, AssetBundle, RuntimeConfig};
use crate::constants::{
    CONNECT_TIMEOUT, DONT_SERVE_INDEX_PARAM, INDEX_URL_PATH, MAX_CONCURRENT_ASSET_DOWNLOADS,
    REQUEST_TIMEOUT,
};
use crate::core::{HotPushError, Result};
use crate::state::VersionStore;
use crate::utils::backoff::RetryPolicy;
use crate::utils::fs::atomic_write;
use crate::utils::paths::{is_source_map_path, sha1_hash_from_etag};
use futures::stream::{FuturesUnordered, StreamExt};
use reqwest::StatusCode;
use reqwest::header::{ETAG, RANGE};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore, watch};
use tracing::{debug, info, warn};
use url::Url;

/// Observable downloader state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    /// Constructed or parked by backgrounding; no requests in flight.
    Suspended,
    /// Actively fetching assets.
    Running,
    /// All remaining assets failed transiently; a retry is scheduled.
    Waiting,
    /// Cancellation requested; in-flight work is being stopped.
    Canceling,
    /// Terminal: finished, failed, or canceled.
    Invalid,
}

/// Lease over the platform's long-running-work primitive.
///
/// On mobile targets a download should keep the process alive while the app
/// is backgrounded; the concrete mechanism is an external collaborator. The
/// downloader acquires one lease for the duration of a run; dropping the
/// returned guard releases it, which therefore happens exactly once however
/// the run ends.
pub trait WorkLease: Send + Sync {
    /// Acquires the lease; the guard releases it on drop.
    fn acquire(&self, name: &str) -> Box<dyn std::any::Any + Send>;
}

/// Lease implementation for hosts without background-execution limits.
pub struct NoopLease;

impl WorkLease for NoopLease {
    fn acquire(&self, _name: &str) -> Box<dyn std::any::Any + Send> {
        Box::new(())
    }
}

struct DownloadState {
    status: DownloadStatus,
    /// Assets still to fetch, keyed by URL path. Keys are unique, and each
    /// round snapshots this map, so an asset is never scheduled twice.
    missing: HashMap<String, Arc<Asset>>,
    /// Partial response bodies from transiently failed fetches, keyed by
    /// URL path, used to issue range requests on the next attempt.
    partial: HashMap<String, Vec<u8>>,
    attempts: u32,
}

enum RoundResult {
    Finished,
    Retry,
}

enum AssetFailure {
    Transient { partial: Vec<u8>, reason: String },
    Fatal(HotPushError),
}

/// Downloads the missing assets of one target bundle.
pub struct BundleDownloader {
    client: reqwest::Client,
    store: Arc<VersionStore>,
    bundle: Arc<AssetBundle>,
    base_url: Url,
    retry: RetryPolicy,
    reachability: Option<watch::Receiver<ReachabilityStatus>>,
    lease: Arc<dyn WorkLease>,
    limiter: Semaphore,
    state: Mutex<DownloadState>,
    cancel: watch::Sender<bool>,
    wake: Notify,
}

impl BundleDownloader {
    /// Creates a downloader for `missing` assets of `bundle`, fetched
    /// relative to `base_url`.
    pub fn new(
        store: Arc<VersionStore>,
        bundle: Arc<AssetBundle>,
        base_url: Url,
        missing: Vec<Arc<Asset>>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| HotPushError::Initialization {
                reason: format!("could not build HTTP client: {e}"),
            })?;

        let missing =
            missing.into_iter().map(|asset| (asset.url_path.clone(), asset)).collect();

        Ok(Self {
            client,
            store,
            bundle,
            base_url,
            retry: RetryPolicy::default(),
            reachability: None,
            lease: Arc::new(NoopLease),
            limiter: Semaphore::new(MAX_CONCURRENT_ASSET_DOWNLOADS),
            state: Mutex::new(DownloadState {
                status: DownloadStatus::Suspended,
                missing,
                partial: HashMap::new(),
                attempts: 0,
            }),
            cancel: watch::channel(false).0,
            wake: Notify::new(),
        })
    }

    /// Overrides the retry policy (tests use a compressed curve).
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Attaches a reachability subscription that shortens retry waits.
    pub fn with_reachability(mut self, rx: watch::Receiver<ReachabilityStatus>) -> Self {
        self.reachability = Some(rx);
        self
    }

    /// Attaches the platform's long-running-work lease.
    pub fn with_work_lease(mut self, lease: Arc<dyn WorkLease>) -> Self {
        self.lease = lease;
        self
    }

    /// Current state machine position.
    pub fn status(&self) -> DownloadStatus {
        self.state.lock().expect("downloader lock").status
    }

    fn set_status(&self, status: DownloadStatus) {
        self.state.lock().expect("downloader lock").status = status;
    }

    fn is_canceled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Requests cancellation. Idempotent; safe to call from any task.
    ///
    /// In-flight requests observe the signal and stop; [`run`](Self::run)
    /// returns [`HotPushError::Canceled`] and releases the work lease.
    pub fn cancel(&self) {
        {
            let mut state = self.state.lock().expect("downloader lock");
            if matches!(state.status, DownloadStatus::Canceling | DownloadStatus::Invalid) {
                return;
            }
            state.status = DownloadStatus::Canceling;
        }
        debug!(version = %self.bundle.version(), "canceling bundle download");
        let _ = self.cancel.send(true);
        self.wake.notify_waiters();
    }

    /// Parks the downloader (app went to background). Partial data is kept;
    /// [`resume`](Self::resume) picks up where it left off.
    pub fn suspend(&self) {
        let mut state = self.state.lock().expect("downloader lock");
        if matches!(state.status, DownloadStatus::Running | DownloadStatus::Waiting) {
            debug!(version = %self.bundle.version(), "suspending bundle download");
            state.status = DownloadStatus::Suspended;
        }
    }

    /// Wakes a suspended or waiting downloader immediately.
    pub fn resume(&self) {
        {
            let mut state = self.state.lock().expect("downloader lock");
            if state.status == DownloadStatus::Suspended {
                debug!(version = %self.bundle.version(), "resuming bundle download");
                state.status = DownloadStatus::Running;
            }
        }
        self.wake.notify_waiters();
    }

    /// Drives the download to completion.
    ///
    /// Returns once every missing asset has been fetched and verified, or
    /// with the single terminating error: there is no partial success.
    pub async fn run(&self) -> Result<()> {
        let _lease = self.lease.acquire("bundle-download");
        info!(
            version = %self.bundle.version(),
            assets = self.state.lock().expect("downloader lock").missing.len(),
            "start downloading assets"
        );
        // The constructed-but-not-started state reads as Suspended; entering
        // run is what starts the machine.
        self.set_status(DownloadStatus::Running);

        loop {
            if self.is_canceled() {
                self.set_status(DownloadStatus::Invalid);
                return Err(HotPushError::Canceled);
            }
            if self.status() == DownloadStatus::Suspended {
                self.wait_while_suspended().await;
                continue;
            }

            self.set_status(DownloadStatus::Running);
            match self.download_round().await {
                Ok(RoundResult::Finished) => {
                    self.set_status(DownloadStatus::Invalid);
                    info!(version = %self.bundle.version(), "finished downloading asset bundle");
                    return Ok(());
                }
                Ok(RoundResult::Retry) => {
                    if self.status() == DownloadStatus::Suspended {
                        continue;
                    }
                    let interval = {
                        let mut state = self.state.lock().expect("downloader lock");
                        let interval = self.retry.interval(state.attempts);
                        state.attempts += 1;
                        state.status = DownloadStatus::Waiting;
                        interval
                    };
                    info!("will retry resuming downloads after {:.1}s", interval.as_secs_f64());
                    self.wait_for_retry(interval).await;
                }
                Err(e) => {
                    self.cancel();
                    self.set_status(DownloadStatus::Invalid);
                    warn!(version = %self.bundle.version(), "download failed: {e}");
                    return Err(e);
                }
            }
        }
    }

    async fn wait_while_suspended(&self) {
        let mut cancel_rx = self.cancel.subscribe();
        let wake = self.wake.notified();
        tokio::pin!(wake);
        wake.as_mut().enable();
        // A resume can land between the status check in the run loop and the
        // wakeup registration above; recheck before parking.
        if self.status() != DownloadStatus::Suspended {
            return;
        }
        tokio::select! {
            _ = wake => {}
            _ = cancel_rx.changed() => {}
        }
    }

    /// Sleeps out a retry interval, waking early on resume, cancellation, or
    /// the network becoming reachable again.
    async fn wait_for_retry(&self, interval: std::time::Duration) {
        let mut cancel_rx = self.cancel.subscribe();
        let reachable_again = async {
            match self.reachability.clone() {
                Some(mut rx) => {
                    while rx.changed().await.is_ok() {
                        if *rx.borrow() == ReachabilityStatus::Reachable {
                            debug!("network is reachable again, resuming download");
                            return;
                        }
                    }
                    std::future::pending::<()>().await
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = self.wake.notified() => {}
            _ = cancel_rx.changed() => {}
            _ = reachable_again => {}
        }
    }

    /// Fetches every currently missing asset once, with bounded concurrency.
    async fn download_round(&self) -> Result<RoundResult> {
        let snapshot: Vec<Arc<Asset>> =
            self.state.lock().expect("downloader lock").missing.values().cloned().collect();

        let mut fetches: FuturesUnordered<_> = snapshot
            .iter()
            .map(|asset| async move {
                let _permit = self.limiter.acquire().await.expect("limiter never closed");
                (Arc::clone(asset), self.fetch_asset(asset).await)
            })
            .collect();

        while let Some((asset, outcome)) = fetches.next().await {
            match outcome {
                Ok(()) => {
                    let mut state = self.state.lock().expect("downloader lock");
                    state.missing.remove(&asset.url_path);
                    state.partial.remove(&asset.url_path);
                }
                Err(AssetFailure::Transient { partial, reason }) => {
                    warn!(asset = %asset, "download of asset failed, will retry: {reason}");
                    if !partial.is_empty() {
                        let mut state = self.state.lock().expect("downloader lock");
                        state.partial.insert(asset.url_path.clone(), partial);
                    }
                }
                // Dropping the remaining futures aborts their requests; the
                // whole download fails with this single error.
                Err(AssetFailure::Fatal(e)) => return Err(e),
            }
        }

        if self.is_canceled() {
            return Err(HotPushError::Canceled);
        }
        let empty = self.state.lock().expect("downloader lock").missing.is_empty();
        if empty { Ok(RoundResult::Finished) } else { Ok(RoundResult::Retry) }
    }

    /// Builds the remote URL for an asset: leading slash stripped, resolved
    /// against the base URL, and (for everything but the entry document)
    /// tagged so the server won't answer unknown paths with the entry
    /// document instead of a 404.
    fn download_url_for(&self, asset: &Asset) -> Result<Url> {
        let relative = asset.url_path.trim_start_matches('/');
        let mut url = self.base_url.join(relative).map_err(|e| {
            HotPushError::integrity(format!("invalid URL for asset {asset}: {e}"))
        })?;
        if asset.url_path != INDEX_URL_PATH {
            url.query_pairs_mut().append_pair(DONT_SERVE_INDEX_PARAM, "true");
        }
        Ok(url)
    }

    async fn fetch_asset(&self, asset: &Asset) -> std::result::Result<(), AssetFailure> {
        let url = self.download_url_for(asset).map_err(AssetFailure::Fatal)?;

        let resumed =
            self.state.lock().expect("downloader lock").partial.remove(&asset.url_path);

        let mut request = self.client.get(url.clone());
        if let Some(partial) = &resumed
            && !partial.is_empty()
        {
            request = request.header(RANGE, format!("bytes={}-", partial.len()));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                return Err(AssetFailure::Transient {
                    partial: resumed.unwrap_or_default(),
                    reason: e.to_string(),
                });
            }
        };

        // A 404 for a source map is tolerated: production servers often do
        // not serve maps. The asset counts as complete, nothing is written.
        if response.status() == StatusCode::NOT_FOUND && is_source_map_path(&asset.url_path) {
            debug!(asset = %asset, "404 for source map, skipping");
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(AssetFailure::Fatal(HotPushError::integrity(format!(
                "non-success status code {} for asset: {asset}",
                response.status().as_u16()
            ))));
        }

        // If both sides declare a SHA-1 we can verify before the body lands.
        if let Some(expected) = &asset.hash
            && let Some(etag) = response.headers().get(ETAG).and_then(|v| v.to_str().ok())
            && let Some(actual) = sha1_hash_from_etag(etag)
            && actual != expected
        {
            return Err(AssetFailure::Fatal(HotPushError::integrity(format!(
                "hash mismatch for asset {asset}: expected {expected}, actual {actual}"
            ))));
        }

        // A 206 answer continues the partial body; a 200 restarts it.
        let mut body = match (resumed, response.status()) {
            (Some(partial), StatusCode::PARTIAL_CONTENT) => partial,
            _ => Vec::new(),
        };

        let mut response = response;
        let mut cancel_rx = self.cancel.subscribe();
        loop {
            let chunk = tokio::select! {
                chunk = response.chunk() => chunk,
                _ = cancel_rx.changed() => {
                    return Err(AssetFailure::Fatal(HotPushError::Canceled));
                }
            };
            match chunk {
                Ok(Some(bytes)) => body.extend_from_slice(&bytes),
                Ok(None) => break,
                Err(e) => {
                    return Err(AssetFailure::Transient { partial: body, reason: e.to_string() });
                }
            }
            if self.status() == DownloadStatus::Suspended {
                return Err(AssetFailure::Transient {
                    partial: body,
                    reason: "download suspended".into(),
                });
            }
        }

        // The entry document carries no hash; its identity is verified from
        // the runtime config it embeds.
        if asset.url_path == INDEX_URL_PATH {
            let config = RuntimeConfig::from_index_bytes(&body).map_err(|e| {
                AssetFailure::Fatal(HotPushError::integrity(format!(
                    "could not load runtime config from downloaded index page: {e}"
                )))
            })?;
            self.verify_runtime_config(&config).map_err(AssetFailure::Fatal)?;
        }

        atomic_write(&asset.file_path, &body).map_err(AssetFailure::Fatal)?;
        debug!(asset = %asset, bytes = body.len(), "asset downloaded");
        Ok(())
    }

    /// Checks a downloaded entry document's embedded config against the
    /// target bundle and the configured app identity. Each failure mode has
    /// its own message so server misconfiguration is diagnosable.
    fn verify_runtime_config(&self, config: &RuntimeConfig) -> Result<()> {
        let expected = self.bundle.version();
        if let Some(actual) = config.autoupdate_version()
            && actual != expected
        {
            return Err(HotPushError::integrity(format!(
                "version mismatch for index page, expected: {expected}, actual: {actual}"
            )));
        }

        let Some(root_url) = config.root_url() else {
            return Err(HotPushError::integrity(
                "could not find ROOT_URL in downloaded asset bundle",
            ));
        };

        let configured_host = self
            .store
            .root_url()
            .and_then(|s| Url::parse(&s).ok())
            .and_then(|u| u.host_str().map(str::to_string));
        if configured_host.as_deref() != Some("localhost") && root_url.host_str() == Some("localhost")
        {
            return Err(HotPushError::integrity(
                "ROOT_URL in downloaded asset bundle would change current ROOT_URL to localhost; \
                 make sure ROOT_URL has been configured correctly on the server",
            ));
        }

        let Some(app_id) = config.app_id() else {
            return Err(HotPushError::integrity(
                "could not find appId in downloaded asset bundle",
            ));
        };
        if self.store.app_id().as_deref() != Some(app_id) {
            return Err(HotPushError::integrity(format!(
                "appId in downloaded asset bundle does not match current appId; make sure the \
                 server at {root_url} is serving the right app"
            )));
        }

        Ok(())
    }
}
