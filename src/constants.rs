//! Global constants used throughout the hotpush codebase.
//!
//! This module centralizes protocol constants, timeout durations, and retry
//! parameters that are used across multiple modules. Defining them centrally
//! improves maintainability and makes magic numbers more discoverable.

use std::time::Duration;

/// The only asset manifest format this engine understands.
///
/// A manifest carrying a different `format` tag is rejected outright; a
/// manifest with no `format` tag at all is accepted for backwards
/// compatibility with older servers.
pub const MANIFEST_FORMAT: &str = "web-program-pre1";

/// File name of the asset manifest inside a bundle directory.
pub const MANIFEST_FILE_NAME: &str = "program.json";

/// File name of the entry document inside a bundle directory.
pub const INDEX_FILE_NAME: &str = "index.html";

/// Public URL path of the entry document.
pub const INDEX_URL_PATH: &str = "/";

/// Default platform key looked up in the manifest's compatibility map.
pub const DEFAULT_PLATFORM: &str = "ios";

/// Query parameter appended to asset requests so the server returns a real
/// 404 for unknown paths instead of falling back to the entry document.
pub const DONT_SERVE_INDEX_PARAM: &str = "meteor_dont_serve_index";

/// Path prefix under the root URL where the manifest and assets are served.
pub const SERVER_PATH_PREFIX: &str = "__cordova/";

/// Name of the staging directory a candidate bundle is downloaded into
/// before being renamed to its version directory.
pub const DOWNLOADING_DIR_NAME: &str = "Downloading";

/// Maximum number of concurrent in-flight asset requests.
///
/// All requests go to a single origin, so this also bounds total parallelism.
pub const MAX_CONCURRENT_ASSET_DOWNLOADS: usize = 6;

/// Connect timeout for asset and manifest requests.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Overall per-request timeout. Asset files are small; a request that takes
/// longer than this is treated as a transport failure and retried.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// How long the startup watchdog waits for the hosted application to confirm
/// startup before reverting to the last known good version.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Shortest retry wait, used for the first attempts to absorb transient blips.
pub const RETRY_MINIMUM_INTERVAL: Duration = Duration::from_millis(100);

/// Ceiling on the retry wait; the backoff curve never exceeds this.
pub const RETRY_MAXIMUM_INTERVAL: Duration = Duration::from_secs(30);

/// Number of attempts served at [`RETRY_MINIMUM_INTERVAL`] before the
/// backoff curve starts growing.
pub const RETRY_ATTEMPTS_AT_MINIMUM: u32 = 2;

/// Base interval of the growing part of the backoff curve.
pub const RETRY_BASE_INTERVAL: Duration = Duration::from_secs(1);

/// Growth exponent of the backoff curve.
pub const RETRY_EXPONENT: f64 = 2.2;
