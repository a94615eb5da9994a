//! Error handling for hotpush.
//!
//! The error system is built around a single strongly-typed enum,
//! [`HotPushError`], so callers can match on precise failure modes. The
//! variants follow the update lifecycle:
//!
//! - **Manifest**: [`HotPushError::ManifestFormat`], the remote descriptor is
//!   malformed or incompatible. Fatal to that update check, not to the process.
//! - **Validation**: [`HotPushError::BundleValidation`], a bundle declares
//!   duplicate or unsafe paths. The bundle is refused before anything touches
//!   the filesystem; every violation found is reported, not just the first.
//! - **Integrity**: [`HotPushError::DownloadIntegrity`], a status code, hash,
//!   or identity mismatch during download. Aborts the whole download and
//!   discards the partial bundle.
//! - **Transport**: [`HotPushError::Transport`], a network failure. Retried
//!   locally by the downloader and only surfaced when cancellation intervenes.
//! - **Lifecycle**: [`HotPushError::Canceled`], [`HotPushError::NoPendingVersion`],
//!   [`HotPushError::Initialization`].
//! - **I/O**: [`HotPushError::Io`], a filesystem operation failed, with the
//!   path it failed on.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, HotPushError>;

/// The error type for all hotpush operations.
#[derive(Error, Debug)]
pub enum HotPushError {
    /// The asset manifest could not be parsed or is incompatible.
    ///
    /// Raised when the top-level format tag is present but unknown, when the
    /// version is missing, or when the compatibility map lacks the current
    /// platform's key. Individual malformed entries do *not* raise this;
    /// they are silently dropped so one bad entry cannot poison a release.
    #[error("invalid asset manifest: {reason}")]
    ManifestFormat {
        /// Why the manifest was rejected.
        reason: String,
    },

    /// A bundle failed validation before being organized or served.
    ///
    /// Carries every violation found (duplicate URL paths, path traversal
    /// sequences), so a broken build is diagnosable in one pass.
    #[error("unsuitable asset bundle: {}", violations.join("; "))]
    BundleValidation {
        /// All violations discovered during validation.
        violations: Vec<String>,
    },

    /// A downloaded asset failed verification.
    ///
    /// Covers non-success status codes, ETag/hash mismatches, and entry
    /// document identity checks (version, `ROOT_URL`, `appId`). Any of these
    /// cancels the entire download; a bundle is delivered whole or not at all.
    #[error("download verification failed: {reason}")]
    DownloadIntegrity {
        /// Which check failed, phrased for the person who has to debug it.
        reason: String,
    },

    /// The network transport failed.
    ///
    /// Recoverable: the downloader keeps any partial data and retries on the
    /// backoff curve. Only surfaced if cancellation interrupts the retry loop.
    #[error("transport failure during {operation}")]
    Transport {
        /// What was being fetched (e.g. "manifest fetch", an asset URL path).
        operation: String,
        /// The underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// The download was canceled before completion.
    #[error("download canceled")]
    Canceled,

    /// A reload was requested while no pending bundle exists.
    ///
    /// This is an error condition, not a silent no-op: the caller asked to
    /// switch versions and there is nothing to switch to.
    #[error("no pending version available to switch to")]
    NoPendingVersion,

    /// The engine could not be brought up.
    ///
    /// Raised when the installer-bundled bundle cannot be loaded or the
    /// working directories cannot be created. Fatal, surfaced to the host.
    #[error("initialization failed: {reason}")]
    Initialization {
        /// What went wrong during initialization.
        reason: String,
    },

    /// A filesystem operation failed.
    #[error("I/O error at {}", path.display())]
    Io {
        /// The path the operation failed on.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl HotPushError {
    /// Shorthand for an [`HotPushError::Io`] carrying the offending path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    /// Shorthand for a [`HotPushError::DownloadIntegrity`] with a formatted reason.
    pub fn integrity(reason: impl Into<String>) -> Self {
        Self::DownloadIntegrity { reason: reason.into() }
    }

    /// True if this error is worth retrying at the transport level.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}
