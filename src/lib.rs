//! hotpush - Hot Code Push Engine
//!
//! A client-side update engine for manifest-described web asset bundles. The
//! engine keeps a locally served application current by downloading new
//! releases incrementally, verifying them, and switching to them at a moment
//! the embedding application controls, with automatic rollback if a new
//! version fails to start.
//!
//! # Architecture Overview
//!
//! The engine follows a current/pending/last-known-good model:
//! - Each release is described by a `program.json` manifest (format
//!   `web-program-pre1`) listing client assets with content hashes
//! - Bundles form parent chains: a downloaded bundle stores only the assets
//!   its parent does not already satisfy, so updates cost one manifest fetch
//!   plus the changed assets
//! - A downloaded bundle is held as *pending* until the application applies
//!   it; a switched-to version must confirm startup before becoming
//!   *last known good*, or the watchdog rolls back and records the failure
//! - Two startup failures blacklist a version permanently
//!
//! ## Key Properties
//!
//! - **Incremental**: content-addressed reuse across the bundle parent chain
//! - **All-or-nothing**: bundles are staged and renamed into place; a version
//!   directory never exists partially downloaded
//! - **Verified**: ETag content hashes, manifest version cross-checks, and
//!   runtime-config identity checks on the entry document
//! - **Self-healing**: startup watchdog, two-strike blacklist, automatic
//!   rollback to the last good version or the installer bundle
//! - **Resumable**: interrupted asset downloads continue with HTTP range
//!   requests; retries follow a bounded geometric backoff curve
//!
//! # Core Modules
//!
//! - [`orchestrator`] - lifecycle coordination: startup selection, update
//!   gating, switching, watchdog and rollback
//! - [`manager`] - on-disk version management and the update-check protocol
//! - [`downloader`] - concurrent, verifying, resumable asset downloads
//! - [`bundle`] - manifests, assets, bundles, and runtime configuration
//! - [`state`] - durable version pointers and the blacklist/retry lists
//! - [`core`] - error taxonomy
//! - [`utils`] - backoff curve, filesystem helpers, path/URL helpers
//!
//! # Usage
//!
//! ```no_run
//! use hotpush::orchestrator::{OrchestratorConfig, UpdateOrchestrator};
//! # use hotpush::orchestrator::{BundleOrganizer, ServingBridge};
//! # use std::sync::Arc;
//! # fn collaborators() -> (Arc<dyn ServingBridge>, Arc<dyn BundleOrganizer>) { unimplemented!() }
//!
//! # async fn run() -> hotpush::core::Result<()> {
//! let (bridge, organizer) = collaborators();
//! let config = OrchestratorConfig::new("www", "/var/lib/app/hotpush");
//! let (engine, mut events) = UpdateOrchestrator::new(config, bridge, organizer)?;
//!
//! engine.check_for_updates().await?;
//! if engine.is_update_available().await {
//!     engine.reload().await?;
//! }
//! // Once the new version has booted successfully:
//! engine.startup_did_complete().await?;
//! # Ok(())
//! # }
//! ```

pub mod bundle;
pub mod constants;
pub mod core;
pub mod downloader;
pub mod manager;
pub mod orchestrator;
pub mod state;
pub mod utils;
