//! Runtime configuration embedded in the entry document.
//!
//! A served entry document carries its runtime configuration inline as a
//! percent-encoded JSON blob behind a well-known marker:
//!
//! ```text
//! __meteor_runtime_config__ = JSON.parse(decodeURIComponent("%7B%22appId%22..."))
//! ```
//!
//! The engine relies on this blob twice: to discover the app identity and
//! origin it must talk to (from the locally served entry document), and to
//! verify a freshly downloaded entry document really belongs to the expected
//! app and version.

use crate::core::{HotPushError, Result};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use url::Url;

fn runtime_config_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"__meteor_runtime_config__ = JSON\.parse\(decodeURIComponent\("([^"]*)"\)\)"#)
            .unwrap()
    })
}

/// Runtime configuration extracted from an entry document.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    json: serde_json::Value,
}

impl RuntimeConfig {
    /// Extracts and parses the runtime config from entry document bytes.
    ///
    /// # Errors
    ///
    /// Returns [`HotPushError::BundleValidation`] if the marker is absent or
    /// the captured blob fails percent-decoding or JSON parsing.
    pub fn from_index_bytes(data: &[u8]) -> Result<Self> {
        let unsuitable = || HotPushError::BundleValidation {
            violations: vec!["couldn't load runtime config from index file".into()],
        };

        let text = std::str::from_utf8(data).map_err(|_| unsuitable())?;
        let captures = runtime_config_regex().captures(text).ok_or_else(unsuitable)?;
        let decoded =
            urlencoding::decode(captures.get(1).unwrap().as_str()).map_err(|_| unsuitable())?;
        let json = serde_json::from_str(&decoded).map_err(|_| unsuitable())?;

        Ok(Self { json })
    }

    /// Reads the entry document at `path` and extracts its runtime config.
    pub fn from_index_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| HotPushError::io(path, e))?;
        Self::from_index_bytes(&data)
    }

    /// The application identifier (`appId`).
    pub fn app_id(&self) -> Option<&str> {
        self.json.get("appId").and_then(|v| v.as_str())
    }

    /// The server origin (`ROOT_URL`), parsed.
    pub fn root_url(&self) -> Option<Url> {
        self.json.get("ROOT_URL").and_then(|v| v.as_str()).and_then(|s| Url::parse(s).ok())
    }

    /// The native-compatibility marker (`autoupdateVersionCordova`): the
    /// bundle version the server claims this entry document belongs to.
    pub fn autoupdate_version(&self) -> Option<&str> {
        self.json.get("autoupdateVersionCordova").and_then(|v| v.as_str())
    }
}

/// Builds an entry document body embedding the given config object.
///
/// Test helper shared by unit tests across the crate.
#[cfg(test)]
pub(crate) fn index_html_with_config(config: &serde_json::Value) -> String {
    let encoded = urlencoding::encode(&config.to_string()).into_owned();
    format!(
        "<html><head><script>__meteor_runtime_config__ = \
         JSON.parse(decodeURIComponent(\"{encoded}\"))</script></head><body></body></html>"
    )
}
