//! Session configuration.
//!
//! [`SessionConfig`] can be written by hand or loaded from TOML:
//!
//! ```ignore
//! use courier::config::SessionConfig;
//!
//! let config = SessionConfig::from_toml_str(r#"
//! [request]
//! timeout_secs = 30
//! cache_policy = "reload_ignoring_local_cache_data"
//! headers = { "x-client" = "courier" }
//!
//! [response]
//! acceptable_status_codes = [[200, 299], [304, 304]]
//! acceptable_content_types = ["application/json"]
//! decoding = "json"
//!
//! [download]
//! create_intermediate_directories = true
//! "#)?;
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Cause, HttpError, Result};
use crate::http::{BodyEncoding, CachePolicy, Decoding, RequestSerializer, ResponseSerializer};
use crate::session::DownloadOptions;

/// Defaults applied to every request a session builds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestDefaults {
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// Default cache policy.
    pub cache_policy: CachePolicy,
    /// Whether requests may use metered networks.
    pub allows_metered_network: bool,
    /// How body parameters are encoded.
    pub body_encoding: BodyEncoding,
    /// `User-Agent` header; the transport's default applies when unset.
    pub user_agent: Option<String>,
    /// Headers sent with every request.
    pub headers: BTreeMap<String, String>,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            cache_policy: CachePolicy::default(),
            allows_metered_network: true,
            body_encoding: BodyEncoding::default(),
            user_agent: None,
            headers: BTreeMap::new(),
        }
    }
}

/// How responses are validated and decoded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseValidation {
    /// Inclusive `[low, high]` status ranges.
    pub acceptable_status_codes: Vec<(u16, u16)>,
    /// Accepted MIME types. Empty accepts any.
    pub acceptable_content_types: Vec<String>,
    /// Body decoding.
    pub decoding: Decoding,
    /// Fixed text encoding label, overriding the response charset.
    pub string_encoding: Option<String>,
    /// Accept top-level JSON scalars.
    pub allow_json_fragments: bool,
}

impl Default for ResponseValidation {
    fn default() -> Self {
        Self {
            acceptable_status_codes: vec![(200, 299)],
            acceptable_content_types: Vec::new(),
            decoding: Decoding::Raw,
            string_encoding: None,
            allow_json_fragments: false,
        }
    }
}

/// File system behavior of downloads.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadSettings {
    /// Create missing parent directories of a destination.
    pub create_intermediate_directories: bool,
    /// Replace existing destinations and delete failed partial files.
    pub remove_existing_file: bool,
}

/// Configuration of a [`Session`](crate::session::Session).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Request defaults.
    pub request: RequestDefaults,
    /// Response validation.
    pub response: ResponseValidation,
    /// Download options.
    pub download: DownloadSettings,
}

impl SessionConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| HttpError::Config {
            path: None,
            cause: Cause::new(e),
        })
    }

    /// Read and parse a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config_error = |cause: Cause| HttpError::Config {
            path: Some(path.to_path_buf()),
            cause,
        };
        let content = std::fs::read_to_string(path).map_err(|e| config_error(Cause::new(e)))?;
        let config = toml::from_str(&content).map_err(|e| config_error(Cause::new(e)))?;
        tracing::debug!(target: "courier::session", path = %path.display(), "Loaded session configuration");
        Ok(config)
    }

    /// Build the request serializer these defaults describe.
    pub fn request_serializer(&self) -> Result<RequestSerializer> {
        let defaults = &self.request;
        let mut serializer = RequestSerializer::new()
            .timeout(Duration::from_secs(defaults.timeout_secs))
            .cache_policy(defaults.cache_policy)
            .allows_metered_network(defaults.allows_metered_network)
            .body_encoding(defaults.body_encoding);
        for (name, value) in &defaults.headers {
            serializer = serializer.header(name, value)?;
        }
        if let Some(agent) = &defaults.user_agent {
            serializer = serializer.header("user-agent", agent)?;
        }
        Ok(serializer)
    }

    /// Build the response serializer these rules describe.
    pub fn response_serializer(&self) -> ResponseSerializer {
        let rules = &self.response;
        ResponseSerializer::new()
            .acceptable_status_codes(rules.acceptable_status_codes.iter().map(|&(low, high)| low..=high))
            .acceptable_content_types(rules.acceptable_content_types.iter().cloned())
            .decoding(rules.decoding)
            .string_encoding(rules.string_encoding.clone())
            .allow_json_fragments(rules.allow_json_fragments)
    }

    /// The download options as flags.
    pub fn download_options(&self) -> DownloadOptions {
        let mut options = DownloadOptions::empty();
        options.set(
            DownloadOptions::CREATE_INTERMEDIATE_DIRECTORIES,
            self.download.create_intermediate_directories,
        );
        options.set(DownloadOptions::REMOVE_EXISTING_FILE, self.download.remove_existing_file);
        options
    }
}
