use crate::settings::error::SettingsError;
use engine_processing::config::{CompressionMode, InFlightPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub mod env;
pub mod error;
pub mod validated;
pub mod validator;

/// Raw contents of a `bulkshift.toml` file. Every section is optional.
///
/// Nothing here is trusted until it has gone through
/// [`validator::SettingsValidator`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub source: SourceSection,
    pub target: TargetSection,
    pub coordination: CoordinationSection,
    pub batching: BatchingSection,
    pub bulk: BulkSection,
    pub failed_documents: FailedDocumentsSection,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// A directory of `<index>/<shard>.ndjson` files.
    #[default]
    Ndjson,
    /// Generated documents, for load tests.
    Synthetic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceSection {
    pub kind: SourceKind,
    pub path: Option<PathBuf>,
    pub snapshot: String,
    /// Empty means every index the source lists.
    pub indices: Vec<String>,
    pub shards: u32,
    pub docs_per_shard: u64,
}

impl Default for SourceSection {
    fn default() -> Self {
        Self {
            kind: SourceKind::Ndjson,
            path: None,
            snapshot: "snapshot".to_string(),
            indices: Vec::new(),
            shards: 1,
            docs_per_shard: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TargetSection {
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub compression: CompressionMode,
    pub index_prefix: String,
    pub request_timeout_secs: u64,
}

impl Default for TargetSection {
    fn default() -> Self {
        Self {
            url: None,
            username: None,
            password: None,
            compression: CompressionMode::Auto,
            index_prefix: String::new(),
            request_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinationBackend {
    /// Local file store; worker invocations must not overlap.
    #[default]
    Sled,
    /// Lease documents in an index on a cluster.
    Cluster,
    /// Process-local, for tests and dry runs.
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoordinationSection {
    pub backend: CoordinationBackend,
    pub path: Option<PathBuf>,
    pub url: Option<String>,
    pub index_suffix: String,
    pub initial_lease_secs: u64,
    pub tolerable_clock_difference_secs: u64,
    pub renew_interval_secs: u64,
    pub min_time_for_batch_secs: u64,
    pub release_on_exit: bool,
}

impl Default for CoordinationSection {
    fn default() -> Self {
        Self {
            backend: CoordinationBackend::Sled,
            path: None,
            url: None,
            index_suffix: String::new(),
            initial_lease_secs: 600,
            tolerable_clock_difference_secs: 5,
            renew_interval_secs: 60,
            min_time_for_batch_secs: 30,
            release_on_exit: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchingSection {
    pub max_docs_per_batch: usize,
    pub max_bytes_per_batch: usize,
}

impl Default for BatchingSection {
    fn default() -> Self {
        Self {
            max_docs_per_batch: 1_000,
            max_bytes_per_batch: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BulkSection {
    pub max_concurrent_requests: usize,
    pub queue_depth: usize,
    pub max_requests_per_second: Option<f64>,
    pub burst: u32,
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub serialization_cache_bytes: u64,
    pub in_flight_policy: InFlightPolicy,
}

impl Default for BulkSection {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 4,
            queue_depth: 8,
            max_requests_per_second: None,
            burst: 1,
            max_attempts: 15,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            serialization_cache_bytes: 32 * 1024 * 1024,
            in_flight_policy: InFlightPolicy::Finish,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FailedDocumentsSection {
    /// JSON-lines file for documents the target refused.
    pub path: Option<PathBuf>,
}

impl Settings {
    pub fn from_toml_str(contents: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let contents = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = Self::from_toml_str(&contents)?;
        debug!(path = %path.display(), "Loaded settings file");
        Ok(settings)
    }

    /// Reads `path` if given, defaults otherwise, then applies environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                info!("No settings file given; using defaults");
                Self::default()
            }
        };
        env::apply_overrides(&mut settings, |key| std::env::var(key).ok());
        Ok(settings)
    }
}
