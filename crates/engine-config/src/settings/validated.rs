use engine_processing::config::{CompressionMode, PipelineConfig};
use std::{path::PathBuf, time::Duration};

/// Where documents come from.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceSettings {
    Ndjson {
        path: PathBuf,
        snapshot: String,
    },
    Synthetic {
        snapshot: String,
        shards: u32,
        docs_per_shard: u64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetSettings {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub compression: CompressionMode,
    pub index_prefix: String,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LeaseBackend {
    Memory,
    Sled { path: PathBuf },
    Cluster { url: String, index_suffix: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoordinationSettings {
    pub backend: LeaseBackend,
    pub initial_lease: Duration,
    pub tolerable_clock_difference: Duration,
    pub renew_interval: Duration,
    pub min_time_for_batch: Duration,
    pub release_on_exit: bool,
}

/// Immutable, validated configuration for one invocation.
#[derive(Debug, Clone)]
pub struct ValidatedSettings {
    pub source: SourceSettings,
    pub indices: Vec<String>,
    /// Absent when no target url was configured; only `run` and `probe` need it.
    pub target: Option<TargetSettings>,
    pub coordination: CoordinationSettings,
    pub pipeline: PipelineConfig,
    pub failed_documents: Option<PathBuf>,
}

impl ValidatedSettings {
    pub fn snapshot(&self) -> &str {
        match &self.source {
            SourceSettings::Ndjson { snapshot, .. } | SourceSettings::Synthetic { snapshot, .. } => {
                snapshot
            }
        }
    }
}
