use crate::error::CliError;
use connectors::{
    http::{BasicAuth, ClusterClient},
    source::{DocumentSource, ndjson::NdjsonSource, synthetic::SyntheticSource},
};
use engine_config::settings::validated::{LeaseBackend, SourceSettings, TargetSettings, ValidatedSettings};
use engine_core::{
    clock::Clock,
    lease::{LeaseStore, cluster::ClusterLeaseStore, memory::MemoryLeaseStore, sled_store::SledLeaseStore},
};
use engine_processing::{config::CompressionMode, failed_writer::FailedDocumentWriter};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub fn build_source(settings: &ValidatedSettings) -> Arc<dyn DocumentSource> {
    match &settings.source {
        SourceSettings::Ndjson { path, snapshot } => {
            Arc::new(NdjsonSource::new(path.clone(), snapshot.clone()))
        }
        SourceSettings::Synthetic {
            snapshot,
            shards,
            docs_per_shard,
        } => Arc::new(SyntheticSource::new(
            snapshot.clone(),
            settings.indices.clone(),
            *shards,
            *docs_per_shard,
        )),
    }
}

pub fn cluster_client(url: &str, target: Option<&TargetSettings>) -> Result<ClusterClient, CliError> {
    let auth = target.and_then(|t| {
        t.username.as_ref().map(|username| BasicAuth {
            username: username.clone(),
            password: t.password.clone(),
        })
    });
    let timeout = target.map_or(DEFAULT_REQUEST_TIMEOUT, |t| t.request_timeout);
    Ok(ClusterClient::new(url, auth, timeout)?)
}

/// Opens the configured lease store. The cluster backend reuses the target
/// credentials.
pub async fn open_store(
    settings: &ValidatedSettings,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn LeaseStore>, CliError> {
    let tolerance = settings.coordination.tolerable_clock_difference;
    let store: Arc<dyn LeaseStore> = match &settings.coordination.backend {
        LeaseBackend::Memory => {
            warn!("Using the in-memory lease store; progress is lost when the process exits");
            Arc::new(MemoryLeaseStore::new(clock, tolerance))
        }
        LeaseBackend::Sled { path } => {
            info!(path = %path.display(), "Opening sled lease store");
            Arc::new(SledLeaseStore::open(path, clock, tolerance)?)
        }
        LeaseBackend::Cluster { url, index_suffix } => {
            let client = cluster_client(url, settings.target.as_ref())?;
            Arc::new(ClusterLeaseStore::connect(client, index_suffix, tolerance).await?)
        }
    };
    Ok(store)
}

/// Asks the target whether it takes gzip bodies. Any probe failure means no.
pub async fn target_accepts_compression(client: &ClusterClient, target: &TargetSettings) -> bool {
    if target.compression == CompressionMode::Disabled {
        return false;
    }
    match client.detect_version().await {
        Ok(version) => version.accepts_compressed_requests(),
        Err(err) => {
            warn!(error = %err, "Could not detect target version; sending uncompressed bodies");
            false
        }
    }
}

pub fn failed_writer(settings: &ValidatedSettings) -> Arc<FailedDocumentWriter> {
    match &settings.failed_documents {
        Some(path) => {
            info!(path = %path.display(), "Recording refused documents");
            Arc::new(FailedDocumentWriter::to_file(path.clone()))
        }
        None => Arc::new(FailedDocumentWriter::discard()),
    }
}
