use connectors::error::ConnectorError;
use engine_config::settings::error::SettingsError;
use engine_core::error::{LeaseStoreError, ProgressError};
use engine_runtime::error::{SetupError, WorkerError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Settings(#[from] SettingsError),

    #[error("Failed to open the lease store: {0}")]
    Store(#[from] LeaseStoreError),

    #[error("Failed to create work items: {0}")]
    Setup(#[from] SetupError),

    #[error("Worker failed: {0}")]
    Worker(#[from] WorkerError),

    #[error("Failed to load progress: {0}")]
    Progress(#[from] ProgressError),

    #[error("Cluster request failed: {0}")]
    Connector(#[from] ConnectorError),

    #[error("Failed to serialize data to JSON: {0}")]
    JsonSerialize(#[from] serde_json::Error),

    #[error("No target cluster configured; set [target] url")]
    MissingTarget,
}
