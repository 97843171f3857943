use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid settings file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Every problem found, not just the first.
    #[error("Invalid settings: {}", .0.join("; "))]
    ValidationFailed(Vec<String>),
}
