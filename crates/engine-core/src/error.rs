use thiserror::Error;

#[derive(Error, Debug)]
pub enum LeaseStoreError {
    /// The store could not be reached or answered with a server error.
    #[error("Lease store unavailable: {0}")]
    Unavailable(String),

    /// The caller's clock is too far from the store's clock to trust expiries.
    #[error(
        "Client clock differs from lease store clock by {skew_ms}ms (tolerance {tolerance_ms}ms)"
    )]
    ClockSkew { skew_ms: i64, tolerance_ms: u64 },

    #[error("Failed to serialize lease record: {0}")]
    Serialization(String),

    #[error("Lease storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("Unsupported lease store cluster version: {0}")]
    UnsupportedVersion(String),

    /// The store answered, but not in a shape we understand.
    #[error("Unexpected lease store response: {0}")]
    Protocol(String),
}

impl LeaseStoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LeaseStoreError::Unavailable(_))
    }
}

#[derive(Error, Debug)]
pub enum ProgressError {
    #[error("Failed to read lease records: {0}")]
    Store(#[from] LeaseStoreError),

    #[error("Unknown work item: {0}")]
    UnknownItem(String),
}
