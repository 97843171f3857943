use model::core::version::VersionParseError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Reading a shard file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The request never produced a response (connect, timeout, body read).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The cluster answered with a status the caller did not expect.
    #[error("Unexpected status {status} from {url}: {body}")]
    Status { status: u16, url: String, body: String },

    #[error("Version detection failed: {0}")]
    Version(#[from] VersionParseError),

    #[error("Unknown index: {0}")]
    UnknownIndex(String),

    #[error("Invalid shard file name: {0}")]
    InvalidShard(String),
}

impl ConnectorError {
    /// Timeouts, refused connections and dropped bodies may succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            ConnectorError::Http(err) => {
                err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
            }
            ConnectorError::Status { status, .. } => *status == 429 || *status >= 500,
            ConnectorError::Io(_) => true,
            _ => false,
        }
    }
}
