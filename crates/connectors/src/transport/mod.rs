use crate::error::ConnectorError;
use async_trait::async_trait;

pub mod http;

/// Status and raw body of one bulk request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Extra headers sent with a bulk body, e.g. `Content-Encoding`.
pub type BulkHeaders = Vec<(String, String)>;

/// Write side of the target cluster.
///
/// Implementations only move bytes. Interpreting the body is the caller's job.
#[async_trait]
pub trait BulkTransport: Send + Sync {
    async fn bulk_write(
        &self,
        index: &str,
        body: Vec<u8>,
        headers: &BulkHeaders,
    ) -> Result<TransportResponse, ConnectorError>;

    /// Whether the endpoint accepts gzip-compressed request bodies.
    fn supports_compression(&self) -> bool;
}
