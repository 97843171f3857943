use crate::{
    error::ConnectorError,
    http::ClusterClient,
    transport::{BulkHeaders, BulkTransport, TransportResponse},
};
use async_trait::async_trait;
use reqwest::Method;
use tracing::debug;

/// `POST /{index}/_bulk` over a [`ClusterClient`].
pub struct HttpBulkTransport {
    client: ClusterClient,
    supports_compression: bool,
}

impl HttpBulkTransport {
    pub fn new(client: ClusterClient, supports_compression: bool) -> Self {
        Self {
            client,
            supports_compression,
        }
    }
}

#[async_trait]
impl BulkTransport for HttpBulkTransport {
    async fn bulk_write(
        &self,
        index: &str,
        body: Vec<u8>,
        headers: &BulkHeaders,
    ) -> Result<TransportResponse, ConnectorError> {
        let path = format!("{index}/_bulk");
        let body_len = body.len();

        let mut request = self
            .client
            .request(Method::POST, &path)
            .header("Content-Type", "application/x-ndjson");
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.body(body).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        debug!(index, status, request_bytes = body_len, "Bulk request returned");
        Ok(TransportResponse::new(status, body))
    }

    fn supports_compression(&self) -> bool {
        self.supports_compression
    }
}
