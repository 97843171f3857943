use crate::error::ConnectorError;
use model::core::version::ClusterVersion;
use reqwest::{Method, RequestBuilder};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone)]
pub struct BasicAuth {
    pub username: String,
    pub password: Option<String>,
}

/// Thin wrapper over a `reqwest::Client` bound to one cluster endpoint.
#[derive(Debug, Clone)]
pub struct ClusterClient {
    http: reqwest::Client,
    base_url: String,
    auth: Option<BasicAuth>,
}

impl ClusterClient {
    pub fn new(
        base_url: &str,
        auth: Option<BasicAuth>,
        timeout: Duration,
    ) -> Result<Self, ConnectorError> {
        let trimmed = base_url.trim_end_matches('/');
        if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
            return Err(ConnectorError::InvalidUrl(base_url.to_string()));
        }

        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            base_url: trimmed.to_string(),
            auth,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Starts a request against `path`, with credentials applied.
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, self.url(path));
        match &self.auth {
            Some(auth) => builder.basic_auth(&auth.username, auth.password.as_deref()),
            None => builder,
        }
    }

    /// Reads distribution and version from the root endpoint.
    pub async fn detect_version(&self) -> Result<ClusterVersion, ConnectorError> {
        let response = self.request(Method::GET, "/").send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        if !(200..300).contains(&status) {
            return Err(ConnectorError::Status {
                status,
                url: self.base_url.clone(),
                body,
            });
        }

        let json: serde_json::Value = serde_json::from_str(&body)?;
        let version = ClusterVersion::from_root_response(&json)?;
        info!(url = %self.base_url, version = %version, "Detected cluster version");
        Ok(version)
    }
}
