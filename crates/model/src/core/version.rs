use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distribution {
    Elasticsearch,
    OpenSearch,
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Distribution::Elasticsearch => f.write_str("Elasticsearch"),
            Distribution::OpenSearch => f.write_str("OpenSearch"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionParseError {
    #[error("Missing version.number in cluster response")]
    MissingNumber,

    #[error("Invalid version number: {0}")]
    InvalidNumber(String),
}

/// Distribution and version reported by a cluster's root endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterVersion {
    pub distribution: Distribution,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ClusterVersion {
    pub fn new(distribution: Distribution, major: u32, minor: u32, patch: u32) -> Self {
        Self {
            distribution,
            major,
            minor,
            patch,
        }
    }

    /// Parses a dotted version string such as `7.10.2` or `6.8.23-SNAPSHOT`.
    pub fn parse(distribution: Distribution, number: &str) -> Result<Self, VersionParseError> {
        let core = number.split(['-', '+']).next().unwrap_or(number);
        let mut parts = core.split('.');

        let mut next = |required: bool| -> Result<u32, VersionParseError> {
            match parts.next() {
                Some(p) => p
                    .parse::<u32>()
                    .map_err(|_| VersionParseError::InvalidNumber(number.to_string())),
                None if required => Err(VersionParseError::InvalidNumber(number.to_string())),
                None => Ok(0),
            }
        };

        let major = next(true)?;
        let minor = next(false)?;
        let patch = next(false)?;
        Ok(Self::new(distribution, major, minor, patch))
    }

    /// Reads the `GET /` response body of a cluster.
    ///
    /// OpenSearch reports `version.distribution = "opensearch"`; Elasticsearch
    /// omits the field.
    pub fn from_root_response(body: &serde_json::Value) -> Result<Self, VersionParseError> {
        let version = body.get("version").ok_or(VersionParseError::MissingNumber)?;
        let number = version
            .get("number")
            .and_then(|n| n.as_str())
            .ok_or(VersionParseError::MissingNumber)?;

        let distribution = match version.get("distribution").and_then(|d| d.as_str()) {
            Some(d) if d.eq_ignore_ascii_case("opensearch") => Distribution::OpenSearch,
            _ => Distribution::Elasticsearch,
        };

        Self::parse(distribution, number)
    }

    /// Whether the cluster accepts gzip-encoded bulk bodies with default settings.
    pub fn accepts_compressed_requests(&self) -> bool {
        match self.distribution {
            Distribution::OpenSearch => true,
            Distribution::Elasticsearch => self.major >= 7,
        }
    }
}

impl fmt::Display for ClusterVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}.{}.{}",
            self.distribution, self.major, self.minor, self.patch
        )
    }
}
