use connectors::error::ConnectorError;
use engine_core::{error::LeaseStoreError, retry::RetryDisposition};

pub fn classify_connector_error(err: &ConnectorError) -> RetryDisposition {
    if err.is_transient() {
        RetryDisposition::Retry
    } else {
        RetryDisposition::Stop
    }
}

/// HTTP status of a whole bulk request. 429 and server errors are worth
/// another attempt; any other non-success means the request itself is bad.
pub fn classify_bulk_status(status: u16) -> RetryDisposition {
    match status {
        429 | 500..=599 => RetryDisposition::Retry,
        _ => RetryDisposition::Stop,
    }
}

pub fn classify_lease_store_error(err: &LeaseStoreError) -> RetryDisposition {
    if err.is_transient() {
        RetryDisposition::Retry
    } else {
        RetryDisposition::Stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttling_and_server_errors_are_retried() {
        assert_eq!(classify_bulk_status(429), RetryDisposition::Retry);
        assert_eq!(classify_bulk_status(503), RetryDisposition::Retry);
        assert_eq!(classify_bulk_status(400), RetryDisposition::Stop);
        assert_eq!(classify_bulk_status(413), RetryDisposition::Stop);
    }

    #[test]
    fn lease_store_outages_are_retried_but_skew_is_not() {
        assert_eq!(
            classify_lease_store_error(&LeaseStoreError::Unavailable("down".into())),
            RetryDisposition::Retry
        );
        assert_eq!(
            classify_lease_store_error(&LeaseStoreError::ClockSkew {
                skew_ms: 9_000,
                tolerance_ms: 5_000
            }),
            RetryDisposition::Stop
        );
    }
}
