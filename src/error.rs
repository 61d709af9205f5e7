use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Broker connection is down")]
    NotConnected,

    #[error("Event bus has been closed")]
    Closed,

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Durable subscription '{0}' is already bound")]
    SubscriptionExists(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url} returned status {status}")]
    Status { status: u16, url: String },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Couldn't decode payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Rate limit exceeded for '{key}', retry after {retry_after:?}")]
    RateLimited { key: String, retry_after: Duration },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing credential: {0}")]
    MissingCredential(&'static str),

    #[error("Worker '{0}' panicked")]
    WorkerPanicked(String),

    #[error("Workers did not stop within {0:?}")]
    StopTimeout(Duration),

    #[error("Repository error: {0}")]
    Repository(String),
}

impl Error {
    /// Infrastructure failures that may succeed when retried later.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::NotConnected
            | Error::Broker(_)
            | Error::Http(_)
            | Error::Timeout(_)
            | Error::Repository(_) => true,
            Error::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::NotConnected.is_transient());
        assert!(
            Error::Status {
                status: 503,
                url: "http://x".into()
            }
            .is_transient()
        );
        assert!(
            !Error::Status {
                status: 404,
                url: "http://x".into()
            }
            .is_transient()
        );
        assert!(!Error::InvalidGeometry("no points provided".into()).is_transient());
        assert!(
            !Error::RateLimited {
                key: "ip:1.2.3.4".into(),
                retry_after: Duration::from_secs(1)
            }
            .is_transient()
        );
    }
}
