use thiserror::Error;

/// Unified error type for the proxyring application
#[derive(Error, Debug)]
pub enum PoolError {
    // Configuration errors
    #[error("configuration missing: {0}")]
    ConfigMissing(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // Store errors
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("database open failed: {0}")]
    DatabaseOpen(String),

    #[error("proxy already exists: {0}")]
    AlreadyExists(String),

    // Upstream errors
    #[error("invalid upstream address: {0}")]
    UpstreamParse(String),

    #[error("unsupported proxy scheme: {0}")]
    UnsupportedScheme(String),

    #[error("dial failed: {0}")]
    Dial(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("no upstream proxy available")]
    NoProxyAvailable,

    // Forwarder errors
    #[error("invalid client request: {0}")]
    ClientRequest(String),

    #[error("mid-stream I/O error: {0}")]
    MidStream(String),

    // Prober/discovery errors
    #[error("all probe targets failed")]
    AllTargetsFailed,

    #[error("discovery request failed: {0}")]
    Discovery(String),

    #[error("operation timed out")]
    Timeout,

    // I/O and HTTP errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for proxyring operations
pub type Result<T> = std::result::Result<T, PoolError>;

impl PoolError {
    /// Whether this error should terminate the process at startup.
    ///
    /// Only missing configuration and a failed store open are fatal; every
    /// other error is handled and logged where it occurs.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PoolError::ConfigMissing(_) | PoolError::InvalidConfig(_) | PoolError::DatabaseOpen(_)
        )
    }
}

impl From<url::ParseError> for PoolError {
    fn from(err: url::ParseError) -> Self {
        PoolError::UpstreamParse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(PoolError::ConfigMissing("config.yaml".into()).is_fatal());
        assert!(PoolError::DatabaseOpen("locked".into()).is_fatal());

        assert!(!PoolError::NoProxyAvailable.is_fatal());
        assert!(!PoolError::AllTargetsFailed.is_fatal());
        assert!(!PoolError::Dial("refused".into()).is_fatal());
    }

    #[test]
    fn test_url_parse_error_maps_to_upstream_parse() {
        let err: PoolError = url::Url::parse("not a url").unwrap_err().into();
        assert!(matches!(err, PoolError::UpstreamParse(_)));
    }
}
