//! Error types for fake-IP DNS

use thiserror::Error;

/// Result type alias for DNS operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during DNS operations
#[derive(Debug, Error)]
pub enum Error {
    /// DNS query/response error
    #[error("DNS error: {0}")]
    Dns(String),

    /// DNS configuration error
    #[error("DNS configuration error: {0}")]
    Config(String),

    /// The fake-IP network is unparsable or too small
    #[error("invalid fake-IP network '{0}'")]
    InvalidNetwork(String),

    /// Every usable address of the pool is live
    #[error("fake-IP pool {0} exhausted")]
    PoolExhausted(String),

    /// A component was used before it was configured
    #[error("not configured: {0}")]
    NotConfigured(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Errors caused by bad settings, fatal at startup
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::InvalidNetwork(_) | Error::NotConfigured(_)
        )
    }

    /// Errors that only affect a single query
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::PoolExhausted(_) | Error::Dns(_) | Error::Io(_))
    }
}
