//! Error types for the tunnel engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring or running the engine
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to parse configuration file
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TUN device error
    #[error("TUN error: {0}")]
    Tun(#[from] sox_tun::Error),

    /// Packet stack error
    #[error("stack error: {0}")]
    Stack(#[from] sox_stack::Error),

    /// Remote DNS error
    #[error("remote DNS error: {0}")]
    Dns(#[from] sox_dns::Error),

    /// Proxy target or dial error
    #[error("proxy error: {0}")]
    Proxy(String),

    /// Runtime setup error (interface lookup, socket options)
    #[error("setup error: {0}")]
    Setup(String),

    /// No configuration has been inserted
    #[error("engine has no configuration")]
    NotConfigured,

    /// Already running
    #[error("engine is already running")]
    AlreadyRunning,

    /// Invalid state
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    /// Check if this is a recoverable error
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Dns(e) => e.is_recoverable(),
            _ => false,
        }
    }

    /// Check if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        match self {
            Error::Config(_) | Error::ConfigParse(_) | Error::NotConfigured => true,
            Error::Dns(e) => e.is_config_error(),
            Error::Tun(e) => e.is_config_error(),
            _ => false,
        }
    }
}
