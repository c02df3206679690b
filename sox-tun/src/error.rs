//! Error types for sox-tun

use std::io;
use thiserror::Error;

/// Result type alias for sox-tun operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during TUN device operations
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Device spec could not be parsed
    #[error("invalid device spec '{0}'")]
    InvalidSpec(String),

    /// Device creation error
    #[error("device creation error: {0}")]
    DeviceCreation(String),

    /// Operation not supported on this platform
    #[error("operation not supported: {0}")]
    NotSupported(String),
}

impl Error {
    /// Check if the error is a permission-related error
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::PermissionDenied)
    }

    /// Errors caused by bad settings rather than the system
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::Config(_) | Error::InvalidSpec(_))
    }
}
