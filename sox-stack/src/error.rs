//! Error types for the packet stack

use thiserror::Error;

use crate::FlowId;

/// Result type alias for stack operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur inside the packet stack
#[derive(Debug, Error)]
pub enum Error {
    /// Packet could not be parsed
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// Packet uses a protocol or address family the stack does not handle
    #[error("unsupported packet: {0}")]
    Unsupported(String),

    /// An endpoint for this flow already exists
    #[error("endpoint already exists for {0}")]
    EndpointExists(FlowId),

    /// Endpoint table is full
    #[error("too many UDP endpoints (limit {0})")]
    EndpointLimit(usize),

    /// Outbound packet queue is full or closed
    #[error("outbound queue unavailable: {0}")]
    Backpressure(String),

    /// Invalid stack option
    #[error("invalid stack option: {0}")]
    Option(String),

    /// Stack has been closed
    #[error("stack is closed")]
    Closed,

    /// I/O error from the device
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
