//! Stack tuning options

use crate::error::{Error, Result};

/// Default depth of each UDP endpoint's receive queue
pub const DEFAULT_UDP_ENDPOINT_QUEUE: usize = 64;

/// Default cap on concurrently open UDP endpoints
pub const DEFAULT_MAX_UDP_ENDPOINTS: usize = 16384;

/// Default cap on concurrently open TCP connections
pub const DEFAULT_MAX_TCP_CONNECTIONS: usize = 4096;

/// TCP buffer size used when none is configured
pub const DEFAULT_TCP_BUFFER_SIZE: usize = 64 * 1024;

/// TCP receive buffer size used when auto-tuning is enabled and no explicit
/// size is configured
pub const MODERATED_TCP_RECEIVE_BUFFER_SIZE: usize = 256 * 1024;

/// Largest accepted TCP buffer size
pub const MAX_TCP_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Options applied when a [`Stack`](crate::Stack) is built
///
/// Buffers are allocated per TCP connection when its handshake starts.
/// Auto-tuning picks a larger receive buffer; an explicit receive size wins
/// over it.
#[derive(Debug, Clone)]
pub struct StackOptions {
    /// Enable receive-buffer auto-tuning for TCP
    pub tcp_moderate_receive_buffer: bool,
    /// TCP send buffer size in bytes (stack default when `None`)
    pub tcp_send_buffer_size: Option<usize>,
    /// TCP receive buffer size in bytes (stack default when `None`)
    pub tcp_receive_buffer_size: Option<usize>,
    /// Datagrams buffered per UDP endpoint before new ones are dropped
    pub udp_endpoint_queue: usize,
    /// Maximum number of live UDP endpoints
    pub max_udp_endpoints: usize,
    /// Maximum number of TCP connections, including half-open ones
    pub max_tcp_connections: usize,
}

impl Default for StackOptions {
    fn default() -> Self {
        Self {
            tcp_moderate_receive_buffer: false,
            tcp_send_buffer_size: None,
            tcp_receive_buffer_size: None,
            udp_endpoint_queue: DEFAULT_UDP_ENDPOINT_QUEUE,
            max_udp_endpoints: DEFAULT_MAX_UDP_ENDPOINTS,
            max_tcp_connections: DEFAULT_MAX_TCP_CONNECTIONS,
        }
    }
}

impl StackOptions {
    /// Enable or disable TCP receive-buffer auto-tuning
    pub fn with_tcp_moderate_receive_buffer(mut self, enabled: bool) -> Self {
        self.tcp_moderate_receive_buffer = enabled;
        self
    }

    /// Set the TCP send buffer size
    pub fn with_tcp_send_buffer_size(mut self, size: usize) -> Self {
        self.tcp_send_buffer_size = Some(size);
        self
    }

    /// Set the TCP receive buffer size
    pub fn with_tcp_receive_buffer_size(mut self, size: usize) -> Self {
        self.tcp_receive_buffer_size = Some(size);
        self
    }

    /// Set the per-endpoint UDP queue depth
    pub fn with_udp_endpoint_queue(mut self, depth: usize) -> Self {
        self.udp_endpoint_queue = depth;
        self
    }

    /// Set the UDP endpoint limit
    pub fn with_max_udp_endpoints(mut self, max: usize) -> Self {
        self.max_udp_endpoints = max;
        self
    }

    /// Set the TCP connection limit
    pub fn with_max_tcp_connections(mut self, max: usize) -> Self {
        self.max_tcp_connections = max;
        self
    }

    /// Send buffer allocated for each TCP connection
    pub fn effective_tcp_send_buffer_size(&self) -> usize {
        self.tcp_send_buffer_size.unwrap_or(DEFAULT_TCP_BUFFER_SIZE)
    }

    /// Receive buffer allocated for each TCP connection
    pub fn effective_tcp_receive_buffer_size(&self) -> usize {
        match self.tcp_receive_buffer_size {
            Some(size) => size,
            None if self.tcp_moderate_receive_buffer => MODERATED_TCP_RECEIVE_BUFFER_SIZE,
            None => DEFAULT_TCP_BUFFER_SIZE,
        }
    }

    /// Validate the options
    pub fn validate(&self) -> Result<()> {
        for (what, size) in [
            ("send", self.tcp_send_buffer_size),
            ("receive", self.tcp_receive_buffer_size),
        ] {
            match size {
                Some(0) => {
                    return Err(Error::Option(format!(
                        "TCP {} buffer size must be non-zero",
                        what
                    )))
                }
                Some(n) if n > MAX_TCP_BUFFER_SIZE => {
                    return Err(Error::Option(format!(
                        "TCP {} buffer size {} exceeds {}",
                        what, n, MAX_TCP_BUFFER_SIZE
                    )))
                }
                _ => {}
            }
        }
        if self.max_tcp_connections == 0 {
            return Err(Error::Option("TCP connection limit must be non-zero".into()));
        }
        if self.udp_endpoint_queue == 0 {
            return Err(Error::Option("UDP endpoint queue must be non-zero".into()));
        }
        if self.max_udp_endpoints == 0 {
            return Err(Error::Option("UDP endpoint limit must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_are_valid() {
        let opts = StackOptions::default();
        assert!(opts.validate().is_ok());
        assert!(!opts.tcp_moderate_receive_buffer);
        assert_eq!(opts.udp_endpoint_queue, DEFAULT_UDP_ENDPOINT_QUEUE);
    }

    #[test]
    fn test_builder_sets_buffers() {
        let opts = StackOptions::default()
            .with_tcp_moderate_receive_buffer(true)
            .with_tcp_send_buffer_size(4096)
            .with_tcp_receive_buffer_size(8192);
        assert!(opts.tcp_moderate_receive_buffer);
        assert_eq!(opts.tcp_send_buffer_size, Some(4096));
        assert_eq!(opts.tcp_receive_buffer_size, Some(8192));
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_zero_values_rejected() {
        assert!(StackOptions::default()
            .with_tcp_send_buffer_size(0)
            .validate()
            .is_err());
        assert!(StackOptions::default()
            .with_udp_endpoint_queue(0)
            .validate()
            .is_err());
        assert!(StackOptions::default()
            .with_max_udp_endpoints(0)
            .validate()
            .is_err());
        assert!(StackOptions::default()
            .with_max_tcp_connections(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_oversized_tcp_buffer_rejected() {
        assert!(StackOptions::default()
            .with_tcp_receive_buffer_size(MAX_TCP_BUFFER_SIZE + 1)
            .validate()
            .is_err());
        assert!(StackOptions::default()
            .with_tcp_send_buffer_size(MAX_TCP_BUFFER_SIZE)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_effective_buffer_sizes() {
        let opts = StackOptions::default();
        assert_eq!(opts.effective_tcp_send_buffer_size(), DEFAULT_TCP_BUFFER_SIZE);
        assert_eq!(opts.effective_tcp_receive_buffer_size(), DEFAULT_TCP_BUFFER_SIZE);

        let tuned = opts.with_tcp_moderate_receive_buffer(true);
        assert_eq!(
            tuned.effective_tcp_receive_buffer_size(),
            MODERATED_TCP_RECEIVE_BUFFER_SIZE
        );

        let explicit = tuned
            .with_tcp_receive_buffer_size(8192)
            .with_tcp_send_buffer_size(4096);
        assert_eq!(explicit.effective_tcp_receive_buffer_size(), 8192);
        assert_eq!(explicit.effective_tcp_send_buffer_size(), 4096);
    }
}
