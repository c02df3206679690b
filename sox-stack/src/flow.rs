//! Flow identification

use std::net::{IpAddr, SocketAddr};

/// Identifies one transport flow seen by the stack
///
/// "Local" is the stack side of the flow, i.e. the destination of the
/// inbound datagram (the address the client tried to reach). "Remote" is the
/// client that sent it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowId {
    /// Destination address of inbound packets
    pub local_addr: IpAddr,
    /// Destination port of inbound packets
    pub local_port: u16,
    /// Source address of inbound packets
    pub remote_addr: IpAddr,
    /// Source port of inbound packets
    pub remote_port: u16,
}

impl FlowId {
    /// Build a flow id from the source and destination of an inbound packet
    pub fn from_inbound(src: SocketAddr, dst: SocketAddr) -> Self {
        Self {
            local_addr: dst.ip(),
            local_port: dst.port(),
            remote_addr: src.ip(),
            remote_port: src.port(),
        }
    }

    /// The stack-side socket address (original destination)
    pub fn local(&self) -> SocketAddr {
        SocketAddr::new(self.local_addr, self.local_port)
    }

    /// The client-side socket address
    pub fn remote(&self) -> SocketAddr {
        SocketAddr::new(self.remote_addr, self.remote_port)
    }
}

impl std::fmt::Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.remote(), self.local())
    }
}
