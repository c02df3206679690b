//! sox-stack - minimal user-space packet stack
//!
//! This crate sits between a packet device (usually a TUN interface) and the
//! tunnel dispatcher. It parses the IPv4 packets read from the device,
//! demultiplexes UDP datagrams to per-flow endpoints, and hands datagrams of
//! flows it has not seen yet to a registered [`TransportHandler`]. TCP is
//! terminated on a smoltcp interface and every established connection is
//! handed to the [`ConnHandler`] registered with
//! [`StackHandle::set_tcp_handler`].
//!
//! The handler used in practice is [`UdpForwarder`], which offers each new
//! datagram to an ordered chain of [`PacketInterceptor`]s (the fake-IP DNS
//! interceptor lives in `sox-dns`) and otherwise creates a forwarding
//! endpoint and submits it to a [`ConnHandler`].
//!
//! ```text
//!  Device ──recv──► Stack ──known flow──► UdpConn (endpoint queue)
//!                     │
//!                     └─new flow──► UdpForwarder ──► PacketInterceptor chain
//!                                        │
//!                                        └─not handled──► ConnHandler
//! ```
//!
//! TCP connections are accepted for any destination address, so the
//! handler sees the address the client dialed in [`TcpConn::id`].

mod conn;
mod device;
pub mod error;
mod flow;
mod forwarder;
mod option;
pub mod packet;
mod stack;
mod stats;
mod tcp;

pub use conn::UdpConn;
pub use device::{CloseSignal, Device, MemoryDevice, MemoryDeviceHandle};
pub use error::{Error, Result};
pub use flow::FlowId;
pub use forwarder::{ConnHandler, PacketInterceptor, UdpForwarder};
pub use option::{
    StackOptions, DEFAULT_TCP_BUFFER_SIZE, MAX_TCP_BUFFER_SIZE, MODERATED_TCP_RECEIVE_BUFFER_SIZE,
};
pub use stack::{DatagramWriter, Stack, StackHandle, TransportHandler};
pub use stats::{StackStats, StatsSnapshot};
pub use tcp::TcpConn;

/// Largest IP packet the stack reads from a device
pub const MAX_PACKET_SIZE: usize = 65535;
