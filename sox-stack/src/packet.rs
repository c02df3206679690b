//! IPv4 packet classification and UDP construction
//!
//! Wire formats come from `smoltcp::wire`; this module only decides which
//! packets the stack understands and turns them into [`FlowId`]s. TCP
//! segments are classified here and terminated by the TCP task.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    IpAddress, IpProtocol, Ipv4Packet, Ipv4Repr, TcpPacket, UdpPacket, UdpRepr,
};

use crate::error::{Error, Result};
use crate::FlowId;

/// IPv4 header length emitted by [`build_udp`]
const IPV4_HEADER_LEN: usize = 20;

/// UDP header length
const UDP_HEADER_LEN: usize = 8;

/// Default TTL for packets written back to the device
const DEFAULT_HOP_LIMIT: u8 = 64;

/// A packet read from the device, classified by transport
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound<'a> {
    /// UDP datagram with its flow and payload
    Udp { flow: FlowId, payload: &'a [u8] },
    /// TCP segment; `syn` is set for a connection request (SYN without ACK)
    Tcp { flow: FlowId, syn: bool },
    /// Any other IP protocol number
    Other(u8),
}

/// Classify a raw IP packet
pub fn parse_inbound(packet: &[u8]) -> Result<Inbound<'_>> {
    let version = packet
        .first()
        .map(|b| b >> 4)
        .ok_or_else(|| Error::Malformed("empty packet".into()))?;
    if version != 4 {
        return Err(Error::Unsupported(format!("IP version {}", version)));
    }

    let ip = Ipv4Packet::new_checked(packet)
        .map_err(|e| Error::Malformed(format!("IPv4 header: {}", e)))?;

    if ip.more_frags() || ip.frag_offset() != 0 {
        return Err(Error::Unsupported("fragmented IPv4 packet".into()));
    }

    let src_ip = Ipv4Addr::from(ip.src_addr());
    let dst_ip = Ipv4Addr::from(ip.dst_addr());
    match ip.next_header() {
        IpProtocol::Udp => {
            let udp = UdpPacket::new_checked(ip.payload())
                .map_err(|e| Error::Malformed(format!("UDP header: {}", e)))?;
            let flow = FlowId::from_inbound(
                SocketAddr::new(IpAddr::V4(src_ip), udp.src_port()),
                SocketAddr::new(IpAddr::V4(dst_ip), udp.dst_port()),
            );
            Ok(Inbound::Udp {
                flow,
                payload: udp.payload(),
            })
        }
        IpProtocol::Tcp => {
            let tcp = TcpPacket::new_checked(ip.payload())
                .map_err(|e| Error::Malformed(format!("TCP header: {}", e)))?;
            let flow = FlowId::from_inbound(
                SocketAddr::new(IpAddr::V4(src_ip), tcp.src_port()),
                SocketAddr::new(IpAddr::V4(dst_ip), tcp.dst_port()),
            );
            Ok(Inbound::Tcp {
                flow,
                syn: tcp.syn() && !tcp.ack(),
            })
        }
        other => Ok(Inbound::Other(u8::from(other))),
    }
}

/// Build an IPv4/UDP packet carrying `payload` from `src` to `dst`
pub fn build_udp(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Result<Vec<u8>> {
    let (src_ip, dst_ip) = match (src.ip(), dst.ip()) {
        (IpAddr::V4(s), IpAddr::V4(d)) => (s, d),
        _ => {
            return Err(Error::Unsupported(format!(
                "cannot build IPv6 datagram {} -> {}",
                src, dst
            )))
        }
    };

    let udp_len = UDP_HEADER_LEN + payload.len();
    if IPV4_HEADER_LEN + udp_len > crate::MAX_PACKET_SIZE {
        return Err(Error::Malformed(format!(
            "UDP payload of {} bytes is too large",
            payload.len()
        )));
    }

    let caps = ChecksumCapabilities::default();
    let mut buf = vec![0u8; IPV4_HEADER_LEN + udp_len];

    let ip_repr = Ipv4Repr {
        src_addr: src_ip,
        dst_addr: dst_ip,
        next_header: IpProtocol::Udp,
        payload_len: udp_len,
        hop_limit: DEFAULT_HOP_LIMIT,
    };
    ip_repr.emit(&mut Ipv4Packet::new_unchecked(&mut buf[..]), &caps);

    let udp_repr = UdpRepr {
        src_port: src.port(),
        dst_port: dst.port(),
    };
    udp_repr.emit(
        &mut UdpPacket::new_unchecked(&mut buf[IPV4_HEADER_LEN..]),
        &IpAddress::Ipv4(src_ip),
        &IpAddress::Ipv4(dst_ip),
        payload.len(),
        |out| out.copy_from_slice(payload),
        &caps,
    );

    Ok(buf)
}
