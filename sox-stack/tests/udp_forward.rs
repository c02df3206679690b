//! End-to-end tests of the stack over an in-memory device

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sox_stack::packet::{build_udp, parse_inbound, Inbound};
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    IpAddress, IpProtocol, Ipv4Packet, Ipv4Repr, TcpControl, TcpPacket, TcpRepr, TcpSeqNumber,
};
use sox_stack::{
    ConnHandler, DatagramWriter, FlowId, MemoryDevice, PacketInterceptor, Stack, StackOptions,
    TcpConn, UdpConn, UdpForwarder,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

/// Hands every accepted connection to the test through a channel
struct ChannelHandler {
    tx: mpsc::UnboundedSender<UdpConn>,
}

impl ConnHandler for ChannelHandler {
    fn handle_udp(&self, conn: UdpConn) {
        let _ = self.tx.send(conn);
    }

    fn handle_tcp(&self, _conn: TcpConn) {}
}

/// Answers datagrams to one port with a fixed payload
struct PortEcho {
    port: u16,
    seen: AtomicUsize,
}

impl PacketInterceptor for PortEcho {
    fn intercept(&self, flow: &FlowId, _payload: &[u8], replies: &Arc<dyn DatagramWriter>) -> bool {
        if flow.local_port != self.port {
            return false;
        }
        self.seen.fetch_add(1, Ordering::SeqCst);
        replies
            .write_udp(flow.local(), flow.remote(), b"intercepted")
            .is_ok()
    }
}

fn client() -> SocketAddr {
    "10.0.0.2:40000".parse().unwrap()
}

fn target(port: u16) -> SocketAddr {
    format!("93.184.216.34:{}", port).parse().unwrap()
}

#[tokio::test]
async fn test_new_flow_reaches_handler_once() {
    let (device, mut io) = MemoryDevice::new("mem0", 1500, 16);
    let stack = Stack::new(Arc::new(device), StackOptions::default()).unwrap();
    let handle = stack.handle();

    let (tx, mut accepted) = mpsc::unbounded_channel();
    handle.set_udp_handler(Arc::new(UdpForwarder::new(Arc::new(ChannelHandler { tx }))));

    io.inject
        .send(build_udp(client(), target(443), b"first").unwrap())
        .await
        .unwrap();
    io.inject
        .send(build_udp(client(), target(443), b"second").unwrap())
        .await
        .unwrap();

    let mut conn = timeout(WAIT, accepted.recv()).await.unwrap().unwrap();
    assert_eq!(conn.id().remote(), client());
    assert_eq!(conn.id().local(), target(443));

    let first = timeout(WAIT, conn.recv()).await.unwrap().unwrap();
    let second = timeout(WAIT, conn.recv()).await.unwrap().unwrap();
    assert_eq!(&first[..], b"first");
    assert_eq!(&second[..], b"second");

    // The second datagram was demultiplexed, not submitted as a new flow
    assert!(accepted.try_recv().is_err());

    conn.send(b"reply").await.unwrap();
    let written = timeout(WAIT, io.written.recv()).await.unwrap().unwrap();
    match parse_inbound(&written).unwrap() {
        Inbound::Udp { flow, payload } => {
            assert_eq!(flow.remote(), target(443));
            assert_eq!(flow.local(), client());
            assert_eq!(payload, b"reply");
        }
        other => panic!("unexpected packet {:?}", other),
    }

    let stats = handle.stats();
    assert_eq!(stats.udp_endpoints_created, 1);
    assert_eq!(stats.udp_endpoints_active, 1);

    drop(conn);
    assert_eq!(handle.stats().udp_endpoints_active, 0);
}

#[tokio::test]
async fn test_interceptor_consumes_datagram() {
    let (device, mut io) = MemoryDevice::new("mem0", 1500, 16);
    let stack = Stack::new(Arc::new(device), StackOptions::default()).unwrap();
    let handle = stack.handle();

    let (tx, mut accepted) = mpsc::unbounded_channel();
    let forwarder = Arc::new(UdpForwarder::new(Arc::new(ChannelHandler { tx })));
    let echo = Arc::new(PortEcho {
        port: 53,
        seen: AtomicUsize::new(0),
    });
    forwarder.push_interceptor(echo.clone());
    handle.set_udp_handler(forwarder.clone());
    assert_eq!(forwarder.interceptor_count(), 1);

    io.inject
        .send(build_udp(client(), target(53), b"query").unwrap())
        .await
        .unwrap();

    let written = timeout(WAIT, io.written.recv()).await.unwrap().unwrap();
    match parse_inbound(&written).unwrap() {
        Inbound::Udp { flow, payload } => {
            assert_eq!(flow.local(), client());
            assert_eq!(payload, b"intercepted");
        }
        other => panic!("unexpected packet {:?}", other),
    }
    assert_eq!(echo.seen.load(Ordering::SeqCst), 1);
    assert!(accepted.try_recv().is_err());

    // Other ports still reach the connection handler
    io.inject
        .send(build_udp(client(), target(123), b"ntp").unwrap())
        .await
        .unwrap();
    let conn = timeout(WAIT, accepted.recv()).await.unwrap().unwrap();
    assert_eq!(conn.id().local_port, 123);
}

#[tokio::test]
async fn test_close_ends_connections() {
    let (device, io) = MemoryDevice::new("mem0", 1500, 16);
    let mut stack = Stack::new(Arc::new(device), StackOptions::default()).unwrap();
    let handle = stack.handle();

    let (tx, mut accepted) = mpsc::unbounded_channel();
    handle.set_udp_handler(Arc::new(UdpForwarder::new(Arc::new(ChannelHandler { tx }))));

    io.inject
        .send(build_udp(client(), target(443), b"x").unwrap())
        .await
        .unwrap();
    let mut conn = timeout(WAIT, accepted.recv()).await.unwrap().unwrap();
    assert!(conn.recv().await.is_some());

    stack.close();
    timeout(WAIT, stack.wait()).await.unwrap();

    assert!(conn.recv().await.is_none());
    assert!(handle.is_closed());
    assert!(handle.create_udp_endpoint(conn.id()).is_err());
}

#[tokio::test]
async fn test_endpoint_limit() {
    let (device, _io) = MemoryDevice::new("mem0", 1500, 16);
    let stack = Stack::new(
        Arc::new(device),
        StackOptions::default().with_max_udp_endpoints(1),
    )
    .unwrap();
    let handle = stack.handle();

    let a = FlowId::from_inbound(client(), target(1));
    let b = FlowId::from_inbound(client(), target(2));

    let _conn = handle.create_udp_endpoint(a).unwrap();
    assert!(handle.create_udp_endpoint(a).is_err());
    assert!(handle.create_udp_endpoint(b).is_err());
}

/// A TCP SYN from `src` to `dst` with valid checksums
fn tcp_syn(src: SocketAddr, dst: SocketAddr) -> Vec<u8> {
    let (src_ip, dst_ip) = match (src, dst) {
        (SocketAddr::V4(s), SocketAddr::V4(d)) => (*s.ip(), *d.ip()),
        _ => unreachable!(),
    };
    let tcp = TcpRepr {
        src_port: src.port(),
        dst_port: dst.port(),
        control: TcpControl::Syn,
        seq_number: TcpSeqNumber(1000),
        ack_number: None,
        window_len: 1024,
        window_scale: None,
        max_seg_size: None,
        sack_permitted: false,
        sack_ranges: [None, None, None],
        timestamp: None,
        payload: &[],
    };
    let ip = Ipv4Repr {
        src_addr: src_ip,
        dst_addr: dst_ip,
        next_header: IpProtocol::Tcp,
        payload_len: tcp.buffer_len(),
        hop_limit: 64,
    };

    let caps = ChecksumCapabilities::default();
    let mut packet = vec![0u8; ip.buffer_len() + tcp.buffer_len()];
    ip.emit(&mut Ipv4Packet::new_unchecked(&mut packet[..]), &caps);
    tcp.emit(
        &mut TcpPacket::new_unchecked(&mut packet[ip.buffer_len()..]),
        &IpAddress::Ipv4(src_ip),
        &IpAddress::Ipv4(dst_ip),
        &caps,
    );
    packet
}

#[tokio::test]
async fn test_tcp_without_handler_and_garbage_are_counted() {
    let (device, io) = MemoryDevice::new("mem0", 1500, 16);
    let stack = Stack::new(Arc::new(device), StackOptions::default()).unwrap();
    let handle = stack.handle();

    io.inject.send(tcp_syn(client(), target(80))).await.unwrap();
    io.inject.send(vec![0x45, 0x00]).await.unwrap();

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let stats = handle.stats();
        if stats.packets_in == 2 {
            assert_eq!(stats.tcp_segments_in, 1);
            assert_eq!(stats.tcp_segments_dropped, 1);
            assert_eq!(stats.tcp_connections_accepted, 0);
            assert_eq!(stats.malformed_packets, 1);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "packets not processed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
