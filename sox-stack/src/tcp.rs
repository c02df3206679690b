//! TCP termination
//!
//! TCP segments read from the device are fed to a smoltcp interface that
//! answers for every destination address. A listening socket is created for
//! each new SYN, so the handshake completes against whatever address the
//! client dialed. Once established, the socket is handed to the
//! [`ConnHandler`](crate::ConnHandler) as a [`TcpConn`] whose byte streams
//! are pumped by one task.
//!
//! ```text
//!  dispatch ──TcpSegment──► tcp task ──► smoltcp Interface (any-ip)
//!                              │               │
//!                              │          per-flow sockets
//!                              ▼               │
//!                         outbound queue ◄─────┘
//!                              ▲
//!  TcpConn ◄──Bytes──► pump ───┘
//! ```

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::phy::{self, DeviceCapabilities, Medium};
use smoltcp::socket::tcp::{self, State};
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr};
use tokio::sync::{broadcast, mpsc, Notify};

use crate::error::{Error, Result};
use crate::stack::StackHandle;
use crate::stats::StackStats;
use crate::FlowId;

/// Segments waiting for the TCP task before new ones are dropped
pub(crate) const SEGMENT_QUEUE: usize = 1024;

/// Chunks buffered toward a [`TcpConn`] reader
const CONN_QUEUE: usize = 16;

/// Largest chunk moved out of a socket at once
const CHUNK_SIZE: usize = 16 * 1024;

/// Upper bound on the idle wait between polls
const MAX_POLL_WAIT: Duration = Duration::from_secs(1);

/// The interface's own address; the default route points at it so any-ip
/// accepts every destination
const INTERFACE_ADDR: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 1);

/// A TCP segment handed from the inbound task
pub(crate) struct TcpSegment {
    pub flow: FlowId,
    pub syn: bool,
    pub packet: Vec<u8>,
}

/// One accepted TCP connection
///
/// Bytes from the client arrive on [`recv`]; [`send`] queues bytes toward
/// the client. [`shutdown`] closes the sending half once queued data is
/// flushed. Dropping the connection aborts it if the client has not closed
/// its side yet.
///
/// [`recv`]: TcpConn::recv
/// [`send`]: TcpConn::send
/// [`shutdown`]: TcpConn::shutdown
pub struct TcpConn {
    id: FlowId,
    rx: mpsc::Receiver<Bytes>,
    tx: Option<mpsc::Sender<Bytes>>,
    wake: Arc<Notify>,
}

impl TcpConn {
    /// The flow this connection serves
    pub fn id(&self) -> FlowId {
        self.id
    }

    /// Next chunk from the client; `None` once the client closed its side
    pub async fn recv(&mut self) -> Option<Bytes> {
        let chunk = self.rx.recv().await;
        self.wake.notify_one();
        chunk
    }

    /// Queue `data` toward the client
    pub async fn send(&self, data: &[u8]) -> Result<usize> {
        let tx = self.tx.as_ref().ok_or(Error::Closed)?;
        tx.send(Bytes::copy_from_slice(data))
            .await
            .map_err(|_| Error::Closed)?;
        self.wake.notify_one();
        Ok(data.len())
    }

    /// Close the sending half; the client sees FIN after queued data
    pub fn shutdown(&mut self) {
        if self.tx.take().is_some() {
            self.wake.notify_one();
        }
    }
}

impl Drop for TcpConn {
    fn drop(&mut self) {
        self.wake.notify_one();
    }
}

impl std::fmt::Debug for TcpConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConn").field("id", &self.id).finish()
    }
}

/// In-memory packet device the smoltcp interface runs on
struct SegmentDevice {
    inbound: VecDeque<Vec<u8>>,
    outbound: VecDeque<Vec<u8>>,
    mtu: usize,
}

struct SegmentRx(Vec<u8>);

struct SegmentTx<'a>(&'a mut VecDeque<Vec<u8>>);

impl phy::RxToken for SegmentRx {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.0)
    }
}

impl phy::TxToken for SegmentTx<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut packet = vec![0u8; len];
        let result = f(&mut packet);
        self.0.push_back(packet);
        result
    }
}

impl phy::Device for SegmentDevice {
    type RxToken<'a> = SegmentRx where Self: 'a;
    type TxToken<'a> = SegmentTx<'a> where Self: 'a;

    fn receive(
        &mut self,
        _timestamp: smoltcp::time::Instant,
    ) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let packet = self.inbound.pop_front()?;
        Some((SegmentRx(packet), SegmentTx(&mut self.outbound)))
    }

    fn transmit(&mut self, _timestamp: smoltcp::time::Instant) -> Option<Self::TxToken<'_>> {
        Some(SegmentTx(&mut self.outbound))
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        caps
    }
}

/// Per-flow bookkeeping next to the smoltcp socket
struct Entry {
    socket: SocketHandle,
    /// Held until the handshake completes
    pending_conn: Option<TcpConn>,
    /// Toward the conn reader; dropped to signal EOF
    to_conn: Option<mpsc::Sender<Bytes>>,
    /// From the conn writer; `None` once it shut down
    from_conn: Option<mpsc::Receiver<Bytes>>,
    /// Chunk read from the conn but not yet accepted by the socket
    unsent: Bytes,
}

struct TcpEngine {
    iface: Interface,
    device: SegmentDevice,
    sockets: SocketSet<'static>,
    entries: HashMap<FlowId, Entry>,
    wake: Arc<Notify>,
    started: Instant,
    send_buffer: usize,
    receive_buffer: usize,
    max_connections: usize,
}

impl TcpEngine {
    fn new(mtu: usize, handle: &StackHandle, wake: Arc<Notify>) -> Self {
        let options = handle.options();
        let mut device = SegmentDevice {
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
            mtu,
        };
        let started = Instant::now();

        let mut iface = Interface::new(
            Config::new(HardwareAddress::Ip),
            &mut device,
            smoltcp::time::Instant::from_millis(0),
        );
        iface.set_any_ip(true);
        iface.update_ip_addrs(|addrs| {
            let _ = addrs.push(IpCidr::new(IpAddress::Ipv4(INTERFACE_ADDR), 0));
        });
        if iface
            .routes_mut()
            .add_default_ipv4_route(INTERFACE_ADDR)
            .is_err()
        {
            log::warn!("[STACK] cannot install TCP default route");
        }

        Self {
            iface,
            device,
            sockets: SocketSet::new(Vec::new()),
            entries: HashMap::new(),
            wake,
            started,
            send_buffer: options.effective_tcp_send_buffer_size(),
            receive_buffer: options.effective_tcp_receive_buffer_size(),
            max_connections: options.max_tcp_connections,
        }
    }

    fn now(&self) -> smoltcp::time::Instant {
        let elapsed = self.started.elapsed();
        smoltcp::time::Instant::from_micros(elapsed.as_micros() as i64)
    }

    fn poll(&mut self) {
        let now = self.now();
        self.iface.poll(now, &mut self.device, &mut self.sockets);
    }

    fn poll_delay(&mut self) -> Duration {
        let now = self.now();
        match self.iface.poll_delay(now, &self.sockets) {
            Some(delay) => Duration::from_micros(delay.total_micros()).min(MAX_POLL_WAIT),
            None => MAX_POLL_WAIT,
        }
    }

    /// Feed one segment, opening a listener first if it starts a connection
    fn ingest(&mut self, segment: TcpSegment, stats: &StackStats) {
        let mut opened = false;
        if segment.syn && !self.entries.contains_key(&segment.flow) {
            if self.entries.len() >= self.max_connections {
                StackStats::incr(&stats.tcp_segments_dropped);
                log::debug!(
                    "[STACK] TCP connection limit {} reached, refusing {}",
                    self.max_connections,
                    segment.flow
                );
                // No listener: smoltcp answers the SYN with RST
            } else {
                opened = self.listen(segment.flow);
            }
        }
        self.device.inbound.push_back(segment.packet);
        if opened {
            // Listeners share the local endpoint; bind this SYN to the
            // listener just opened before another one shows up
            self.poll();
        }
    }

    fn listen(&mut self, flow: FlowId) -> bool {
        let mut socket = tcp::Socket::new(
            tcp::SocketBuffer::new(vec![0u8; self.receive_buffer]),
            tcp::SocketBuffer::new(vec![0u8; self.send_buffer]),
        );
        if let Err(e) = socket.listen(flow.local()) {
            log::debug!("[STACK] cannot listen for {}: {}", flow, e);
            return false;
        }

        let (to_conn, rx) = mpsc::channel(CONN_QUEUE);
        let (tx, from_conn) = mpsc::channel(CONN_QUEUE);
        let conn = TcpConn {
            id: flow,
            rx,
            tx: Some(tx),
            wake: self.wake.clone(),
        };

        let socket = self.sockets.add(socket);
        self.entries.insert(
            flow,
            Entry {
                socket,
                pending_conn: Some(conn),
                to_conn: Some(to_conn),
                from_conn: Some(from_conn),
                unsent: Bytes::new(),
            },
        );
        log::trace!("[STACK] TCP listener opened for {}", flow);
        true
    }

    /// Move data between sockets and connections, hand off new connections
    /// and drop finished ones
    fn service(&mut self, stack: &StackHandle) {
        let stats = stack.stats_ref();
        let mut finished = Vec::new();

        for (flow, entry) in self.entries.iter_mut() {
            let socket = self.sockets.get_mut::<tcp::Socket>(entry.socket);

            match socket.state() {
                // A SYN that never turned into a handshake
                State::Listen => {
                    finished.push(*flow);
                    continue;
                }
                State::Closed | State::TimeWait => {
                    finished.push(*flow);
                    continue;
                }
                State::SynReceived | State::SynSent => continue,
                _ => {}
            }

            if let Some(conn) = entry.pending_conn.take() {
                match stack.tcp_handler() {
                    Some(handler) => {
                        StackStats::incr(&stats.tcp_connections_accepted);
                        log::debug!("[STACK] TCP connection accepted: {}", flow);
                        handler.handle_tcp(conn);
                    }
                    None => {
                        log::debug!("[STACK] no TCP handler, resetting {}", flow);
                        socket.abort();
                        continue;
                    }
                }
            }

            pump_to_conn(socket, entry);
            pump_from_conn(socket, entry);
        }

        for flow in finished {
            if let Some(entry) = self.entries.remove(&flow) {
                self.sockets.remove(entry.socket);
                log::trace!("[STACK] TCP socket released: {}", flow);
            }
        }
        StackStats::set(&stats.tcp_connections_active, self.entries.len());
    }

    fn flush(&mut self, stack: &StackHandle) {
        while let Some(packet) = self.device.outbound.pop_front() {
            if let Err(e) = stack.write_packet(packet) {
                log::trace!("[STACK] TCP segment not written: {}", e);
            }
        }
    }

    /// Poll, service, poll again and flush whatever smoltcp emitted
    fn run_once(&mut self, stack: &StackHandle) {
        self.poll();
        self.service(stack);
        self.poll();
        self.flush(stack);
    }
}

/// Client bytes from the socket toward the conn reader
fn pump_to_conn(socket: &mut tcp::Socket<'static>, entry: &mut Entry) {
    let Some(to_conn) = entry.to_conn.as_ref() else {
        // EOF already delivered; discard late data so the window stays open
        while socket.can_recv() {
            if socket.recv(|buf| (buf.len(), ())).is_err() {
                break;
            }
        }
        return;
    };

    if to_conn.is_closed() {
        // The conn was dropped before the client finished
        socket.abort();
        entry.to_conn = None;
        entry.from_conn = None;
        return;
    }

    let mut closed = false;
    while socket.can_recv() {
        let permit = match to_conn.try_reserve() {
            Ok(permit) => permit,
            Err(mpsc::error::TrySendError::Full(())) => return,
            Err(mpsc::error::TrySendError::Closed(())) => {
                socket.abort();
                closed = true;
                break;
            }
        };
        match socket.recv(|buf| {
            let n = buf.len().min(CHUNK_SIZE);
            (n, Bytes::copy_from_slice(&buf[..n]))
        }) {
            Ok(chunk) => permit.send(chunk),
            Err(_) => break,
        }
    }
    if closed {
        entry.to_conn = None;
        return;
    }

    if !socket.may_recv() && !socket.can_recv() {
        entry.to_conn = None;
    }
}

/// Conn bytes toward the client through the socket
fn pump_from_conn(socket: &mut tcp::Socket<'static>, entry: &mut Entry) {
    loop {
        if entry.unsent.is_empty() {
            let Some(from_conn) = entry.from_conn.as_mut() else {
                return;
            };
            match from_conn.try_recv() {
                Ok(chunk) => entry.unsent = chunk,
                Err(mpsc::error::TryRecvError::Empty) => return,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    entry.from_conn = None;
                    socket.close();
                    return;
                }
            }
        }

        if !socket.can_send() {
            return;
        }
        match socket.send_slice(&entry.unsent) {
            Ok(0) => return,
            Ok(n) => {
                let _ = entry.unsent.split_to(n);
            }
            Err(_) => {
                entry.unsent = Bytes::new();
                entry.from_conn = None;
                return;
            }
        }
    }
}

/// Drive every TCP connection of one stack
pub(crate) async fn tcp_loop(
    handle: StackHandle,
    mtu: usize,
    mut segments: mpsc::Receiver<TcpSegment>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let wake = Arc::new(Notify::new());
    let mut engine = TcpEngine::new(mtu, &handle, wake.clone());
    let stats = handle.stats_ref().clone();

    loop {
        let delay = engine.poll_delay();
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            segment = segments.recv() => {
                let Some(segment) = segment else { break };
                engine.ingest(segment, &stats);
                while let Ok(segment) = segments.try_recv() {
                    engine.ingest(segment, &stats);
                }
            }
            _ = wake.notified() => {}
            _ = tokio::time::sleep(delay) => {}
        }
        engine.run_once(&handle);
    }

    StackStats::set(&stats.tcp_connections_active, 0);
    log::debug!("[STACK] TCP task finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> (TcpConn, mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>, Arc<Notify>) {
        let wake = Arc::new(Notify::new());
        let (to_conn, rx) = mpsc::channel(2);
        let (tx, from_conn) = mpsc::channel(2);
        let conn = TcpConn {
            id: FlowId::from_inbound(
                "10.0.0.2:40000".parse().unwrap(),
                "93.184.216.34:80".parse().unwrap(),
            ),
            rx,
            tx: Some(tx),
            wake: wake.clone(),
        };
        (conn, to_conn, from_conn, wake)
    }

    #[tokio::test]
    async fn test_conn_send_and_shutdown() {
        let (mut conn, _to_conn, mut from_conn, wake) = conn();

        assert_eq!(conn.send(b"abc").await.unwrap(), 3);
        wake.notified().await;
        assert_eq!(&from_conn.recv().await.unwrap()[..], b"abc");

        conn.shutdown();
        assert!(matches!(conn.send(b"x").await, Err(Error::Closed)));
        assert!(from_conn.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_conn_recv_until_eof() {
        let (mut conn, to_conn, _from_conn, _wake) = conn();

        to_conn.send(Bytes::from_static(b"data")).await.unwrap();
        drop(to_conn);
        assert_eq!(&conn.recv().await.unwrap()[..], b"data");
        assert!(conn.recv().await.is_none());
    }

    #[test]
    fn test_device_reports_ip_medium() {
        let device = SegmentDevice {
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
            mtu: 1400,
        };
        let caps = phy::Device::capabilities(&device);
        assert_eq!(caps.medium, Medium::Ip);
        assert_eq!(caps.max_transmission_unit, 1400);
    }
}
