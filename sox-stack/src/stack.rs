//! The packet stack: device I/O loops, UDP demultiplexing and TCP hand-off

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::conn::UdpConn;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::forwarder::ConnHandler;
use crate::option::StackOptions;
use crate::packet::{self, Inbound};
use crate::stats::{StackStats, StatsSnapshot};
use crate::tcp::{self, TcpSegment};
use crate::{FlowId, MAX_PACKET_SIZE};

/// Packets queued for the device before writers see backpressure
const OUTBOUND_QUEUE: usize = 1024;

/// Receives datagrams of flows that have no endpoint yet
///
/// Called synchronously on the stack's inbound task. Implementations must not
/// block; anything slow has to be spawned. Returning `false` means the
/// datagram was not consumed and the stack drops it.
pub trait TransportHandler: Send + Sync {
    fn handle(&self, stack: &StackHandle, flow: FlowId, payload: &[u8]) -> bool;
}

/// Writes UDP datagrams back towards the device
pub trait DatagramWriter: Send + Sync {
    /// Queue a datagram from `from` to `to`; never blocks
    fn write_udp(&self, from: SocketAddr, to: SocketAddr, payload: &[u8]) -> Result<()>;
}

/// Reply path shared by the handle and interceptors
struct ReplySink {
    tx: mpsc::Sender<Vec<u8>>,
    stats: Arc<StackStats>,
}

impl ReplySink {
    fn encode(&self, from: SocketAddr, to: SocketAddr, payload: &[u8]) -> Result<Vec<u8>> {
        let packet = packet::build_udp(from, to, payload)?;
        StackStats::incr(&self.stats.udp_datagrams_out);
        Ok(packet)
    }

    async fn send(&self, from: SocketAddr, to: SocketAddr, payload: &[u8]) -> Result<()> {
        let packet = self.encode(from, to, payload)?;
        self.tx.send(packet).await.map_err(|_| Error::Closed)
    }
}

impl DatagramWriter for ReplySink {
    fn write_udp(&self, from: SocketAddr, to: SocketAddr, payload: &[u8]) -> Result<()> {
        let packet = self.encode(from, to, payload)?;
        self.tx.try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                StackStats::incr(&self.stats.dropped_packets);
                Error::Backpressure("outbound queue full".into())
            }
            mpsc::error::TrySendError::Closed(_) => Error::Closed,
        })
    }
}

struct Inner {
    options: StackOptions,
    endpoints: Mutex<HashMap<FlowId, mpsc::Sender<Bytes>>>,
    udp_handler: RwLock<Option<Arc<dyn TransportHandler>>>,
    tcp_handler: RwLock<Option<Arc<dyn ConnHandler>>>,
    tcp_segments: mpsc::Sender<TcpSegment>,
    replies: Arc<ReplySink>,
    stats: Arc<StackStats>,
    shutdown_tx: broadcast::Sender<()>,
    closed: AtomicBool,
}

/// Cloneable handle to a running stack
#[derive(Clone)]
pub struct StackHandle {
    inner: Arc<Inner>,
}

impl StackHandle {
    /// Register the handler for datagrams of unknown UDP flows
    pub fn set_udp_handler(&self, handler: Arc<dyn TransportHandler>) {
        *self.inner.udp_handler.write() = Some(handler);
    }

    /// Register the handler for established TCP connections
    ///
    /// Without one, connection requests are dropped.
    pub fn set_tcp_handler(&self, handler: Arc<dyn ConnHandler>) {
        *self.inner.tcp_handler.write() = Some(handler);
    }

    pub(crate) fn tcp_handler(&self) -> Option<Arc<dyn ConnHandler>> {
        self.inner.tcp_handler.read().clone()
    }

    pub(crate) fn stats_ref(&self) -> &Arc<StackStats> {
        &self.inner.stats
    }

    /// Queue a raw IP packet for the device; never blocks
    pub(crate) fn write_packet(&self, packet: Vec<u8>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.inner.replies.tx.try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                StackStats::incr(&self.inner.stats.dropped_packets);
                Error::Backpressure("outbound queue full".into())
            }
            mpsc::error::TrySendError::Closed(_) => Error::Closed,
        })
    }

    /// Create a forwarding endpoint for `flow`
    ///
    /// Later inbound datagrams of the flow are queued on the returned
    /// connection instead of reaching the transport handler.
    pub fn create_udp_endpoint(&self, flow: FlowId) -> Result<UdpConn> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let mut endpoints = self.inner.endpoints.lock();
        if endpoints.contains_key(&flow) {
            return Err(Error::EndpointExists(flow));
        }
        if endpoints.len() >= self.inner.options.max_udp_endpoints {
            return Err(Error::EndpointLimit(self.inner.options.max_udp_endpoints));
        }

        let (tx, rx) = mpsc::channel(self.inner.options.udp_endpoint_queue);
        endpoints.insert(flow, tx);
        StackStats::incr(&self.inner.stats.udp_endpoints_created);
        log::debug!("[STACK] UDP endpoint created: {}", flow);

        Ok(UdpConn::new(flow, rx, self.clone()))
    }

    /// Writer for datagrams back to the device
    pub fn writer(&self) -> Arc<dyn DatagramWriter> {
        self.inner.replies.clone()
    }

    /// Options the stack was built with
    pub fn options(&self) -> &StackOptions {
        &self.inner.options
    }

    /// Current counters
    pub fn stats(&self) -> StatsSnapshot {
        let active = self.inner.endpoints.lock().len();
        self.inner.stats.snapshot(active)
    }

    /// Whether the stack has been closed
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Queue a datagram on an existing endpoint
    pub(crate) fn deliver(&self, flow: &FlowId, payload: &[u8]) -> bool {
        let tx = match self.inner.endpoints.lock().get(flow) {
            Some(tx) => tx.clone(),
            None => return false,
        };

        match tx.try_send(Bytes::copy_from_slice(payload)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Endpoint is not keeping up; the datagram is consumed anyway
                StackStats::incr(&self.inner.stats.dropped_packets);
                log::debug!("[STACK] endpoint queue full, dropping datagram for {}", flow);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.remove_endpoint(flow);
                false
            }
        }
    }

    pub(crate) fn remove_endpoint(&self, flow: &FlowId) {
        if self.inner.endpoints.lock().remove(flow).is_some() {
            log::debug!("[STACK] UDP endpoint removed: {}", flow);
        }
    }

    pub(crate) async fn send_udp(&self, from: SocketAddr, to: SocketAddr, payload: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.inner.replies.send(from, to, payload).await
    }

    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.shutdown_tx.send(());
        // Dropping the senders ends every UdpConn::recv
        self.inner.endpoints.lock().clear();
        self.inner.udp_handler.write().take();
        self.inner.tcp_handler.write().take();
    }

    /// Dispatch one inbound packet read from the device
    fn dispatch(&self, data: &[u8]) {
        let stats = &self.inner.stats;
        StackStats::incr(&stats.packets_in);
        StackStats::add(&stats.bytes_in, data.len());

        match packet::parse_inbound(data) {
            Ok(Inbound::Udp { flow, payload }) => {
                StackStats::incr(&stats.udp_datagrams_in);
                if self.deliver(&flow, payload) {
                    return;
                }

                let handler = self.inner.udp_handler.read().clone();
                let handled = match handler {
                    Some(handler) => handler.handle(self, flow, payload),
                    None => false,
                };
                if !handled {
                    StackStats::incr(&stats.dropped_packets);
                    log::trace!("[STACK] unhandled UDP datagram {}", flow);
                }
            }
            Ok(Inbound::Tcp { flow, syn }) => {
                StackStats::incr(&stats.tcp_segments_in);
                if syn && self.inner.tcp_handler.read().is_none() {
                    StackStats::incr(&stats.tcp_segments_dropped);
                    log::trace!("[STACK] no TCP handler, dropping SYN {}", flow);
                    return;
                }
                let segment = TcpSegment {
                    flow,
                    syn,
                    packet: data.to_vec(),
                };
                if self.inner.tcp_segments.try_send(segment).is_err() {
                    StackStats::incr(&stats.tcp_segments_dropped);
                    log::trace!("[STACK] TCP queue full, dropping segment {}", flow);
                }
            }
            Ok(Inbound::Other(proto)) => {
                StackStats::incr(&stats.dropped_packets);
                log::trace!("[STACK] dropping packet with protocol {}", proto);
            }
            Err(e) => {
                StackStats::incr(&stats.malformed_packets);
                log::trace!("[STACK] {}", e);
            }
        }
    }
}

impl DatagramWriter for StackHandle {
    fn write_udp(&self, from: SocketAddr, to: SocketAddr, payload: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.inner.replies.write_udp(from, to, payload)
    }
}

/// A running stack bound to one device
pub struct Stack {
    handle: StackHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl Stack {
    /// Build the stack and start its inbound, outbound and TCP tasks
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(device: Arc<dyn Device>, options: StackOptions) -> Result<Self> {
        options.validate()?;

        log::info!(
            "[STACK] starting on {} ({}), mtu {}, tcp auto-tuning {}, tcp sndbuf {:?}, tcp rcvbuf {:?}",
            device.name(),
            device.kind(),
            device.mtu(),
            options.tcp_moderate_receive_buffer,
            options.tcp_send_buffer_size,
            options.tcp_receive_buffer_size,
        );

        let stats = Arc::new(StackStats::default());
        let (reply_tx, reply_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (segment_tx, segment_rx) = mpsc::channel(tcp::SEGMENT_QUEUE);
        let (shutdown_tx, _) = broadcast::channel(1);

        let handle = StackHandle {
            inner: Arc::new(Inner {
                options,
                endpoints: Mutex::new(HashMap::new()),
                udp_handler: RwLock::new(None),
                tcp_handler: RwLock::new(None),
                tcp_segments: segment_tx,
                replies: Arc::new(ReplySink {
                    tx: reply_tx,
                    stats: stats.clone(),
                }),
                stats,
                shutdown_tx: shutdown_tx.clone(),
                closed: AtomicBool::new(false),
            }),
        };

        let inbound = tokio::spawn(inbound_loop(
            device.clone(),
            handle.clone(),
            shutdown_tx.subscribe(),
        ));
        let tcp = tokio::spawn(tcp::tcp_loop(
            handle.clone(),
            device.mtu() as usize,
            segment_rx,
            shutdown_tx.subscribe(),
        ));
        let outbound = tokio::spawn(outbound_loop(
            device,
            reply_rx,
            handle.inner.stats.clone(),
            shutdown_tx.subscribe(),
        ));

        Ok(Self {
            handle,
            tasks: vec![inbound, tcp, outbound],
        })
    }

    /// Get a handle to the stack
    pub fn handle(&self) -> StackHandle {
        self.handle.clone()
    }

    /// Signal the tasks to stop and release all endpoints
    pub fn close(&self) {
        self.handle.close();
    }

    /// Wait for the stack tasks to finish
    pub async fn wait(&mut self) {
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                log::warn!("[STACK] task ended abnormally: {}", e);
            }
        }
        log::info!("[STACK] stopped");
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.handle.close();
    }
}

async fn inbound_loop(
    device: Arc<dyn Device>,
    handle: StackHandle,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        let n = tokio::select! {
            _ = shutdown_rx.recv() => break,
            res = device.recv(&mut buf) => match res {
                Ok(0) => continue,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                    log::debug!("[STACK] device closed");
                    break;
                }
                Err(e) => {
                    if !handle.is_closed() {
                        log::error!("[STACK] device read error: {}", e);
                    }
                    break;
                }
            },
        };
        handle.dispatch(&buf[..n]);
    }
    log::debug!("[STACK] inbound task finished");
}

async fn outbound_loop(
    device: Arc<dyn Device>,
    mut reply_rx: mpsc::Receiver<Vec<u8>>,
    stats: Arc<StackStats>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        let packet = tokio::select! {
            _ = shutdown_rx.recv() => break,
            packet = reply_rx.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };
        match device.send(&packet).await {
            Ok(n) => {
                StackStats::incr(&stats.packets_out);
                StackStats::add(&stats.bytes_out, n);
            }
            Err(e) => {
                StackStats::incr(&stats.dropped_packets);
                log::warn!("[STACK] device write error: {}", e);
            }
        }
    }
    log::debug!("[STACK] outbound task finished");
}
