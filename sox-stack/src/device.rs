//! Packet device abstraction
//!
//! The stack reads and writes whole IP packets through a [`Device`]. The TUN
//! implementation lives in the engine (it wraps `sox-tun`); [`MemoryDevice`]
//! is a channel-backed device used by tests and embedders that already have
//! packets in memory.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify};

/// One-shot close flag that wakes every pending waiter
///
/// Devices use it to fail reads that are blocked when `close` is called.
#[derive(Debug, Default)]
pub struct CloseSignal {
    closed: AtomicBool,
    notify: Notify,
}

impl CloseSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag; returns `false` if it was already set
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.notify.notify_waiters();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolve once [`CloseSignal::close`] has been called
    pub async fn closed(&self) {
        // Register before checking the flag so a concurrent close is not lost
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }
}

/// A source and sink of raw IP packets
#[async_trait]
pub trait Device: Send + Sync {
    /// Read one packet into `buf`, returning its length
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one packet
    async fn send(&self, packet: &[u8]) -> io::Result<usize>;

    /// Interface name
    fn name(&self) -> &str;

    /// Driver name (`tun`, `fd`, `memory`)
    fn kind(&self) -> &str;

    /// Maximum transmission unit
    fn mtu(&self) -> u32;

    /// Close the device; pending and later reads fail
    fn close(&self) -> io::Result<()>;
}

/// In-memory device backed by channels
pub struct MemoryDevice {
    name: String,
    mtu: u32,
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    outbound: mpsc::Sender<Vec<u8>>,
    closed: CloseSignal,
}

/// The far side of a [`MemoryDevice`]
pub struct MemoryDeviceHandle {
    /// Packets injected here are read by the stack
    pub inject: mpsc::Sender<Vec<u8>>,
    /// Packets written by the stack arrive here
    pub written: mpsc::Receiver<Vec<u8>>,
}

impl MemoryDevice {
    /// Create a device and the handle used to drive it
    pub fn new(name: impl Into<String>, mtu: u32, capacity: usize) -> (Self, MemoryDeviceHandle) {
        let (inject, inbound) = mpsc::channel(capacity);
        let (outbound, written) = mpsc::channel(capacity);
        let device = Self {
            name: name.into(),
            mtu,
            inbound: Mutex::new(inbound),
            outbound,
            closed: CloseSignal::new(),
        };
        (device, MemoryDeviceHandle { inject, written })
    }

    /// Whether [`Device::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    fn closed_error() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, "device closed")
    }
}

#[async_trait]
impl Device for MemoryDevice {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let packet = tokio::select! {
            biased;
            _ = self.closed.closed() => None,
            packet = async { self.inbound.lock().await.recv().await } => packet,
        };
        let packet = packet.ok_or_else(Self::closed_error)?;
        let len = packet.len().min(buf.len());
        buf[..len].copy_from_slice(&packet[..len]);
        Ok(len)
    }

    async fn send(&self, packet: &[u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(Self::closed_error());
        }
        self.outbound
            .send(packet.to_vec())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "device peer dropped"))?;
        Ok(packet.len())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "memory"
    }

    fn mtu(&self) -> u32 {
        self.mtu
    }

    fn close(&self) -> io::Result<()> {
        self.closed.close();
        Ok(())
    }
}
