//! Per-flow relaying
//!
//! Every new flow accepted by the stack gets its own task. A UDP task asks
//! the proxy for a relay and copies datagrams both ways until the flow has
//! been idle for the UDP timeout or either side goes away. A TCP task dials
//! through the proxy and copies bytes both ways, passing each half-close on
//! to the other side.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use sox_dns::NameRecordCache;
use sox_stack::{ConnHandler, FlowId, TcpConn, UdpConn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;

use crate::error::Result;
use crate::proxy::{Metadata, Proxy};

/// Largest datagram read back from a relay
const RELAY_BUFFER_SIZE: usize = 65535;

/// Read size for the proxy side of a TCP relay
const TCP_READ_SIZE: usize = 16 * 1024;

/// Dispatches accepted flows to relay tasks
pub struct Tunnel {
    proxy: Arc<dyn Proxy>,
    names: RwLock<Option<Arc<NameRecordCache>>>,
    udp_timeout: Duration,
    active: Arc<AtomicUsize>,
    tcp_active: Arc<AtomicUsize>,
}

impl Tunnel {
    pub fn new(proxy: Arc<dyn Proxy>, udp_timeout: Duration) -> Self {
        Self {
            proxy,
            names: RwLock::new(None),
            udp_timeout,
            active: Arc::new(AtomicUsize::new(0)),
            tcp_active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Use `cache` to turn fake-IP destinations back into domain names
    pub fn set_name_cache(&self, cache: Option<Arc<NameRecordCache>>) {
        *self.names.write() = cache;
    }

    pub fn udp_timeout(&self) -> Duration {
        self.udp_timeout
    }

    /// Number of UDP relay tasks currently running
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Number of TCP relay tasks currently running
    pub fn tcp_sessions(&self) -> usize {
        self.tcp_active.load(Ordering::Relaxed)
    }

    /// Describe a flow for the proxy
    pub fn metadata(&self, flow: &FlowId) -> Metadata {
        let host = self
            .names
            .read()
            .as_ref()
            .and_then(|cache| cache.lookup_name(flow.local_addr));

        Metadata {
            src: flow.remote(),
            dst: flow.local(),
            host,
        }
    }
}

impl ConnHandler for Tunnel {
    fn handle_udp(&self, conn: UdpConn) {
        let metadata = self.metadata(&conn.id());
        let proxy = self.proxy.clone();
        let timeout = self.udp_timeout;
        let active = self.active.clone();

        active.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            let description = format!("{} -> {}", metadata.src, metadata.destination());
            match relay(conn, proxy, metadata, timeout).await {
                Ok(()) => log::debug!("[UDP] {} closed", description),
                Err(e) => log::warn!("[UDP] {}: {}", description, e),
            }
            active.fetch_sub(1, Ordering::Relaxed);
        });
    }

    fn handle_tcp(&self, conn: TcpConn) {
        let metadata = self.metadata(&conn.id());
        let proxy = self.proxy.clone();
        let active = self.tcp_active.clone();

        active.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            let description = format!("{} -> {}", metadata.src, metadata.destination());
            match relay_tcp(conn, proxy, metadata).await {
                Ok(()) => log::debug!("[TCP] {} closed", description),
                Err(e) => log::warn!("[TCP] {}: {}", description, e),
            }
            active.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

async fn relay_tcp(mut conn: TcpConn, proxy: Arc<dyn Proxy>, metadata: Metadata) -> Result<()> {
    let stream = proxy.dial_tcp(&metadata).await?;
    log::info!(
        "[TCP] {} <-> {} via {}",
        metadata.src,
        metadata.destination(),
        proxy.proto()
    );

    let (mut reader, mut writer) = stream.into_split();
    let mut buf = vec![0u8; TCP_READ_SIZE];
    let mut client_open = true;
    let mut remote_open = true;

    while client_open || remote_open {
        tokio::select! {
            chunk = conn.recv(), if client_open => match chunk {
                Some(chunk) => writer.write_all(&chunk).await?,
                None => {
                    client_open = false;
                    writer.shutdown().await?;
                }
            },
            read = reader.read(&mut buf), if remote_open => {
                let n = read?;
                if n == 0 {
                    remote_open = false;
                    conn.shutdown();
                } else {
                    conn.send(&buf[..n]).await?;
                }
            }
        }
    }

    Ok(())
}

async fn relay(
    mut conn: UdpConn,
    proxy: Arc<dyn Proxy>,
    metadata: Metadata,
    timeout: Duration,
) -> Result<()> {
    let remote = proxy.dial_udp(&metadata).await?;
    log::info!(
        "[UDP] {} <-> {} via {}",
        metadata.src,
        metadata.destination(),
        proxy.proto()
    );

    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let idle = tokio::time::sleep(timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            datagram = conn.recv() => {
                let Some(datagram) = datagram else { break };
                remote.send(&datagram).await?;
                idle.as_mut().reset(Instant::now() + timeout);
            }
            received = remote.recv(&mut buf) => {
                let n = received?;
                conn.send(&buf[..n]).await?;
                idle.as_mut().reset(Instant::now() + timeout);
            }
            _ = &mut idle => {
                log::debug!("[UDP] {} idle for {:?}", metadata.destination(), timeout);
                break;
            }
        }
    }

    Ok(())
}
