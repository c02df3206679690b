//! Upstream resolver exchange for queries that are not answered locally
//!
//! Queries are forwarded byte-for-byte over UDP by a small pool of worker
//! tasks. Submission never blocks: when the queue is full the query is
//! dropped and the client retries.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use sox_stack::DatagramWriter;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Resolver used when neither an override nor a system resolver is known
pub const FALLBACK_UPSTREAM: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53);

/// Maximum size of a UDP DNS response we accept
const MAX_UDP_RESPONSE_SIZE: usize = 4096;

/// First nameserver from the system resolver configuration
pub fn system_upstream() -> Option<SocketAddr> {
    match hickory_resolver::system_conf::read_system_conf() {
        Ok((config, _)) => config.name_servers().first().map(|ns| ns.socket_addr),
        Err(e) => {
            log::debug!("[DNS] cannot read system resolver configuration: {}", e);
            None
        }
    }
}

/// Pick the upstream: explicit override, then the system resolver, then the fallback
pub fn select_upstream(override_addr: Option<SocketAddr>) -> SocketAddr {
    override_addr
        .or_else(system_upstream)
        .unwrap_or(FALLBACK_UPSTREAM)
}

/// Opens the socket an upstream query is sent from
///
/// Called with the upstream address once per exchange. Callers that must
/// keep resolver traffic off the tunnel supply one that binds to the
/// physical interface.
pub type SocketBinder = Arc<dyn Fn(SocketAddr) -> io::Result<UdpSocket> + Send + Sync>;

/// Bind an unspecified local address of the same family as `target`
pub fn bind_unspecified(target: SocketAddr) -> io::Result<UdpSocket> {
    let local = if target.is_ipv6() {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    };
    let socket = std::net::UdpSocket::bind(local)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket)
}

/// Send one query to `addr` over UDP and wait for the response
pub async fn exchange(addr: SocketAddr, query: &[u8], timeout: Duration) -> Result<Vec<u8>> {
    let socket = bind_unspecified(addr)
        .map_err(|e| Error::Dns(format!("failed to bind UDP socket: {}", e)))?;
    exchange_on(socket, addr, query, timeout).await
}

/// Like [`exchange`], over a socket the caller opened
pub async fn exchange_on(
    socket: UdpSocket,
    addr: SocketAddr,
    query: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>> {
    socket
        .connect(addr)
        .await
        .map_err(|e| Error::Dns(format!("failed to connect to {}: {}", addr, e)))?;
    socket
        .send(query)
        .await
        .map_err(|e| Error::Dns(format!("failed to send DNS query: {}", e)))?;

    let mut buf = vec![0u8; MAX_UDP_RESPONSE_SIZE];
    match tokio::time::timeout(timeout, socket.recv(&mut buf)).await {
        Ok(Ok(len)) => {
            buf.truncate(len);
            Ok(buf)
        }
        Ok(Err(e)) => Err(Error::Dns(format!("failed to receive DNS response: {}", e))),
        Err(_) => Err(Error::Dns(format!("DNS query to {} timed out", addr))),
    }
}

/// Worker pool settings
#[derive(Debug, Clone)]
pub struct ExchangerOptions {
    /// Number of concurrent exchanges
    pub workers: usize,
    /// Queries waiting for a worker before new ones are dropped
    pub queue_depth: usize,
    /// Per-query response timeout
    pub timeout: Duration,
}

impl Default for ExchangerOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_depth: 128,
            timeout: Duration::from_secs(5),
        }
    }
}

/// A query waiting to be forwarded
pub struct ExchangeJob {
    /// Raw query bytes, forwarded unchanged
    pub query: Vec<u8>,
    /// Address the client sent the query to; replies come from here
    pub server: SocketAddr,
    /// The querying client
    pub client: SocketAddr,
    /// Where to write the response
    pub replies: Arc<dyn DatagramWriter>,
}

/// Bounded pool of upstream exchange workers
pub struct UpstreamExchanger {
    upstream: SocketAddr,
    tx: mpsc::Sender<ExchangeJob>,
    workers: Vec<JoinHandle<()>>,
}

impl UpstreamExchanger {
    /// Spawn the workers; must be called within a tokio runtime
    pub fn new(upstream: SocketAddr, options: ExchangerOptions) -> Self {
        Self::with_binder(upstream, options, Arc::new(bind_unspecified))
    }

    /// Like [`UpstreamExchanger::new`], opening every query socket with `binder`
    pub fn with_binder(
        upstream: SocketAddr,
        options: ExchangerOptions,
        binder: SocketBinder,
    ) -> Self {
        let (tx, rx) = mpsc::channel(options.queue_depth.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..options.workers.max(1))
            .map(|_| {
                let rx = rx.clone();
                let binder = binder.clone();
                let timeout = options.timeout;
                tokio::spawn(async move {
                    loop {
                        let job = { rx.lock().await.recv().await };
                        let Some(job) = job else { break };
                        forward(upstream, &binder, job, timeout).await;
                    }
                })
            })
            .collect();

        log::debug!("[DNS] upstream exchanger using {}", upstream);
        Self {
            upstream,
            tx,
            workers,
        }
    }

    /// The resolver queries are forwarded to
    pub fn upstream(&self) -> SocketAddr {
        self.upstream
    }

    /// Queue a job; returns `false` if it was dropped
    pub fn submit(&self, job: ExchangeJob) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("[DNS] upstream queue full, dropping query");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

impl Drop for UpstreamExchanger {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

async fn forward(
    upstream: SocketAddr,
    binder: &SocketBinder,
    job: ExchangeJob,
    timeout: Duration,
) {
    let socket = match binder(upstream) {
        Ok(socket) => socket,
        Err(e) => {
            log::debug!("[DNS] cannot open socket toward {}: {}", upstream, e);
            return;
        }
    };
    match exchange_on(socket, upstream, &job.query, timeout).await {
        Ok(response) => {
            if let Err(e) = job.replies.write_udp(job.server, job.client, &response) {
                log::debug!("[DNS] cannot deliver upstream response to {}: {}", job.client, e);
            }
        }
        Err(e) => log::debug!("[DNS] upstream exchange for {} failed: {}", job.client, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exchange_roundtrip() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            let mut reply = buf[..n].to_vec();
            reply.push(0xff);
            server.send_to(&reply, peer).await.unwrap();
        });

        let response = exchange(addr, &[1, 2, 3], Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(response, vec![1, 2, 3, 0xff]);
    }

    #[tokio::test]
    async fn test_exchange_timeout() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();

        let err = exchange(addr, &[0], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_exchanger_opens_sockets_with_binder() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Collect(parking_lot::Mutex<Vec<Vec<u8>>>);
        impl DatagramWriter for Collect {
            fn write_udp(
                &self,
                _from: SocketAddr,
                _to: SocketAddr,
                payload: &[u8],
            ) -> sox_stack::Result<()> {
                self.0.lock().push(payload.to_vec());
                Ok(())
            }
        }

        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((n, peer)) = server.recv_from(&mut buf).await {
                let _ = server.send_to(&buf[..n], peer).await;
            }
        });

        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let binder: SocketBinder = Arc::new(move |target| {
            counted.fetch_add(1, Ordering::SeqCst);
            bind_unspecified(target)
        });
        let exchanger = UpstreamExchanger::with_binder(addr, ExchangerOptions::default(), binder);

        let collect = Arc::new(Collect(parking_lot::Mutex::new(Vec::new())));
        let replies: Arc<dyn DatagramWriter> = collect.clone();
        assert!(exchanger.submit(ExchangeJob {
            query: vec![7, 7, 7],
            server: "10.0.0.1:53".parse().unwrap(),
            client: "10.0.0.2:40000".parse().unwrap(),
            replies,
        }));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while collect.0.lock().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "no response delivered");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(collect.0.lock()[0], vec![7, 7, 7]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_select_upstream_prefers_override() {
        let addr: SocketAddr = "9.9.9.9:53".parse().unwrap();
        assert_eq!(select_upstream(Some(addr)), addr);
    }
}
