//! Outbound socket setup
//!
//! Sockets opened toward the network must not loop back into the TUN
//! device. They are pinned to a physical interface and/or tagged with a
//! routing mark so policy routing can steer them around the tunnel.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, TcpKeepalive, Type};
use sox_dns::SocketBinder;
use tokio::net::{TcpSocket, TcpStream, UdpSocket};

use crate::error::{Error, Result};

/// How long an outbound TCP connect may take
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Socket options applied to every outbound connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dialer {
    interface: Option<String>,
    index: u32,
    fwmark: u32,
}

impl Dialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind outbound sockets to the named interface
    ///
    /// Fails if no interface with that name exists.
    pub fn with_interface(mut self, name: &str) -> Result<Self> {
        self.index = interface_index(name)?;
        self.interface = Some(name.to_string());
        Ok(self)
    }

    /// Tag outbound sockets with a routing mark (Linux only)
    pub fn with_fwmark(mut self, mark: u32) -> Self {
        self.fwmark = mark;
        self
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    pub fn interface_index(&self) -> u32 {
        self.index
    }

    pub fn fwmark(&self) -> u32 {
        self.fwmark
    }

    /// Open a UDP socket suitable for reaching `target`
    pub fn bind_udp(&self, target: SocketAddr) -> Result<UdpSocket> {
        let (domain, local) = if target.is_ipv4() {
            (
                Domain::IPV4,
                SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
            )
        } else {
            (
                Domain::IPV6,
                SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0),
            )
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        self.apply(&socket, target.is_ipv4())?;
        socket.set_nonblocking(true)?;
        socket.bind(&SockAddr::from(local))?;

        let std_socket: std::net::UdpSocket = socket.into();
        Ok(UdpSocket::from_std(std_socket)?)
    }

    /// Open a TCP connection to `target`
    pub async fn connect_tcp(&self, target: SocketAddr) -> Result<TcpStream> {
        let domain = if target.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        self.apply(&socket, target.is_ipv4())?;
        socket.set_nonblocking(true)?;
        let keepalive = TcpKeepalive::new()
            .with_time(Duration::from_secs(60))
            .with_interval(Duration::from_secs(15));
        socket.set_tcp_keepalive(&keepalive)?;

        let std_stream: std::net::TcpStream = socket.into();
        let socket = TcpSocket::from_std_stream(std_stream);
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, socket.connect(target))
            .await
            .map_err(|_| Error::Proxy(format!("connect to {} timed out", target)))??;

        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("[DIALER] TCP_NODELAY on {}: {}", target, e);
        }
        Ok(stream)
    }

    /// Socket factory for upstream DNS exchanges, with this dialer's settings
    pub fn udp_binder(&self) -> SocketBinder {
        let dialer = self.clone();
        Arc::new(move |target| {
            dialer.bind_udp(target).map_err(|e| match e {
                Error::Io(e) => e,
                other => io::Error::new(io::ErrorKind::Other, other.to_string()),
            })
        })
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn apply(&self, socket: &Socket, _ipv4: bool) -> Result<()> {
        if let Some(ref name) = self.interface {
            socket
                .bind_device(Some(name.as_bytes()))
                .map_err(|e| Error::Setup(format!("bind to {}: {}", name, e)))?;
        }
        if self.fwmark != 0 {
            socket
                .set_mark(self.fwmark)
                .map_err(|e| Error::Setup(format!("set fwmark {:#x}: {}", self.fwmark, e)))?;
        }
        Ok(())
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    fn apply(&self, socket: &Socket, ipv4: bool) -> Result<()> {
        let Some(index) = std::num::NonZeroU32::new(self.index) else {
            return Ok(());
        };
        let bound = if ipv4 {
            socket.bind_device_by_index_v4(Some(index))
        } else {
            socket.bind_device_by_index_v6(Some(index))
        };
        bound.map_err(|e| Error::Setup(format!("bind to interface #{}: {}", index, e)))
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios"
    )))]
    fn apply(&self, _socket: &Socket, _ipv4: bool) -> Result<()> {
        if self.interface.is_some() {
            log::warn!("[DIALER] interface binding is not supported on this platform");
        }
        Ok(())
    }
}

#[cfg(unix)]
fn interface_index(name: &str) -> Result<u32> {
    nix::net::if_::if_nametoindex(name)
        .map_err(|e| Error::Setup(format!("interface {}: {}", name, e)))
}

#[cfg(not(unix))]
fn interface_index(name: &str) -> Result<u32> {
    Err(Error::Setup(format!(
        "interface {}: lookup is not supported on this platform",
        name
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_interface_fails() {
        let err = Dialer::new()
            .with_interface("tunsox-missing0")
            .unwrap_err();
        assert!(matches!(err, Error::Setup(_)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_loopback_interface_index() {
        let dialer = Dialer::new().with_interface("lo").unwrap();
        assert_eq!(dialer.interface(), Some("lo"));
        assert!(dialer.interface_index() > 0);
    }

    #[test]
    fn test_fwmark() {
        let dialer = Dialer::new().with_fwmark(0x1234);
        assert_eq!(dialer.fwmark(), 0x1234);
        assert_eq!(dialer.interface(), None);
    }

    #[tokio::test]
    async fn test_bind_udp_plain() {
        let socket = Dialer::new()
            .bind_udp("127.0.0.1:53".parse().unwrap())
            .unwrap();
        assert!(socket.local_addr().unwrap().is_ipv4());
    }

    #[tokio::test]
    async fn test_connect_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();

        let stream = Dialer::new().connect_tcp(target).await.unwrap();
        let (_, peer) = listener.accept().await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), target);
        assert_eq!(stream.local_addr().unwrap(), peer);
    }

    #[tokio::test]
    async fn test_connect_tcp_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let target = listener.local_addr().unwrap();
        drop(listener);

        assert!(Dialer::new().connect_tcp(target).await.is_err());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_connect_tcp_applies_interface() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();

        let dialer = Dialer::new().with_interface("lo").unwrap();
        let stream = dialer.connect_tcp(target).await.unwrap();
        let device = socket2::SockRef::from(&stream).device().unwrap();
        assert_eq!(device.as_deref(), Some(&b"lo"[..]));
    }

    #[tokio::test]
    async fn test_udp_binder_opens_socket() {
        let binder = Dialer::new().udp_binder();
        let socket = binder("127.0.0.1:53".parse().unwrap()).unwrap();
        assert!(socket.local_addr().unwrap().is_ipv4());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_udp_binder_applies_interface() {
        let binder = Dialer::new().with_interface("lo").unwrap().udp_binder();
        let socket = binder("127.0.0.1:53".parse().unwrap()).unwrap();
        let device = socket2::SockRef::from(&socket).device().unwrap();
        assert_eq!(device.as_deref(), Some(&b"lo"[..]));
    }
}
