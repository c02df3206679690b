//! Proxy targets
//!
//! A proxy is given as `protocol://[user[:pass]@]host[:port]`. A target with
//! no `://` is taken as a SOCKS5 address. `direct` dials TCP and UDP itself
//! and `socks5` tunnels both through the proxy server. The other remote protocols are
//! parsed and validated so configurations written for them load and report
//! cleanly.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpStream, UdpSocket};
use url::Url;

use crate::dialer::Dialer;
use crate::error::{Error, Result};
use crate::socks5::Socks5Proxy;

/// Proxy protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    Direct,
    Reject,
    Http,
    Socks4,
    Socks5,
    Shadowsocks,
}

impl Proto {
    /// Scheme used in proxy URLs
    pub fn as_str(&self) -> &'static str {
        match self {
            Proto::Direct => "direct",
            Proto::Reject => "reject",
            Proto::Http => "http",
            Proto::Socks4 => "socks4",
            Proto::Socks5 => "socks5",
            Proto::Shadowsocks => "ss",
        }
    }

    /// Whether the protocol can carry a domain name to the far side
    ///
    /// Fake-IP answers are only useful when the proxy resolves the name.
    pub fn supports_remote_dns(&self) -> bool {
        matches!(
            self,
            Proto::Http | Proto::Socks4 | Proto::Socks5 | Proto::Shadowsocks
        )
    }

    fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "direct" => Some(Proto::Direct),
            "reject" => Some(Proto::Reject),
            "http" => Some(Proto::Http),
            "socks4" => Some(Proto::Socks4),
            "socks5" => Some(Proto::Socks5),
            "ss" => Some(Proto::Shadowsocks),
            _ => None,
        }
    }
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the tunnel knows about a flow when it asks for a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// The client on the device side
    pub src: SocketAddr,
    /// Destination as seen on the device
    pub dst: SocketAddr,
    /// Domain recovered from a fake-IP destination
    pub host: Option<String>,
}

impl Metadata {
    /// `host:port` when a domain is known, otherwise the destination address
    pub fn destination(&self) -> String {
        match self.host {
            Some(ref host) => format!("{}:{}", host, self.dst.port()),
            None => self.dst.to_string(),
        }
    }
}

/// A connected datagram relay to one destination
#[async_trait]
pub trait UdpRelay: Send + Sync {
    async fn send(&self, payload: &[u8]) -> io::Result<usize>;
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Outbound connection provider
#[async_trait]
pub trait Proxy: Send + Sync {
    fn proto(&self) -> Proto;

    /// Proxy server address, empty for `direct` and `reject`
    fn addr(&self) -> &str;

    async fn dial_tcp(&self, metadata: &Metadata) -> Result<TcpStream>;

    async fn dial_udp(&self, metadata: &Metadata) -> Result<Box<dyn UdpRelay>>;
}

/// Parse a proxy target
pub fn parse_proxy(target: &str, dialer: Dialer) -> Result<Arc<dyn Proxy>> {
    let target = target.trim();
    if target.is_empty() {
        return Err(Error::Proxy("empty proxy".into()));
    }

    let owned;
    let target = if target.contains("://") {
        target
    } else {
        owned = format!("socks5://{}", target);
        owned.as_str()
    };

    let url = Url::parse(target)
        .map_err(|e| Error::Proxy(format!("invalid proxy '{}': {}", target, e)))?;
    let proto = Proto::from_scheme(url.scheme())
        .ok_or_else(|| Error::Proxy(format!("unsupported protocol: {}", url.scheme())))?;

    match proto {
        Proto::Direct => Ok(Arc::new(DirectProxy { dialer })),
        Proto::Reject => Ok(Arc::new(RejectProxy)),
        _ => {
            let host = url
                .host_str()
                .filter(|h| !h.is_empty())
                .ok_or_else(|| Error::Proxy(format!("{} proxy requires a host", proto)))?;
            let port = url
                .port_or_known_default()
                .ok_or_else(|| Error::Proxy(format!("{} proxy requires a port", proto)))?;

            if proto == Proto::Shadowsocks {
                let method = url.username();
                let password = url.password().unwrap_or_default();
                if method.is_empty() || password.is_empty() {
                    return Err(Error::Proxy(
                        "ss proxy requires method:password credentials".into(),
                    ));
                }
            }

            let addr = format!("{}:{}", host, port);
            if proto == Proto::Socks5 {
                let mut proxy = Socks5Proxy::new(addr, dialer);
                if !url.username().is_empty() {
                    proxy = proxy.with_auth(url.username(), url.password().unwrap_or_default());
                }
                return Ok(Arc::new(proxy));
            }

            Ok(Arc::new(RemoteProxy {
                proto,
                addr,
            }))
        }
    }
}

/// Connects straight to the destination
pub struct DirectProxy {
    dialer: Dialer,
}

struct DirectRelay {
    socket: UdpSocket,
}

#[async_trait]
impl UdpRelay for DirectRelay {
    async fn send(&self, payload: &[u8]) -> io::Result<usize> {
        self.socket.send(payload).await
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf).await
    }
}

#[async_trait]
impl Proxy for DirectProxy {
    fn proto(&self) -> Proto {
        Proto::Direct
    }

    fn addr(&self) -> &str {
        ""
    }

    /// Always dials the destination seen on the device; a recovered host
    /// name is never resolved locally.
    async fn dial_tcp(&self, metadata: &Metadata) -> Result<TcpStream> {
        self.dialer.connect_tcp(metadata.dst).await
    }

    async fn dial_udp(&self, metadata: &Metadata) -> Result<Box<dyn UdpRelay>> {
        let socket = self.dialer.bind_udp(metadata.dst)?;
        socket.connect(metadata.dst).await?;
        Ok(Box::new(DirectRelay { socket }))
    }
}

/// Refuses every connection
pub struct RejectProxy;

#[async_trait]
impl Proxy for RejectProxy {
    fn proto(&self) -> Proto {
        Proto::Reject
    }

    fn addr(&self) -> &str {
        ""
    }

    async fn dial_tcp(&self, metadata: &Metadata) -> Result<TcpStream> {
        Err(Error::Proxy(format!(
            "connection to {} rejected",
            metadata.destination()
        )))
    }

    async fn dial_udp(&self, metadata: &Metadata) -> Result<Box<dyn UdpRelay>> {
        Err(Error::Proxy(format!(
            "connection to {} rejected",
            metadata.destination()
        )))
    }
}

/// A proxy server target whose wire protocol is not implemented
pub struct RemoteProxy {
    proto: Proto,
    addr: String,
}

#[async_trait]
impl Proxy for RemoteProxy {
    fn proto(&self) -> Proto {
        self.proto
    }

    fn addr(&self) -> &str {
        &self.addr
    }

    async fn dial_tcp(&self, _metadata: &Metadata) -> Result<TcpStream> {
        Err(Error::Proxy(format!(
            "{} connections via {} are not supported",
            self.proto, self.addr
        )))
    }

    async fn dial_udp(&self, _metadata: &Metadata) -> Result<Box<dyn UdpRelay>> {
        Err(Error::Proxy(format!(
            "{} UDP relay via {} is not supported",
            self.proto, self.addr
        )))
    }
}
