//! SOCKS5 client (RFC 1928, RFC 1929)
//!
//! TCP flows use CONNECT and UDP flows use UDP ASSOCIATE. When the tunnel
//! knows the domain behind a fake-IP destination, the request or datagram
//! header carries the name so the proxy resolves it.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use crate::dialer::Dialer;
use crate::error::{Error, Result};
use crate::proxy::{Metadata, Proto, Proxy, UdpRelay};

pub const SOCKS5_VERSION: u8 = 0x05;

pub const AUTH_METHOD_NONE: u8 = 0x00;
pub const AUTH_METHOD_PASSWORD: u8 = 0x02;
pub const AUTH_METHOD_NO_ACCEPTABLE: u8 = 0xFF;
pub const AUTH_PASSWORD_VERSION: u8 = 0x01;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REPLY_SUCCEEDED: u8 = 0x00;

/// Time allowed for method selection, auth and the command reply
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Room for the largest UDP request header (domain of 255 bytes)
const UDP_HEADER_MAX: usize = 3 + 1 + 1 + 255 + 2;

/// Human-readable reply code
pub fn reply_message(code: u8) -> &'static str {
    match code {
        0x00 => "succeeded",
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

/// Where a request points
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    /// The domain when one is known, otherwise the device-side address
    pub fn from_metadata(metadata: &Metadata) -> Self {
        match metadata.host {
            Some(ref host) => TargetAddr::Domain(host.clone(), metadata.dst.port()),
            None => TargetAddr::Ip(metadata.dst),
        }
    }

    /// Append `ATYP DST.ADDR DST.PORT`
    pub fn write_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        let port = match self {
            TargetAddr::Ip(addr) => {
                match addr.ip() {
                    IpAddr::V4(ip) => {
                        buf.push(ATYP_IPV4);
                        buf.extend_from_slice(&ip.octets());
                    }
                    IpAddr::V6(ip) => {
                        buf.push(ATYP_IPV6);
                        buf.extend_from_slice(&ip.octets());
                    }
                }
                addr.port()
            }
            TargetAddr::Domain(host, port) => {
                let len = u8::try_from(host.len())
                    .ok()
                    .filter(|len| *len > 0)
                    .ok_or_else(|| Error::Proxy(format!("invalid SOCKS5 domain '{}'", host)))?;
                buf.push(ATYP_DOMAIN);
                buf.push(len);
                buf.extend_from_slice(host.as_bytes());
                *port
            }
        };
        buf.extend_from_slice(&port.to_be_bytes());
        Ok(())
    }
}

/// Encode `VER CMD RSV ATYP DST.ADDR DST.PORT`
pub fn build_request(command: u8, target: &TargetAddr) -> Result<Vec<u8>> {
    let mut request = Vec::with_capacity(22);
    request.extend_from_slice(&[SOCKS5_VERSION, command, 0x00]);
    target.write_to(&mut request)?;
    Ok(request)
}

/// Encode the `RSV FRAG ATYP DST.ADDR DST.PORT` header of a relayed datagram
pub fn udp_header(target: &TargetAddr) -> Result<Vec<u8>> {
    let mut header = vec![0x00, 0x00, 0x00];
    target.write_to(&mut header)?;
    Ok(header)
}

/// Payload of a relayed datagram
///
/// Fragments and malformed headers are rejected.
pub fn udp_payload(datagram: &[u8]) -> Result<&[u8]> {
    if datagram.len() < 4 {
        return Err(Error::Proxy("SOCKS5 datagram too short".into()));
    }
    if datagram[0] != 0 || datagram[1] != 0 {
        return Err(Error::Proxy("SOCKS5 datagram RSV must be zero".into()));
    }
    if datagram[2] != 0 {
        return Err(Error::Proxy(format!(
            "SOCKS5 datagram fragment {} dropped",
            datagram[2]
        )));
    }
    let addr_len = match datagram[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => 1 + *datagram.get(4).unwrap_or(&0) as usize,
        other => {
            return Err(Error::Proxy(format!(
                "invalid SOCKS5 address type {:#04x}",
                other
            )))
        }
    };
    let offset = 4 + addr_len + 2;
    datagram
        .get(offset..)
        .ok_or_else(|| Error::Proxy("SOCKS5 datagram too short".into()))
}

/// Connects through a SOCKS5 server
pub struct Socks5Proxy {
    addr: String,
    auth: Option<(String, String)>,
    dialer: Dialer,
}

impl Socks5Proxy {
    pub fn new(addr: impl Into<String>, dialer: Dialer) -> Self {
        Self {
            addr: addr.into(),
            auth: None,
            dialer,
        }
    }

    /// Authenticate with username and password
    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some((username.into(), password.into()));
        self
    }

    async fn server(&self) -> Result<SocketAddr> {
        tokio::net::lookup_host(self.addr.as_str())
            .await?
            .next()
            .ok_or_else(|| Error::Proxy(format!("cannot resolve proxy {}", self.addr)))
    }

    /// Connect to the server and run one command; returns the control stream
    /// and the bound address from the reply
    async fn command(
        &self,
        command: u8,
        target: &TargetAddr,
    ) -> Result<(TcpStream, Option<SocketAddr>)> {
        let server = self.server().await?;
        let mut stream = self.dialer.connect_tcp(server).await?;

        let bound = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            self.handshake(&mut stream, command, target),
        )
        .await
        .map_err(|_| {
            Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("SOCKS5 handshake with {} timed out", self.addr),
            ))
        })??;
        Ok((stream, bound))
    }

    async fn handshake(
        &self,
        stream: &mut TcpStream,
        command: u8,
        target: &TargetAddr,
    ) -> Result<Option<SocketAddr>> {
        self.negotiate(stream).await?;
        stream.write_all(&build_request(command, target)?).await?;
        read_reply(stream).await
    }

    async fn negotiate(&self, stream: &mut TcpStream) -> Result<()> {
        let methods: &[u8] = if self.auth.is_some() {
            &[SOCKS5_VERSION, 2, AUTH_METHOD_NONE, AUTH_METHOD_PASSWORD]
        } else {
            &[SOCKS5_VERSION, 1, AUTH_METHOD_NONE]
        };
        stream.write_all(methods).await?;

        let mut response = [0u8; 2];
        stream.read_exact(&mut response).await?;
        if response[0] != SOCKS5_VERSION {
            return Err(Error::Proxy(format!(
                "invalid SOCKS version {:#04x}",
                response[0]
            )));
        }
        match response[1] {
            AUTH_METHOD_NONE => Ok(()),
            AUTH_METHOD_PASSWORD => self.authenticate(stream).await,
            AUTH_METHOD_NO_ACCEPTABLE => {
                Err(Error::Proxy("no acceptable SOCKS5 auth method".into()))
            }
            other => Err(Error::Proxy(format!(
                "unsupported SOCKS5 auth method {:#04x}",
                other
            ))),
        }
    }

    async fn authenticate(&self, stream: &mut TcpStream) -> Result<()> {
        let (username, password) = self
            .auth
            .as_ref()
            .ok_or_else(|| Error::Proxy("SOCKS5 server requires credentials".into()))?;
        let ulen = u8::try_from(username.len())
            .map_err(|_| Error::Proxy("SOCKS5 username too long".into()))?;
        let plen = u8::try_from(password.len())
            .map_err(|_| Error::Proxy("SOCKS5 password too long".into()))?;

        let mut request = Vec::with_capacity(3 + username.len() + password.len());
        request.push(AUTH_PASSWORD_VERSION);
        request.push(ulen);
        request.extend_from_slice(username.as_bytes());
        request.push(plen);
        request.extend_from_slice(password.as_bytes());
        stream.write_all(&request).await?;

        let mut response = [0u8; 2];
        stream.read_exact(&mut response).await?;
        if response[1] != 0x00 {
            return Err(Error::Proxy("SOCKS5 authentication failed".into()));
        }
        Ok(())
    }
}

/// Read `VER REP RSV ATYP BND.ADDR BND.PORT`
///
/// A bound domain name is skipped and reported as `None`.
async fn read_reply(stream: &mut TcpStream) -> Result<Option<SocketAddr>> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(Error::Proxy(format!(
            "invalid SOCKS version {:#04x}",
            header[0]
        )));
    }
    if header[1] != REPLY_SUCCEEDED {
        return Err(Error::Proxy(format!(
            "SOCKS5 server replied: {}",
            reply_message(header[1])
        )));
    }

    let mut port = [0u8; 2];
    let bound = match header[3] {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            stream.read_exact(&mut port).await?;
            Some(SocketAddr::new(Ipv4Addr::from(ip).into(), u16::from_be_bytes(port)))
        }
        ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            stream.read_exact(&mut port).await?;
            Some(SocketAddr::new(Ipv6Addr::from(ip).into(), u16::from_be_bytes(port)))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut name).await?;
            None
        }
        other => {
            return Err(Error::Proxy(format!(
                "invalid SOCKS5 address type {:#04x}",
                other
            )))
        }
    };
    Ok(bound)
}

/// One UDP association: datagrams to a single destination
struct Socks5Relay {
    /// The association lives as long as this connection
    _control: TcpStream,
    socket: UdpSocket,
    header: Vec<u8>,
}

#[async_trait]
impl UdpRelay for Socks5Relay {
    async fn send(&self, payload: &[u8]) -> io::Result<usize> {
        let mut datagram = Vec::with_capacity(self.header.len() + payload.len());
        datagram.extend_from_slice(&self.header);
        datagram.extend_from_slice(payload);
        self.socket.send(&datagram).await?;
        Ok(payload.len())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut datagram = vec![0u8; buf.len() + UDP_HEADER_MAX];
        loop {
            let n = self.socket.recv(&mut datagram).await?;
            match udp_payload(&datagram[..n]) {
                Ok(payload) => {
                    let n = payload.len().min(buf.len());
                    buf[..n].copy_from_slice(&payload[..n]);
                    return Ok(n);
                }
                Err(e) => log::debug!("[SOCKS5] datagram dropped: {}", e),
            }
        }
    }
}

#[async_trait]
impl Proxy for Socks5Proxy {
    fn proto(&self) -> Proto {
        Proto::Socks5
    }

    fn addr(&self) -> &str {
        &self.addr
    }

    async fn dial_tcp(&self, metadata: &Metadata) -> Result<TcpStream> {
        let target = TargetAddr::from_metadata(metadata);
        let (stream, _) = self.command(CMD_CONNECT, &target).await?;
        log::trace!("[SOCKS5] {} connected via {}", metadata.destination(), self.addr);
        Ok(stream)
    }

    async fn dial_udp(&self, metadata: &Metadata) -> Result<Box<dyn UdpRelay>> {
        let unspecified = TargetAddr::Ip(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0));
        let (control, bound) = self.command(CMD_UDP_ASSOCIATE, &unspecified).await?;
        let server = control.peer_addr()?;

        // An unspecified or missing relay address means "the server itself"
        let relay = match bound {
            Some(addr) if !addr.ip().is_unspecified() => addr,
            Some(addr) => SocketAddr::new(server.ip(), addr.port()),
            None => {
                return Err(Error::Proxy(format!(
                    "SOCKS5 server {} returned no relay address",
                    self.addr
                )))
            }
        };

        let socket = self.dialer.bind_udp(relay)?;
        socket.connect(relay).await?;
        let header = udp_header(&TargetAddr::from_metadata(metadata))?;
        log::trace!(
            "[SOCKS5] {} associated via relay {}",
            metadata.destination(),
            relay
        );
        Ok(Box::new(Socks5Relay {
            _control: control,
            socket,
            header,
        }))
    }
}
