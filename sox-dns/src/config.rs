//! Upstream resolver address parsing

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Standard DNS port
pub const DNS_PORT: u16 = 53;

/// Parse an upstream resolver address
///
/// Accepts `IP`, `IP:port`, `[IPv6]:port`, optionally prefixed with
/// `udp://` or suffixed with `/udp`. The port defaults to 53. Only UDP
/// upstreams are supported.
pub fn parse_upstream(s: &str) -> Result<SocketAddr> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::Config("empty upstream DNS address".into()));
    }

    let s = match s.split_once("://") {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("udp") => rest,
        Some((scheme, _)) => {
            return Err(Error::Config(format!(
                "unsupported upstream DNS protocol '{}', only udp is supported",
                scheme
            )))
        }
        None => s,
    };

    let addr_part = match s.rsplit_once('/') {
        Some((addr, proto)) if proto.eq_ignore_ascii_case("udp") => addr,
        Some((_, proto)) => {
            return Err(Error::Config(format!(
                "unsupported upstream DNS protocol '{}', only udp is supported",
                proto
            )))
        }
        None => s,
    };

    parse_socket_addr(addr_part, DNS_PORT)
}

fn parse_socket_addr(s: &str, default_port: u16) -> Result<SocketAddr> {
    if let Ok(addr) = SocketAddr::from_str(s) {
        return Ok(addr);
    }

    // [::1] without a port
    if let Some(inner) = s.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
        let ip = inner
            .parse::<IpAddr>()
            .map_err(|e| Error::Config(format!("invalid IP address '{}': {}", inner, e)))?;
        return Ok(SocketAddr::new(ip, default_port));
    }

    if let Ok(ip) = s.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    if let Some((ip_str, port_str)) = s.rsplit_once(':') {
        let ip = ip_str
            .parse::<IpAddr>()
            .map_err(|e| Error::Config(format!("invalid IP address '{}': {}", ip_str, e)))?;
        let port = port_str
            .parse::<u16>()
            .map_err(|e| Error::Config(format!("invalid port '{}': {}", port_str, e)))?;
        return Ok(SocketAddr::new(ip, port));
    }

    Err(Error::Config(format!(
        "cannot parse DNS server address '{}'",
        s
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ip_only() {
        let addr = parse_upstream("1.1.1.1").unwrap();
        assert_eq!(addr, "1.1.1.1:53".parse().unwrap());
    }

    #[test]
    fn test_parse_with_port() {
        let addr = parse_upstream(" 10.0.0.1:5353 ").unwrap();
        assert_eq!(addr, "10.0.0.1:5353".parse().unwrap());
    }

    #[test]
    fn test_parse_udp_forms() {
        let expected: SocketAddr = "8.8.4.4:53".parse().unwrap();
        assert_eq!(parse_upstream("udp://8.8.4.4").unwrap(), expected);
        assert_eq!(parse_upstream("8.8.4.4/udp").unwrap(), expected);
        assert_eq!(parse_upstream("UDP://8.8.4.4:53").unwrap(), expected);
    }

    #[test]
    fn test_parse_ipv6() {
        assert_eq!(
            parse_upstream("2001:4860:4860::8888").unwrap(),
            "[2001:4860:4860::8888]:53".parse().unwrap()
        );
        assert_eq!(
            parse_upstream("[::1]").unwrap(),
            "[::1]:53".parse().unwrap()
        );
        assert_eq!(
            parse_upstream("[::1]:5300").unwrap(),
            "[::1]:5300".parse().unwrap()
        );
    }

    #[test]
    fn test_reject_other_protocols() {
        assert!(parse_upstream("tcp://1.1.1.1").is_err());
        assert!(parse_upstream("1.1.1.1/tcp").is_err());
        assert!(parse_upstream("https://dns.google/dns-query").is_err());
    }

    #[test]
    fn test_reject_garbage() {
        assert!(parse_upstream("").is_err());
        assert!(parse_upstream("dns.google").is_err());
        assert!(parse_upstream("1.1.1.1:99999").is_err());
    }
}
