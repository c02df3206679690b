//! Engine configuration (the "key")
//!
//! Field names are kebab-case in TOML and on the command line alike.
//!
//! # Example Configuration
//!
//! ```toml
//! proxy = "socks5://127.0.0.1:1080"
//! device = "tun://tun0"
//! mtu = 1500
//! loglevel = "info"
//! udp-timeout = "60s"
//! remote-dns = true
//! remote-dns-net-ipv4 = "198.18.0.0/15"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// UDP idle timeout (and fake-IP record TTL) when none is configured
pub const DEFAULT_UDP_TIMEOUT: Duration = Duration::from_secs(60);

/// Longest accepted UDP timeout
pub const MAX_UDP_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Key {
    /// Device MTU, 0 for the device default
    pub mtu: u32,

    /// Routing mark for outbound sockets (Linux), 0 to leave unset
    pub fwmark: u32,

    /// Proxy target `protocol://host[:port]`
    pub proxy: String,

    /// Statistics server `http://[token@]host:port`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restapi: Option<String>,

    /// Device spec `[driver://]name`
    pub device: String,

    /// debug, info, warning, error or silent
    pub loglevel: String,

    /// Bind outbound sockets to this interface
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,

    /// TCP receive-buffer auto-tuning
    pub tcp_moderate_receive_buffer: bool,

    /// TCP send buffer size, e.g. `4KiB`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_send_buffer_size: Option<String>,

    /// TCP receive buffer size, e.g. `1MiB`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_receive_buffer_size: Option<String>,

    /// UDP idle timeout, also the fake-IP record TTL
    #[serde(with = "duration_opt", skip_serializing_if = "Option::is_none")]
    pub udp_timeout: Option<Duration>,

    /// Answer A-queries with fake-IP addresses
    pub remote_dns: bool,

    /// Fake-IP network
    pub remote_dns_net_ipv4: String,

    /// Upstream resolver override for queries that are not intercepted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xpt_dns: Option<String>,
}

impl Default for Key {
    fn default() -> Self {
        Self {
            mtu: 0,
            fwmark: 0,
            proxy: String::new(),
            restapi: None,
            device: String::new(),
            loglevel: "info".into(),
            interface: None,
            tcp_moderate_receive_buffer: false,
            tcp_send_buffer_size: None,
            tcp_receive_buffer_size: None,
            udp_timeout: None,
            remote_dns: false,
            remote_dns_net_ipv4: sox_dns::DEFAULT_FAKE_NETWORK.into(),
            xpt_dns: None,
        }
    }
}

impl Key {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let key: Key = toml::from_str(content)?;
        key.validate()?;
        Ok(key)
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.proxy.trim().is_empty() {
            return Err(Error::Config("proxy is required".into()));
        }
        if self.device.trim().is_empty() {
            return Err(Error::Config("device is required".into()));
        }

        if self.mtu > u16::MAX as u32 {
            return Err(Error::Config(format!("MTU {} is too large", self.mtu)));
        }

        self.log_level()?;
        self.udp_timeout()?;
        self.send_buffer_size()?;
        self.receive_buffer_size()?;

        if self.remote_dns {
            sox_dns::AddressPool::new(&self.remote_dns_net_ipv4)?;
        }
        if let Some(ref upstream) = self.xpt_dns {
            sox_dns::parse_upstream(upstream)?;
        }

        Ok(())
    }

    /// Parsed log level
    pub fn log_level(&self) -> Result<log::LevelFilter> {
        parse_log_level(&self.loglevel)
    }

    /// Configured UDP timeout, `None` when unset or zero
    ///
    /// A nonzero timeout below one second or above [`MAX_UDP_TIMEOUT`] is
    /// rejected.
    pub fn udp_timeout(&self) -> Result<Option<Duration>> {
        match self.udp_timeout {
            Some(t) if t.is_zero() => Ok(None),
            Some(t) if t < Duration::from_secs(1) => Err(Error::Config(format!(
                "invalid udp timeout {:?}, must be at least 1s",
                t
            ))),
            Some(t) if t > MAX_UDP_TIMEOUT => Err(Error::Config(format!(
                "invalid udp timeout {}, must be at most {}",
                format_duration(t),
                format_duration(MAX_UDP_TIMEOUT)
            ))),
            other => Ok(other),
        }
    }

    /// UDP timeout in effect, falling back to [`DEFAULT_UDP_TIMEOUT`]
    pub fn effective_udp_timeout(&self) -> Duration {
        self.udp_timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(DEFAULT_UDP_TIMEOUT)
    }

    pub fn send_buffer_size(&self) -> Result<Option<usize>> {
        self.tcp_send_buffer_size
            .as_deref()
            .map(parse_byte_size)
            .transpose()
    }

    pub fn receive_buffer_size(&self) -> Result<Option<usize>> {
        self.tcp_receive_buffer_size
            .as_deref()
            .map(parse_byte_size)
            .transpose()
    }

    /// Generate a sample configuration
    pub fn sample() -> String {
        r#"# tunsox configuration
#
# Every key can also be given on the command line as --<key>.
# Values in this file take precedence over command-line flags.

# Proxy target (required)
# Protocols: direct, reject, socks5, socks4, http, ss
# A target without "protocol://" is treated as socks5.
proxy = "direct://"

# Packet device (required): [driver://]name
# tun://tun0 creates or attaches to a TUN interface,
# fd://3 adopts an already open TUN file descriptor.
device = "tun://tun0"

# Device MTU (0 = device default)
mtu = 1500

# Log level: "debug", "info", "warning", "error", "silent"
loglevel = "info"

# Bind outbound sockets to an interface (optional)
# interface = "eth0"

# Routing mark for outbound sockets, Linux only (0 = unset)
fwmark = 0

# Statistics API (optional): http://[token@]host:port
# restapi = "http://secret@127.0.0.1:9090"

# TCP buffer tuning
tcp-moderate-receive-buffer = false
# tcp-send-buffer-size = "64KiB"
# tcp-receive-buffer-size = "64KiB"

# UDP idle timeout, also how long a fake-IP record stays valid
# Examples: "30s", "2m", "500ms" (rejected: nonzero values below 1s)
udp-timeout = "60s"

# Answer DNS A-queries with addresses from a private range and hand the
# domain to the proxy instead of a resolved IP
remote-dns = false
remote-dns-net-ipv4 = "198.18.0.0/15"

# Upstream resolver for DNS queries that are not A-queries
# (default: first nameserver from the system, then 8.8.8.8)
# xpt-dns = "1.1.1.1:53"
"#
        .to_string()
    }
}

/// Map a level name onto a `log` filter
pub fn parse_log_level(level: &str) -> Result<log::LevelFilter> {
    match level.trim().to_ascii_lowercase().as_str() {
        "debug" => Ok(log::LevelFilter::Debug),
        "info" => Ok(log::LevelFilter::Info),
        "warning" | "warn" => Ok(log::LevelFilter::Warn),
        "error" => Ok(log::LevelFilter::Error),
        "silent" => Ok(log::LevelFilter::Off),
        other => Err(Error::Config(format!("unknown log level '{}'", other))),
    }
}

/// Parse a human-readable byte size with binary multipliers
///
/// `65536`, `64k`, `64KB`, `64KiB` and `1.5m` are all accepted; every
/// suffix counts in powers of 1024.
pub fn parse_byte_size(s: &str) -> Result<usize> {
    let s = s.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| Error::Config(format!("invalid size '{}'", s)))?;

    let shift = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 0,
        "k" | "kb" | "kib" => 10,
        "m" | "mb" | "mib" => 20,
        "g" | "gb" | "gib" => 30,
        "t" | "tb" | "tib" => 40,
        other => {
            return Err(Error::Config(format!(
                "invalid size unit '{}' in '{}'",
                other, s
            )))
        }
    };

    let bytes = value * (1u64 << shift) as f64;
    if !bytes.is_finite() || bytes < 0.0 || bytes > usize::MAX as f64 {
        return Err(Error::Config(format!("size '{}' out of range", s)));
    }
    Ok(bytes as usize)
}

/// Parse a duration such as `30s`, `2m`, `1m30s`, `500ms` or bare seconds
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let invalid = || Error::Config(format!("invalid duration '{}'", s));

    if s.is_empty() {
        return Err(invalid());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        if digits == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];

        let part = Duration::try_from_secs_f64(value * scale).map_err(|_| invalid())?;
        total = total.checked_add(part).ok_or_else(invalid)?;
    }

    Ok(total)
}

/// Render a duration in the form [`parse_duration`] reads back
pub fn format_duration(d: Duration) -> String {
    if d.subsec_nanos() == 0 {
        format!("{}s", d.as_secs())
    } else if d.subsec_nanos() % 1_000_000 == 0 {
        format!("{}ms", d.as_millis())
    } else {
        format!("{}ns", d.as_nanos())
    }
}

/// Serde adapter for `Option<Duration>` as a string or integer seconds
mod duration_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Option<Duration>, ser: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => ser.serialize_str(&super::format_duration(*d)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Duration>, D::Error> {
        match Option::<Raw>::deserialize(de)? {
            None => Ok(None),
            Some(Raw::Secs(secs)) => Ok(Some(Duration::from_secs(secs))),
            Some(Raw::Text(text)) => super::parse_duration(&text)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}
