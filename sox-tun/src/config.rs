//! TUN device configuration and device spec parsing

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::DEFAULT_MTU;

/// Longest interface name the kernel accepts (IFNAMSIZ - 1)
const MAX_NAME_LEN: usize = 15;

/// Driver used when a spec has no `driver://` prefix
pub const DEFAULT_DRIVER: &str = "tun";

/// Parsed `[driver://]name` device spec
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSpec {
    /// Create or attach to the named TUN interface
    Tun { name: String },
    /// Adopt an open TUN file descriptor
    Fd { fd: i32 },
}

impl DeviceSpec {
    /// Driver name as written in the spec
    pub fn driver(&self) -> &'static str {
        match self {
            DeviceSpec::Tun { .. } => "tun",
            DeviceSpec::Fd { .. } => "fd",
        }
    }
}

impl FromStr for DeviceSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (driver, rest) = s.split_once("://").unwrap_or((DEFAULT_DRIVER, s));
        if rest.is_empty() {
            return Err(Error::InvalidSpec(s.to_string()));
        }

        match driver.to_ascii_lowercase().as_str() {
            "tun" => Ok(DeviceSpec::Tun {
                name: rest.to_string(),
            }),
            "fd" => {
                let fd = rest
                    .parse::<i32>()
                    .ok()
                    .filter(|fd| *fd >= 0)
                    .ok_or_else(|| Error::InvalidSpec(s.to_string()))?;
                Ok(DeviceSpec::Fd { fd })
            }
            other => Err(Error::NotSupported(format!("device driver '{}'", other))),
        }
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSpec::Tun { name } => write!(f, "tun://{}", name),
            DeviceSpec::Fd { fd } => write!(f, "fd://{}", fd),
        }
    }
}

/// Configuration for creating a TUN device
#[derive(Debug, Clone)]
pub struct TunConfig {
    /// Interface name (auto-generated if not specified)
    pub name: Option<String>,
    /// Maximum transmission unit
    pub mtu: u16,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            name: None,
            mtu: DEFAULT_MTU,
        }
    }
}

impl TunConfig {
    /// Create a new configuration builder
    pub fn builder() -> TunConfigBuilder {
        TunConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(ref name) = self.name {
            if name.is_empty() || name.len() > MAX_NAME_LEN {
                return Err(Error::Config(format!(
                    "interface name '{}' must be 1-{} characters",
                    name, MAX_NAME_LEN
                )));
            }
        }

        if self.mtu < 68 {
            return Err(Error::Config(format!(
                "MTU {} is too small (minimum 68)",
                self.mtu
            )));
        }

        Ok(())
    }
}

/// Builder for TunConfig
#[derive(Debug, Default)]
pub struct TunConfigBuilder {
    config: TunConfig,
}

impl TunConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the interface name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = Some(name.into());
        self
    }

    /// Set the MTU; 0 keeps the default
    pub fn mtu(mut self, mtu: u16) -> Self {
        if mtu != 0 {
            self.config.mtu = mtu;
        }
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<TunConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
