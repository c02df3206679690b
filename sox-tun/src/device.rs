//! TUN device abstraction layer
//!
//! This module provides a thin wrapper around the `tun-rs` crate. A device
//! is opened either by creating an interface from a [`TunConfig`] or by
//! adopting a file descriptor handed over by a parent process (Android
//! `VpnService`, macOS NetworkExtension, a privileged launcher).

use crate::config::{DeviceSpec, TunConfig};
use crate::error::{Error, Result};

#[cfg(unix)]
use std::os::unix::io::RawFd;

/// Information about a TUN device
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Interface name
    pub name: String,
    /// MTU
    pub mtu: u16,
}

/// Async TUN device wrapper
pub struct TunDevice {
    inner: tun_rs::AsyncDevice,
    info: DeviceInfo,
}

impl TunDevice {
    /// Open the device described by `spec`; an `mtu` of 0 keeps the default
    pub async fn open(spec: &DeviceSpec, mtu: u16) -> Result<Self> {
        match spec {
            DeviceSpec::Tun { name } => {
                let config = TunConfig::builder().name(name.clone()).mtu(mtu).build()?;
                Self::create(config).await
            }
            #[cfg(unix)]
            DeviceSpec::Fd { fd } => {
                let mtu = TunConfig::builder().mtu(mtu).build()?.mtu;
                // SAFETY: the fd was handed to this process for exclusive use
                // as a TUN device; the device takes ownership of it.
                unsafe { Self::from_fd(*fd, format!("fd{}", fd), mtu) }
            }
            #[cfg(not(unix))]
            DeviceSpec::Fd { .. } => Err(Error::NotSupported(
                "fd:// devices are only available on Unix".into(),
            )),
        }
    }

    /// Create a new TUN device with the given configuration
    ///
    /// # Platform Requirements
    ///
    /// - **Linux**: Requires root or `CAP_NET_ADMIN` capability
    /// - **macOS**: Requires root privileges
    pub async fn create(config: TunConfig) -> Result<Self> {
        config.validate()?;

        let mut builder = tun_rs::DeviceBuilder::new();
        if let Some(ref name) = config.name {
            builder = builder.name(name);
        }
        builder = builder.mtu(config.mtu);

        let device = builder
            .build_async()
            .map_err(|e| Error::DeviceCreation(e.to_string()))?;

        let name = device
            .name()
            .map_err(|e| Error::DeviceCreation(e.to_string()))?;

        log::info!("Created TUN device: {} (MTU: {})", name, config.mtu);

        Ok(Self {
            inner: device,
            info: DeviceInfo {
                name,
                mtu: config.mtu,
            },
        })
    }

    /// Create a TUN device from an existing file descriptor
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    /// - `fd` is a valid, open file descriptor for a TUN device
    /// - No other code will close or modify the file descriptor
    #[cfg(unix)]
    pub unsafe fn from_fd(fd: RawFd, name: impl Into<String>, mtu: u16) -> Result<Self> {
        let device = tun_rs::AsyncDevice::from_fd(fd).map_err(|e| {
            Error::DeviceCreation(format!("failed to create device from fd: {}", e))
        })?;

        let name = name.into();
        log::info!("Created TUN device from fd {}: {} (MTU: {})", fd, name, mtu);

        Ok(Self {
            inner: device,
            info: DeviceInfo { name, mtu },
        })
    }

    /// Get the device name
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Get the MTU
    pub fn mtu(&self) -> u16 {
        self.info.mtu
    }

    /// Get device information
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Read a packet from the TUN device
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.inner.recv(buf).await.map_err(Error::Io)
    }

    /// Write a packet to the TUN device
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.inner.send(buf).await.map_err(Error::Io)
    }
}

impl std::fmt::Debug for TunDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunDevice")
            .field("info", &self.info)
            .finish()
    }
}
