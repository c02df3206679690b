//! Packet device opening
//!
//! The engine opens its device through a [`DeviceOpener`] so tests can hand
//! it an in-memory device instead of a real TUN interface.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use sox_stack::{CloseSignal, Device};
use sox_tun::{DeviceSpec, TunDevice};

use crate::error::{Error, Result};

/// Opens the packet device named by the `device` setting
#[async_trait]
pub trait DeviceOpener: Send + Sync {
    /// `mtu` of 0 keeps the device default
    async fn open(&self, device: &str, mtu: u32) -> Result<Arc<dyn Device>>;
}

/// Opens TUN interfaces and adopted TUN file descriptors
#[derive(Debug, Default, Clone, Copy)]
pub struct TunOpener;

#[async_trait]
impl DeviceOpener for TunOpener {
    async fn open(&self, device: &str, mtu: u32) -> Result<Arc<dyn Device>> {
        let spec: DeviceSpec = device.parse()?;
        let mtu = u16::try_from(mtu)
            .map_err(|_| Error::Config(format!("MTU {} is too large", mtu)))?;
        let tun = TunDevice::open(&spec, mtu).await?;
        log::debug!("opened {} (mtu {})", spec, tun.mtu());
        Ok(Arc::new(TunLink::new(tun, spec.driver())))
    }
}

/// A [`TunDevice`] driven by the packet stack
pub struct TunLink {
    device: TunDevice,
    kind: &'static str,
    closed: CloseSignal,
}

impl TunLink {
    pub fn new(device: TunDevice, kind: &'static str) -> Self {
        Self {
            device,
            kind,
            closed: CloseSignal::new(),
        }
    }

    fn closed_error() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, "device closed")
    }
}

fn into_io(e: sox_tun::Error) -> io::Error {
    match e {
        sox_tun::Error::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}

#[async_trait]
impl Device for TunLink {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        tokio::select! {
            biased;
            _ = self.closed.closed() => Err(Self::closed_error()),
            read = self.device.read(buf) => read.map_err(into_io),
        }
    }

    async fn send(&self, packet: &[u8]) -> io::Result<usize> {
        if self.closed.is_closed() {
            return Err(Self::closed_error());
        }
        self.device.write(packet).await.map_err(into_io)
    }

    fn name(&self) -> &str {
        self.device.name()
    }

    fn kind(&self) -> &str {
        self.kind
    }

    fn mtu(&self) -> u32 {
        u32::from(self.device.mtu())
    }

    fn close(&self) -> io::Result<()> {
        self.closed.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_err(device: &str, mtu: u32) -> Error {
        match TunOpener.open(device, mtu).await {
            Ok(_) => panic!("{} opened unexpectedly", device),
            Err(e) => e,
        }
    }

    #[tokio::test]
    async fn test_opener_rejects_bad_specs() {
        assert!(matches!(open_err("", 1500).await, Error::Tun(_)));
        assert!(matches!(
            open_err("tap://tap0", 1500).await,
            Error::Tun(sox_tun::Error::NotSupported(_))
        ));
        assert!(open_err("tun://tun9", 70000).await.is_config_error());
    }
}
