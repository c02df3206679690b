//! sox-tun - TUN device access for the tunnel engine
//!
//! A thin wrapper around `tun-rs` that opens the packet device named by a
//! device spec (`[driver://]name`):
//!
//! - `tun://tun0` (or just `tun0`): create or attach to a TUN interface
//! - `fd://3`: adopt an already open TUN file descriptor (Unix only)
//!
//! Interface addresses and routes are expected to be configured outside
//! the process; the engine only reads and writes raw IP packets.
//!
//! # Platform Requirements
//!
//! ## Linux
//! - Root privileges or `CAP_NET_ADMIN` capability
//! - TUN kernel module loaded (`modprobe tun`)
//!
//! ## macOS
//! - Root privileges; interface names must start with `utun`
//!
//! # Example
//!
//! ```ignore
//! use sox_tun::{DeviceSpec, TunDevice};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let spec: DeviceSpec = "tun://tun0".parse()?;
//!     let device = TunDevice::open(&spec, 1500).await?;
//!
//!     let mut buf = vec![0u8; 2000];
//!     let n = device.read(&mut buf).await?;
//!     println!("Received {} bytes", n);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod device;
pub mod error;

pub use config::{DeviceSpec, TunConfig, TunConfigBuilder};
pub use device::TunDevice;
pub use error::{Error, Result};

/// Default MTU for TUN devices
pub const DEFAULT_MTU: u16 = 1500;

/// Maximum packet size for TUN devices
pub const MAX_PACKET_SIZE: usize = 65535;
