//! Tunsox Engine
//!
//! Wires a packet device, the user-space stack and an outbound proxy
//! together, with optional fake-IP DNS interception in front of the UDP
//! forwarder. TCP connections terminated by the stack and UDP flows both go
//! to the [`Tunnel`], which dials them through the proxy by domain name when
//! the destination is a fake IP.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   packets   ┌───────────────┐   new flows   ┌──────────┐
//! │  TUN device  │ ──────────▶ │   sox-stack   │ ────────────▶ │  Tunnel  │
//! │  (sox-tun)   │ ◀────────── │  TCP │ UDP    │ ◀──────────── │  Proxy   │
//! └──────────────┘   replies   └───────┬───────┘    replies    └──────────┘
//!                                      │ port 53
//!                                      ▼
//!                              ┌───────────────┐
//!                              │ DnsInterceptor│  A → fake IP
//!                              │   (sox-dns)   │  other → upstream
//!                              └───────────────┘
//! ```
//!
//! [`Engine`] owns all of it and moves between [`EngineState`]s under one
//! lock.
//!
//! ```no_run
//! use tunsox_engine::{Engine, Key};
//!
//! # async fn run() -> tunsox_engine::Result<()> {
//! let key = Key::load("tunsox.toml")?;
//! let engine = Engine::new();
//! engine.insert(key).await?;
//! engine.start().await?;
//! // ...
//! engine.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod device;
pub mod dialer;
pub mod engine;
pub mod error;
pub mod proxy;
pub mod restapi;
pub mod socks5;
pub mod stats;
pub mod tunnel;

pub use config::{
    format_duration, parse_byte_size, parse_duration, parse_log_level, Key, DEFAULT_UDP_TIMEOUT,
    MAX_UDP_TIMEOUT,
};
pub use device::{DeviceOpener, TunLink, TunOpener};
pub use dialer::{Dialer, CONNECT_TIMEOUT};
pub use engine::{Engine, EngineState};
pub use error::{Error, Result};
pub use proxy::{parse_proxy, Metadata, Proto, Proxy, UdpRelay};
pub use restapi::{parse_restapi, RestApi, RestApiTarget};
pub use socks5::Socks5Proxy;
pub use stats::{EngineStats, FakeIpStats, StatsSource};
pub use tunnel::Tunnel;
