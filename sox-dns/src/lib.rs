//! sox-dns - fake-IP DNS for the tunnel
//!
//! This crate answers DNS A-queries seen on the packet path with synthetic
//! addresses from a private range, and remembers which name each address
//! stands for so the tunnel can hand the proxy a domain instead of an IP.
//!
//! - [`AddressPool`]: cyclic allocation of fake addresses with lazy expiry
//! - [`NameRecordCache`]: name to address records with one TTL
//! - [`DnsInterceptor`]: a [`sox_stack::PacketInterceptor`] that answers
//!   A-queries and forwards everything else through an
//!   [`UpstreamExchanger`]
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use sox_dns::{DnsInterceptor, ExchangerOptions, NameRecordCache, UpstreamExchanger};
//!
//! # async fn example() -> sox_dns::Result<()> {
//! let cache = Arc::new(
//!     NameRecordCache::new("198.18.0.0/15")?.with_ttl(Duration::from_secs(60)),
//! );
//! let exchanger = UpstreamExchanger::new(
//!     sox_dns::select_upstream(None),
//!     ExchangerOptions::default(),
//! );
//! let interceptor = DnsInterceptor::new(cache, exchanger)?;
//! interceptor.enable();
//! # Ok(())
//! # }
//! ```

mod cache;
mod config;
pub mod error;
mod interceptor;
mod pool;
mod upstream;

pub use cache::{normalize_name, NameRecordCache};
pub use config::{parse_upstream, DNS_PORT};
pub use error::{Error, Result};
pub use interceptor::DnsInterceptor;
pub use pool::AddressPool;
pub use upstream::{
    bind_unspecified, exchange, exchange_on, select_upstream, system_upstream, ExchangeJob,
    ExchangerOptions, SocketBinder, UpstreamExchanger, FALLBACK_UPSTREAM,
};

/// Default fake-IP network
pub const DEFAULT_FAKE_NETWORK: &str = "198.18.0.0/15";
