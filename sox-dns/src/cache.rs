//! Name records backed by the fake-IP pool
//!
//! Couples [`AddressPool`] allocation with a single record TTL. The engine
//! sets the TTL to the UDP idle timeout so a name stays mapped for as long as
//! a flow to its fake address can live.

use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::pool::AddressPool;

/// Normalize a query name: lowercase, no trailing dot
pub fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// Domain name to fake address records
#[derive(Debug)]
pub struct NameRecordCache {
    pool: AddressPool,
    ttl: Option<Duration>,
}

impl NameRecordCache {
    /// Create a cache over the fake-IP network `cidr`, without a TTL yet
    pub fn new(cidr: &str) -> Result<Self> {
        Ok(Self {
            pool: AddressPool::new(cidr)?,
            ttl: None,
        })
    }

    /// Set the record TTL
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Record TTL, `None` (or zero) until configured
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl.filter(|ttl| !ttl.is_zero())
    }

    /// The underlying pool
    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    /// Fake address for `name`, allocating on first use
    pub fn resolve(&self, name: &str, now: Instant) -> Result<Ipv4Addr> {
        let ttl = self
            .ttl()
            .ok_or_else(|| Error::NotConfigured("name record TTL".into()))?;
        self.pool.allocate(&normalize_name(name), now, ttl)
    }

    /// Live address of `name` at `now`, without allocating
    pub fn lookup_address(&self, name: &str, now: Instant) -> Option<Ipv4Addr> {
        self.pool.lookup(&normalize_name(name), now)
    }

    /// Drop the record for `name`, freeing its address
    pub fn release(&self, name: &str) -> Option<Ipv4Addr> {
        self.pool.release(&normalize_name(name))
    }

    /// Name that was given `address`, if the record is still live
    pub fn lookup_name(&self, address: IpAddr) -> Option<String> {
        self.lookup_name_at(address, Instant::now())
    }

    pub fn lookup_name_at(&self, address: IpAddr, now: Instant) -> Option<String> {
        match address {
            IpAddr::V4(v4) => self.pool.reverse_lookup(v4, now),
            IpAddr::V6(_) => None,
        }
    }

    /// Whether `address` belongs to the fake-IP range
    pub fn is_fake(&self, address: IpAddr) -> bool {
        match address {
            IpAddr::V4(v4) => self.pool.contains(v4),
            IpAddr::V6(_) => false,
        }
    }
}
