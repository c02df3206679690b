//! Fake-IP address pool
//!
//! Hands out addresses from an IPv4 network to domain names. Each record
//! lives for a caller-supplied TTL; expired records are swept lazily on the
//! next allocation. Allocation walks the usable range with a cyclic cursor
//! so freshly released addresses are not reused immediately.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use ipnet::Ipv4Net;
use parking_lot::Mutex;

use crate::error::{Error, Result};

#[derive(Debug)]
struct Record {
    address: Ipv4Addr,
    expires_at: Instant,
}

#[derive(Debug)]
struct PoolState {
    network: Ipv4Net,
    /// Network address as an integer
    base: u32,
    /// Number of assignable addresses (excludes network and broadcast)
    usable: u32,
    /// Offset of the last address handed out, 0 before the first
    cursor: u32,
    by_name: HashMap<String, Record>,
    by_address: HashMap<Ipv4Addr, String>,
    /// Lower bound on every record's expiry
    next_expiry: Option<Instant>,
}

impl PoolState {
    fn new(cidr: &str) -> Result<Self> {
        let network: Ipv4Net = cidr
            .trim()
            .parse()
            .map_err(|_| Error::InvalidNetwork(cidr.to_string()))?;

        let base = u32::from(network.network());
        let broadcast = u32::from(network.broadcast());
        let usable = broadcast.saturating_sub(base).saturating_sub(1);
        if usable < 1 {
            return Err(Error::InvalidNetwork(format!(
                "{} has no usable addresses",
                cidr
            )));
        }

        Ok(Self {
            network: network.trunc(),
            base,
            usable,
            cursor: 0,
            by_name: HashMap::new(),
            by_address: HashMap::new(),
            next_expiry: None,
        })
    }

    fn offset_of(&self, address: Ipv4Addr) -> Option<u32> {
        let offset = u32::from(address).checked_sub(self.base)?;
        (1..=self.usable).contains(&offset).then_some(offset)
    }

    fn sweep(&mut self, now: Instant) {
        match self.next_expiry {
            Some(at) if at <= now => {}
            _ => return,
        }

        let by_address = &mut self.by_address;
        self.by_name.retain(|_, record| {
            let live = record.expires_at > now;
            if !live {
                by_address.remove(&record.address);
            }
            live
        });
        self.next_expiry = self.by_name.values().map(|r| r.expires_at).min();
    }

    fn insert(&mut self, name: &str, address: Ipv4Addr, expires_at: Instant) {
        self.by_name.insert(
            name.to_string(),
            Record {
                address,
                expires_at,
            },
        );
        self.by_address.insert(address, name.to_string());
        self.next_expiry = Some(match self.next_expiry {
            Some(at) => at.min(expires_at),
            None => expires_at,
        });
    }
}

/// Thread-safe fake-IP address pool
#[derive(Debug)]
pub struct AddressPool {
    state: Mutex<PoolState>,
}

impl AddressPool {
    /// Create a pool over `cidr` (IPv4 only)
    pub fn new(cidr: &str) -> Result<Self> {
        Ok(Self {
            state: Mutex::new(PoolState::new(cidr)?),
        })
    }

    /// Switch to a new network, dropping every record and resetting the cursor
    pub fn configure(&self, cidr: &str) -> Result<()> {
        let fresh = PoolState::new(cidr)?;
        *self.state.lock() = fresh;
        Ok(())
    }

    /// Get the address for `name`, allocating one if it has no live record
    ///
    /// A live record is refreshed to expire `ttl` after `now` and keeps its
    /// address. A `ttl` that does not fit in an [`Instant`] is rejected.
    pub fn allocate(&self, name: &str, now: Instant, ttl: Duration) -> Result<Ipv4Addr> {
        let expires_at = now
            .checked_add(ttl)
            .ok_or_else(|| Error::Config(format!("record ttl {:?} is out of range", ttl)))?;
        let mut state = self.state.lock();

        if let Some(record) = state.by_name.get_mut(name) {
            if record.expires_at > now {
                record.expires_at = expires_at;
                return Ok(record.address);
            }
        }

        state.sweep(now);

        for _ in 0..state.usable {
            state.cursor = state.cursor % state.usable + 1;
            let address = Ipv4Addr::from(state.base + state.cursor);
            if !state.by_address.contains_key(&address) {
                // A stale record for this name may survive a skipped sweep
                if let Some(old) = state.by_name.remove(name) {
                    state.by_address.remove(&old.address);
                }
                state.insert(name, address, expires_at);
                return Ok(address);
            }
        }

        Err(Error::PoolExhausted(state.network.to_string()))
    }

    /// Address held by `name`, if its record is live at `now`
    pub fn lookup(&self, name: &str, now: Instant) -> Option<Ipv4Addr> {
        let state = self.state.lock();
        state
            .by_name
            .get(name)
            .filter(|record| record.expires_at > now)
            .map(|record| record.address)
    }

    /// Name holding `address`, if its record is live at `now`
    pub fn reverse_lookup(&self, address: Ipv4Addr, now: Instant) -> Option<String> {
        let state = self.state.lock();
        let name = state.by_address.get(&address)?;
        let record = state.by_name.get(name)?;
        (record.expires_at > now).then(|| name.clone())
    }

    /// Expire the record for `name` immediately
    pub fn release(&self, name: &str) -> Option<Ipv4Addr> {
        let mut state = self.state.lock();
        let record = state.by_name.remove(name)?;
        state.by_address.remove(&record.address);
        Some(record.address)
    }

    /// Whether `address` lies in the assignable range
    pub fn contains(&self, address: Ipv4Addr) -> bool {
        self.state.lock().offset_of(address).is_some()
    }

    /// Number of records held, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.state.lock().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of assignable addresses
    pub fn usable(&self) -> u32 {
        self.state.lock().usable
    }

    pub fn network(&self) -> Ipv4Net {
        self.state.lock().network
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn test_first_addresses() {
        let pool = AddressPool::new("198.18.0.0/15").unwrap();
        let now = Instant::now();

        let a = pool.allocate("a.example", now, TTL).unwrap();
        let b = pool.allocate("b.example", now, TTL).unwrap();
        assert_eq!(a, Ipv4Addr::new(198, 18, 0, 1));
        assert_eq!(b, Ipv4Addr::new(198, 18, 0, 2));
        assert_eq!(pool.usable(), (1 << 17) - 2);
    }

    #[test]
    fn test_allocate_is_idempotent() {
        let pool = AddressPool::new("10.0.0.0/24").unwrap();
        let now = Instant::now();

        let first = pool.allocate("x.test", now, TTL).unwrap();
        let again = pool.allocate("x.test", now + Duration::from_secs(30), TTL).unwrap();
        assert_eq!(first, again);
        assert_eq!(pool.len(), 1);

        // The refresh pushed expiry past the original deadline
        assert_eq!(
            pool.reverse_lookup(first, now + Duration::from_secs(75)),
            Some("x.test".to_string())
        );
    }

    #[test]
    fn test_never_hands_out_network_or_broadcast() {
        let pool = AddressPool::new("10.1.2.0/29").unwrap();
        let now = Instant::now();
        let network = Ipv4Addr::new(10, 1, 2, 0);
        let broadcast = Ipv4Addr::new(10, 1, 2, 7);

        let mut seen = Vec::new();
        for i in 0..6 {
            let addr = pool.allocate(&format!("n{}", i), now, TTL).unwrap();
            assert_ne!(addr, network);
            assert_ne!(addr, broadcast);
            assert!(pool.contains(addr));
            seen.push(addr);
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 6);
        assert!(!pool.contains(network));
        assert!(!pool.contains(broadcast));
    }

    #[test]
    fn test_exhaustion() {
        let pool = AddressPool::new("10.0.0.0/30").unwrap();
        let now = Instant::now();

        pool.allocate("one", now, TTL).unwrap();
        pool.allocate("two", now, TTL).unwrap();
        let err = pool.allocate("three", now, TTL).unwrap_err();
        assert!(matches!(err, Error::PoolExhausted(_)));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_expired_address_is_reused() {
        let pool = AddressPool::new("10.0.0.0/30").unwrap();
        let now = Instant::now();
        let short = Duration::from_secs(1);

        let a = pool.allocate("old-a", now, short).unwrap();
        let b = pool.allocate("old-b", now, short).unwrap();

        let later = now + Duration::from_secs(2);
        let c = pool.allocate("new", later, TTL).unwrap();
        assert!(c == a || c == b);
        assert_eq!(pool.reverse_lookup(c, later), Some("new".to_string()));
        assert_ne!(pool.reverse_lookup(a, later).as_deref(), Some("old-a"));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_cursor_wraps() {
        let pool = AddressPool::new("10.0.0.0/30").unwrap();
        let now = Instant::now();

        let first = pool.allocate("a", now, TTL).unwrap();
        pool.allocate("b", now, TTL).unwrap();
        pool.release("a");

        let wrapped = pool.allocate("c", now, TTL).unwrap();
        assert_eq!(wrapped, first);
    }

    #[test]
    fn test_reverse_lookup_and_release() {
        let pool = AddressPool::new("198.18.0.0/15").unwrap();
        let now = Instant::now();

        let addr = pool.allocate("www.example.com", now, TTL).unwrap();
        assert_eq!(
            pool.reverse_lookup(addr, now),
            Some("www.example.com".to_string())
        );
        assert_eq!(pool.reverse_lookup(addr, now + TTL), None);
        assert_eq!(pool.reverse_lookup(Ipv4Addr::new(198, 18, 9, 9), now), None);

        assert_eq!(pool.release("www.example.com"), Some(addr));
        assert_eq!(pool.reverse_lookup(addr, now), None);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_huge_ttl_is_an_error() {
        let pool = AddressPool::new("10.0.0.0/24").unwrap();
        let now = Instant::now();

        let err = pool
            .allocate("far.test", now, Duration::from_secs(u64::MAX))
            .unwrap_err();
        assert!(err.is_config_error());
        assert!(pool.is_empty());
    }

    #[test]
    fn test_lookup_by_name() {
        let pool = AddressPool::new("10.0.0.0/24").unwrap();
        let now = Instant::now();

        let addr = pool.allocate("x.test", now, TTL).unwrap();
        assert_eq!(pool.lookup("x.test", now), Some(addr));
        assert_eq!(pool.lookup("x.test", now + TTL), None);
        assert_eq!(pool.lookup("y.test", now), None);
    }

    #[test]
    fn test_invalid_networks() {
        assert!(matches!(
            AddressPool::new("not-a-cidr"),
            Err(Error::InvalidNetwork(_))
        ));
        assert!(AddressPool::new("10.0.0.1/32").is_err());
        assert!(AddressPool::new("10.0.0.0/31").is_err());
        assert!(AddressPool::new("fd00::/64").is_err());
        assert!(AddressPool::new("10.0.0.0/30").is_ok());
    }

    #[test]
    fn test_configure_resets() {
        let pool = AddressPool::new("10.0.0.0/24").unwrap();
        let now = Instant::now();
        pool.allocate("a", now, TTL).unwrap();

        pool.configure("172.16.0.0/16").unwrap();
        assert!(pool.is_empty());
        assert_eq!(
            pool.allocate("a", now, TTL).unwrap(),
            Ipv4Addr::new(172, 16, 0, 1)
        );
        assert!(pool.configure("bogus").is_err());
    }
}
