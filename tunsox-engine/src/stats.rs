//! Engine statistics

use std::sync::Arc;

use ipnet::Ipv4Net;
use parking_lot::RwLock;
use serde::Serialize;
use sox_dns::NameRecordCache;
use sox_stack::{StackHandle, StatsSnapshot};

use crate::tunnel::Tunnel;

/// Statistics reported by `GET /stats`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Stack counters, absent when the stack is not running
    pub stack: Option<StatsSnapshot>,
    /// Fake-IP pool usage, absent when remote DNS is off
    pub fake_ip: Option<FakeIpStats>,
    /// UDP relay tasks currently running
    pub udp_sessions: usize,
    /// TCP relay tasks currently running
    pub tcp_sessions: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FakeIpStats {
    pub network: Ipv4Net,
    pub usable: u32,
    pub records: usize,
}

/// Live handles the statistics are read from
///
/// Shared between the engine, which attaches and clears the handles, and
/// the REST server, which reads them on every request.
#[derive(Default)]
pub struct StatsSource {
    stack: RwLock<Option<StackHandle>>,
    names: RwLock<Option<Arc<NameRecordCache>>>,
    tunnel: RwLock<Option<Arc<Tunnel>>>,
}

impl StatsSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn attach_stack(&self, stack: StackHandle) {
        *self.stack.write() = Some(stack);
    }

    pub(crate) fn attach_names(&self, names: Arc<NameRecordCache>) {
        *self.names.write() = Some(names);
    }

    pub(crate) fn attach_tunnel(&self, tunnel: Arc<Tunnel>) {
        *self.tunnel.write() = Some(tunnel);
    }

    pub(crate) fn clear(&self) {
        self.stack.write().take();
        self.names.write().take();
        self.tunnel.write().take();
    }

    pub fn snapshot(&self) -> EngineStats {
        let stack = self.stack.read().as_ref().map(|s| s.stats());
        let fake_ip = self.names.read().as_ref().map(|names| {
            let pool = names.pool();
            FakeIpStats {
                network: pool.network(),
                usable: pool.usable(),
                records: pool.len(),
            }
        });
        let (udp_sessions, tcp_sessions) = self
            .tunnel
            .read()
            .as_ref()
            .map_or((0, 0), |t| (t.active_sessions(), t.tcp_sessions()));

        EngineStats {
            stack,
            fake_ip,
            udp_sessions,
            tcp_sessions,
        }
    }
}
