//! Inline DNS interception on the packet path
//!
//! A-queries sent to port 53 are answered on the spot with an address from
//! the fake-IP pool, so the real name is never resolved locally. Queries
//! that ask for anything else are passed to the upstream exchanger
//! unchanged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use hickory_proto::op::{Header, Message, MessageType, OpCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{DNSClass, RData, Record, RecordType};
use sox_stack::{DatagramWriter, FlowId, PacketInterceptor};

use crate::cache::NameRecordCache;
use crate::config::DNS_PORT;
use crate::error::{Error, Result};
use crate::upstream::{ExchangeJob, UpstreamExchanger};

/// Answers A-queries from the fake-IP pool
pub struct DnsInterceptor {
    cache: Arc<NameRecordCache>,
    exchanger: UpstreamExchanger,
    ttl_secs: u32,
    enabled: AtomicBool,
}

impl DnsInterceptor {
    /// Build a disabled interceptor
    ///
    /// Fails with [`Error::NotConfigured`] if the cache has no TTL.
    pub fn new(cache: Arc<NameRecordCache>, exchanger: UpstreamExchanger) -> Result<Self> {
        let ttl = cache
            .ttl()
            .ok_or_else(|| Error::NotConfigured("remote DNS cache timeout".into()))?;
        let ttl_secs = u32::try_from(ttl.as_secs()).unwrap_or(u32::MAX).max(1);

        Ok(Self {
            cache,
            exchanger,
            ttl_secs,
            enabled: AtomicBool::new(false),
        })
    }

    /// Start intercepting
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    /// Stop intercepting; datagrams fall through to normal forwarding
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn cache(&self) -> &Arc<NameRecordCache> {
        &self.cache
    }

    /// Build the fake-IP response to an A-only query
    ///
    /// On failure, records created for earlier questions of the same query
    /// are released again; records that were already live are kept.
    fn answer(&self, request: &Message, now: Instant) -> Result<Vec<u8>> {
        let mut response = Message::new();
        response.set_header(Header::response_from_request(request.header()));
        response.set_recursion_available(true);

        let mut created: Vec<String> = Vec::new();
        for query in request.queries() {
            response.add_query(query.clone());
            let name = query.name().to_ascii();
            let existed = self.cache.lookup_address(&name, now).is_some();
            let address = match self.cache.resolve(&name, now) {
                Ok(address) => address,
                Err(e) => {
                    for name in &created {
                        self.cache.release(name);
                    }
                    return Err(e);
                }
            };
            if !existed {
                created.push(name);
            }
            log::debug!("[DNS] {} -> {}", query.name(), address);

            let mut record =
                Record::from_rdata(query.name().clone(), self.ttl_secs, RData::A(A(address)));
            record.set_dns_class(DNSClass::IN);
            response.add_answer(record);
        }

        response
            .to_vec()
            .map_err(|e| Error::Dns(format!("failed to encode DNS response: {}", e)))
    }
}

fn is_plain_a(query: &hickory_proto::op::Query) -> bool {
    query.query_type() == RecordType::A && query.query_class() == DNSClass::IN
}

impl PacketInterceptor for DnsInterceptor {
    fn intercept(&self, flow: &FlowId, payload: &[u8], replies: &Arc<dyn DatagramWriter>) -> bool {
        if !self.is_enabled() || flow.local_port != DNS_PORT {
            return false;
        }

        let request = match Message::from_vec(payload) {
            Ok(message) => message,
            Err(_) => return false,
        };
        if request.message_type() != MessageType::Query
            || request.op_code() != OpCode::Query
            || request.queries().is_empty()
        {
            return false;
        }

        if !request.queries().iter().all(is_plain_a) {
            let job = ExchangeJob {
                query: payload.to_vec(),
                server: flow.local(),
                client: flow.remote(),
                replies: replies.clone(),
            };
            if !self.exchanger.submit(job) {
                log::debug!("[DNS] dropped non-A query from {}", flow.remote());
            }
            return true;
        }

        match self.answer(&request, Instant::now()) {
            Ok(response) => {
                if let Err(e) = replies.write_udp(flow.local(), flow.remote(), &response) {
                    log::warn!("[DNS] cannot write response to {}: {}", flow.remote(), e);
                }
            }
            Err(e @ Error::PoolExhausted(_)) => {
                log::warn!("[DNS] {}, dropping query from {}", e, flow.remote());
            }
            Err(e) => {
                log::warn!("[DNS] cannot answer query from {}: {}", flow.remote(), e);
            }
        }
        true
    }
}
