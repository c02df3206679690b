//! DnsInterceptor behaviour against a recording writer and a local upstream

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use parking_lot::Mutex;
use sox_dns::{DnsInterceptor, ExchangerOptions, NameRecordCache, UpstreamExchanger};
use sox_stack::{DatagramWriter, FlowId, PacketInterceptor};
use tokio::net::UdpSocket;

type Written = Vec<(SocketAddr, SocketAddr, Vec<u8>)>;

#[derive(Default)]
struct RecordingWriter {
    written: Mutex<Written>,
}

impl DatagramWriter for RecordingWriter {
    fn write_udp(&self, from: SocketAddr, to: SocketAddr, payload: &[u8]) -> sox_stack::Result<()> {
        self.written.lock().push((from, to, payload.to_vec()));
        Ok(())
    }
}

fn client() -> SocketAddr {
    "10.0.0.2:41000".parse().unwrap()
}

fn resolver(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), port)
}

fn query(id: u16, names: &[(&str, RecordType)]) -> Vec<u8> {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    for (name, rtype) in names {
        msg.add_query(Query::query(Name::from_str(name).unwrap(), *rtype));
    }
    msg.to_vec().unwrap()
}

fn build(
    cidr: &str,
    upstream: SocketAddr,
) -> (Arc<DnsInterceptor>, Arc<RecordingWriter>, Arc<dyn DatagramWriter>) {
    build_with(cidr, upstream, ExchangerOptions::default())
}

fn build_with(
    cidr: &str,
    upstream: SocketAddr,
    options: ExchangerOptions,
) -> (Arc<DnsInterceptor>, Arc<RecordingWriter>, Arc<dyn DatagramWriter>) {
    let cache = Arc::new(
        NameRecordCache::new(cidr)
            .unwrap()
            .with_ttl(Duration::from_secs(60)),
    );
    let exchanger = UpstreamExchanger::new(upstream, options);
    let interceptor = Arc::new(DnsInterceptor::new(cache, exchanger).unwrap());
    interceptor.enable();

    let recorder = Arc::new(RecordingWriter::default());
    let writer: Arc<dyn DatagramWriter> = recorder.clone();
    (interceptor, recorder, writer)
}

fn a_answers(bytes: &[u8]) -> Vec<Ipv4Addr> {
    let msg = Message::from_vec(bytes).unwrap();
    msg.answers()
        .iter()
        .filter_map(|r| match r.data() {
            RData::A(a) => Some(a.0),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_a_query_gets_fake_address() {
    let (interceptor, recorder, writer) = build("198.18.0.0/15", "127.0.0.1:9".parse().unwrap());
    let flow = FlowId::from_inbound(client(), resolver(53));

    assert!(interceptor.intercept(&flow, &query(0x1234, &[("a.example.", RecordType::A)]), &writer));
    assert!(interceptor.intercept(&flow, &query(0x1235, &[("b.example.", RecordType::A)]), &writer));

    let written = recorder.written.lock().clone();
    assert_eq!(written.len(), 2);

    let (from, to, bytes) = &written[0];
    assert_eq!(*from, resolver(53));
    assert_eq!(*to, client());

    let response = Message::from_vec(bytes).unwrap();
    assert_eq!(response.id(), 0x1234);
    assert_eq!(response.message_type(), MessageType::Response);
    assert!(response.recursion_desired());
    assert!(response.recursion_available());
    assert_eq!(response.queries().len(), 1);
    assert_eq!(response.answers()[0].ttl(), 60);
    assert_eq!(a_answers(bytes), vec![Ipv4Addr::new(198, 18, 0, 1)]);
    assert_eq!(a_answers(&written[1].2), vec![Ipv4Addr::new(198, 18, 0, 2)]);

    assert_eq!(
        interceptor
            .cache()
            .lookup_name(IpAddr::V4(Ipv4Addr::new(198, 18, 0, 1))),
        Some("a.example".to_string())
    );
}

#[tokio::test]
async fn test_repeat_query_is_stable() {
    let (interceptor, recorder, writer) = build("198.18.0.0/15", "127.0.0.1:9".parse().unwrap());
    let flow = FlowId::from_inbound(client(), resolver(53));

    interceptor.intercept(&flow, &query(1, &[("same.test.", RecordType::A)]), &writer);
    interceptor.intercept(&flow, &query(2, &[("SAME.test.", RecordType::A)]), &writer);

    let written = recorder.written.lock().clone();
    assert_eq!(a_answers(&written[0].2), a_answers(&written[1].2));
}

#[tokio::test]
async fn test_multiple_questions_answered_in_order() {
    let (interceptor, recorder, writer) = build("10.8.0.0/24", "127.0.0.1:9".parse().unwrap());
    let flow = FlowId::from_inbound(client(), resolver(53));

    let q = query(
        7,
        &[("one.test.", RecordType::A), ("two.test.", RecordType::A)],
    );
    assert!(interceptor.intercept(&flow, &q, &writer));

    let written = recorder.written.lock().clone();
    assert_eq!(
        a_answers(&written[0].2),
        vec![Ipv4Addr::new(10, 8, 0, 1), Ipv4Addr::new(10, 8, 0, 2)]
    );
}

#[tokio::test]
async fn test_non_dns_port_and_garbage_fall_through() {
    let (interceptor, recorder, writer) = build("198.18.0.0/15", "127.0.0.1:9".parse().unwrap());

    let other_port = FlowId::from_inbound(client(), resolver(5353));
    assert!(!interceptor.intercept(
        &other_port,
        &query(1, &[("a.test.", RecordType::A)]),
        &writer
    ));

    let dns = FlowId::from_inbound(client(), resolver(53));
    assert!(!interceptor.intercept(&dns, b"not dns at all", &writer));

    assert!(recorder.written.lock().is_empty());
    assert!(interceptor.cache().pool().is_empty());
}

#[tokio::test]
async fn test_disabled_interceptor_passes() {
    let (interceptor, _recorder, writer) = build("198.18.0.0/15", "127.0.0.1:9".parse().unwrap());
    interceptor.disable();

    let flow = FlowId::from_inbound(client(), resolver(53));
    assert!(!interceptor.intercept(&flow, &query(1, &[("a.test.", RecordType::A)]), &writer));
}

#[tokio::test]
async fn test_exhausted_pool_drops_silently() {
    let (interceptor, recorder, writer) = build("10.9.0.0/30", "127.0.0.1:9".parse().unwrap());
    let flow = FlowId::from_inbound(client(), resolver(53));

    for (i, name) in ["a.test.", "b.test.", "c.test."].iter().enumerate() {
        assert!(interceptor.intercept(&flow, &query(i as u16, &[(*name, RecordType::A)]), &writer));
    }
    // Two usable addresses, so the third query got no reply
    assert_eq!(recorder.written.lock().len(), 2);
}

#[tokio::test]
async fn test_aaaa_is_forwarded_verbatim() {
    let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();

    let (interceptor, recorder, writer) = build("198.18.0.0/15", upstream_addr);
    let flow = FlowId::from_inbound(client(), resolver(53));
    let q = query(0x4242, &[("v6.example.", RecordType::AAAA)]);

    assert!(interceptor.intercept(&flow, &q, &writer));

    let mut buf = [0u8; 512];
    let (n, peer) = tokio::time::timeout(Duration::from_secs(2), upstream.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], &q[..]);
    upstream.send_to(b"upstream-answer", peer).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if let Some((from, to, bytes)) = recorder.written.lock().first().cloned() {
            assert_eq!(from, resolver(53));
            assert_eq!(to, client());
            assert_eq!(bytes, b"upstream-answer".to_vec());
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "no upstream response relayed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(interceptor.cache().pool().is_empty());
}

#[tokio::test]
async fn test_missing_ttl_is_not_configured() {
    let cache = Arc::new(NameRecordCache::new("198.18.0.0/15").unwrap());
    let exchanger = UpstreamExchanger::new("127.0.0.1:9".parse().unwrap(), ExchangerOptions::default());
    let err = DnsInterceptor::new(cache, exchanger).err().unwrap();
    assert!(err.is_config_error());
}

#[tokio::test]
async fn test_failed_question_releases_new_records() {
    let (interceptor, recorder, writer) = build("10.9.0.0/30", "127.0.0.1:9".parse().unwrap());
    let flow = FlowId::from_inbound(client(), resolver(53));
    let cache = interceptor.cache().clone();

    assert!(interceptor.intercept(&flow, &query(1, &[("keep.test.", RecordType::A)]), &writer));
    let kept = cache.lookup_address("keep.test", std::time::Instant::now()).unwrap();

    // One address left: "fresh" takes it, "late" finds the pool exhausted
    let q = query(
        2,
        &[
            ("fresh.test.", RecordType::A),
            ("keep.test.", RecordType::A),
            ("late.test.", RecordType::A),
        ],
    );
    assert!(interceptor.intercept(&flow, &q, &writer));

    assert_eq!(recorder.written.lock().len(), 1);
    assert_eq!(cache.pool().len(), 1);
    let now = std::time::Instant::now();
    assert_eq!(cache.lookup_address("keep.test", now), Some(kept));
    assert_eq!(cache.lookup_address("fresh.test", now), None);
    assert_eq!(cache.lookup_address("late.test", now), None);

    // The released address is usable by the next query
    assert!(interceptor.intercept(&flow, &query(3, &[("next.test.", RecordType::A)]), &writer));
    assert_eq!(recorder.written.lock().len(), 2);
}

#[tokio::test]
async fn test_full_upstream_queue_still_consumes() {
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let options = ExchangerOptions {
        workers: 1,
        queue_depth: 1,
        timeout: Duration::from_secs(30),
    };
    let (interceptor, recorder, writer) =
        build_with("198.18.0.0/15", silent.local_addr().unwrap(), options);
    let flow = FlowId::from_inbound(client(), resolver(53));

    for id in 0..8u16 {
        let q = query(id, &[("v6.example.", RecordType::AAAA)]);
        assert!(interceptor.intercept(&flow, &q, &writer));
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(recorder.written.lock().is_empty());
    assert!(interceptor.cache().pool().is_empty());
}

#[tokio::test]
async fn test_failed_exchange_writes_nothing() {
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let options = ExchangerOptions {
        timeout: Duration::from_millis(100),
        ..ExchangerOptions::default()
    };
    let (interceptor, recorder, writer) =
        build_with("198.18.0.0/15", silent.local_addr().unwrap(), options);
    let flow = FlowId::from_inbound(client(), resolver(53));

    let q = query(9, &[("v6.example.", RecordType::AAAA)]);
    assert!(interceptor.intercept(&flow, &q, &writer));

    let mut buf = [0u8; 512];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), silent.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], &q[..]);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(recorder.written.lock().is_empty());
}

#[tokio::test]
async fn test_mixed_question_types_are_forwarded() {
    let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (interceptor, recorder, writer) = build("198.18.0.0/15", upstream.local_addr().unwrap());
    let flow = FlowId::from_inbound(client(), resolver(53));

    let q = query(
        0x0101,
        &[("both.example.", RecordType::A), ("both.example.", RecordType::AAAA)],
    );
    assert!(interceptor.intercept(&flow, &q, &writer));

    let mut buf = [0u8; 512];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), upstream.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], &q[..]);
    assert!(recorder.written.lock().is_empty());
    assert!(interceptor.cache().pool().is_empty());
}
