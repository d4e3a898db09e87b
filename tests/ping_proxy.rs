//! Integration coverage for the PingProxyPool reuse/eviction scenario
//! (spec §8 scenario 1), driven through the public crate API with a fake
//! echo transport so the test doesn't need `CAP_NET_RAW`.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use etherparse::IpNumber;
use tunnel_core::packet::icmp::{self, IcmpEchoHeader};
use tunnel_core::ping::{IcmpEchoTransport, PingProxyPool, PingReceiver};
use tunnel_core::IpPacket;

struct LoopbackEchoTransport;

impl IcmpEchoTransport for LoopbackEchoTransport {
    fn echo(&self, _source: Ipv4Addr, _destination: Ipv4Addr, request: &[u8], _timeout: Duration) -> std::io::Result<Vec<u8>> {
        let request_header = IcmpEchoHeader::parse(request).unwrap();
        let payload = request[icmp::ICMP_HEADER_LEN..].to_vec();
        let reply_header = IcmpEchoHeader { icmp_type: icmp::TYPE_ECHO_REPLY, code: 0, checksum: 0, ..request_header };
        Ok(reply_header.write_with_checksum(&payload))
    }
}

struct CountingReceiver {
    received_count: AtomicUsize,
}

impl PingReceiver for CountingReceiver {
    fn on_packet_received(&self, _ip: IpPacket) {
        self.received_count.fetch_add(1, Ordering::AcqRel);
    }
    fn on_new_remote_endpoint(&self, _protocol: IpNumber, _remote: IpAddr) {}
    fn on_new_endpoint(&self, _protocol: IpNumber, _local: IpAddr, _remote: IpAddr, _is_new_local: bool, _is_new_remote: bool) {}
}

fn echo_request(source: Ipv4Addr, destination: Ipv4Addr, sequence: u16) -> IpPacket {
    let header = IcmpEchoHeader { icmp_type: icmp::TYPE_ECHO_REQUEST, code: 0, checksum: 0, id: 1, sequence };
    IpPacket::build(source, destination, 64, IpNumber::ICMP, header.write_with_checksum(b"scenario-1")).unwrap()
}

#[tokio::test]
async fn pool_reuse_scenario_from_the_spec() {
    let receiver = Arc::new(CountingReceiver { received_count: AtomicUsize::new(0) });
    let pool = PingProxyPool::with_transport(receiver.clone(), 3, Duration::from_secs(1), Arc::new(LoopbackEchoTransport));

    let loopback = Ipv4Addr::new(127, 0, 0, 1);
    let google_dns = Ipv4Addr::new(8, 8, 8, 8);
    let second_dest = Ipv4Addr::new(127, 0, 0, 2);

    pool.send_packet(echo_request(loopback, google_dns, 1)).await.unwrap();
    pool.send_packet(echo_request(loopback, second_dest, 1)).await.unwrap();
    pool.send_packet(echo_request(loopback, second_dest, 2)).await.unwrap();
    assert_eq!(receiver.received_count.load(Ordering::Acquire), 3);

    pool.send_packet(echo_request(loopback, second_dest, 3)).await.unwrap();
    assert_eq!(receiver.received_count.load(Ordering::Acquire), 4);
    assert_eq!(pool.size(), 1, "all four requests share one source address");
}
