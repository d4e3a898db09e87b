//! `PingProxy` and `PingProxyPool`: answering tunneled ICMP Echo Requests
//! by reissuing them from the host network stack (spec §4.F).
//!
//! Sending a raw ICMP echo requires a `SOCK_RAW`/`CAP_NET_RAW` socket, the
//! same primitive the Fuchsia `ping` library wraps with `socket2`. That
//! call is behind the [`IcmpEchoTransport`] trait so the pool's eviction
//! and dedup logic can be exercised without host raw-socket privileges;
//! [`Socket2EchoTransport`] is the real implementation used in production.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use etherparse::IpNumber;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::error::{Result, TunnelError};
use crate::packet::icmp::{self, IcmpEchoHeader};
use crate::packet::IpPacket;
use crate::telemetry::Metrics;

/// Default round-trip timeout for a single echo, per spec §4.F.
pub const DEFAULT_ICMP_TIMEOUT: Duration = Duration::from_secs(30);

/// The Rust expression of the source's `PacketProxyReceiver`. Calls MUST
/// NOT block; a receiver that needs to do I/O dispatches to its own task.
pub trait PingReceiver: Send + Sync {
    fn on_packet_received(&self, ip: IpPacket);
    fn on_new_remote_endpoint(&self, protocol: IpNumber, remote: IpAddr);
    fn on_new_endpoint(&self, protocol: IpNumber, local: IpAddr, remote: IpAddr, is_new_local: bool, is_new_remote: bool);
}

/// Issues one native ICMP echo and returns the reply payload (IP header
/// stripped). Swappable so [`PingProxyPool`]'s pooling/eviction behavior
/// can be tested without `CAP_NET_RAW`.
pub trait IcmpEchoTransport: Send + Sync {
    fn echo(&self, source: Ipv4Addr, destination: Ipv4Addr, request: &[u8], timeout: Duration) -> std::io::Result<Vec<u8>>;
}

/// A blocking raw-socket ICMP echo, run on a blocking thread by the caller.
pub struct Socket2EchoTransport;

impl IcmpEchoTransport for Socket2EchoTransport {
    fn echo(&self, source: Ipv4Addr, destination: Ipv4Addr, request: &[u8], timeout: Duration) -> std::io::Result<Vec<u8>> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
        socket.set_read_timeout(Some(timeout))?;
        socket.bind(&SockAddr::from(SocketAddr::new(IpAddr::V4(source), 0)))?;
        socket.send_to(request, &SockAddr::from(SocketAddr::new(IpAddr::V4(destination), 0)))?;

        // Hand the fd to a `std::net::UdpSocket` so the receive path can use
        // its plain `&mut [u8]` `recv_from` instead of socket2's
        // `MaybeUninit`-based one. The conversion only changes the recv
        // buffer API, not the underlying `SOCK_RAW` socket type.
        let socket: std::net::UdpSocket = socket.into();
        let mut buf = [0u8; 1500];
        loop {
            let (n, _) = socket.recv_from(&mut buf)?;
            // Raw IPv4 sockets on Linux hand back the IP header too; strip it.
            let received = &buf[..n];
            if received.len() < 20 {
                continue;
            }
            let ihl = (received[0] & 0x0F) as usize * 4;
            if received.len() < ihl + icmp::ICMP_HEADER_LEN {
                continue;
            }
            return Ok(received[ihl..].to_vec());
        }
    }
}

/// One native ICMP echo client bound to a specific source address.
pub struct PingProxy {
    source: Ipv4Addr,
    timeout: Duration,
    receiver: Arc<dyn PingReceiver>,
    transport: Arc<dyn IcmpEchoTransport>,
    send_lock: AsyncMutex<()>,
    seen_remotes: Mutex<HashSet<Ipv4Addr>>,
    seen_local: Mutex<bool>,
}

impl PingProxy {
    pub fn new(source: Ipv4Addr, timeout: Duration, receiver: Arc<dyn PingReceiver>) -> Self {
        Self::with_transport(source, timeout, receiver, Arc::new(Socket2EchoTransport))
    }

    pub fn with_transport(
        source: Ipv4Addr,
        timeout: Duration,
        receiver: Arc<dyn PingReceiver>,
        transport: Arc<dyn IcmpEchoTransport>,
    ) -> Self {
        Self {
            source,
            timeout,
            receiver,
            transport,
            send_lock: AsyncMutex::new(()),
            seen_remotes: Mutex::new(HashSet::new()),
            seen_local: Mutex::new(false),
        }
    }

    pub fn source(&self) -> Ipv4Addr {
        self.source
    }

    /// Accepts one ICMP Echo Request [`IpPacket`], issues the host echo,
    /// and hands the constructed reply to the registered receiver.
    /// A timed-out echo is logged and treated as "no reply", not a failure
    /// of the proxy itself.
    pub async fn send_packet(&self, ip: IpPacket) -> Result<()> {
        let request_header = IcmpEchoHeader::parse(ip.payload())
            .ok_or_else(|| TunnelError::MalformedPacket("truncated ICMP header".into()))?;
        if !request_header.is_echo_request() {
            return Err(TunnelError::MalformedPacket("ping proxy only accepts echo requests".into()));
        }

        let destination = ip.destination();
        self.announce_endpoints(destination);

        let request_payload = ip.payload()[icmp::ICMP_HEADER_LEN..].to_vec();
        let request_bytes = IcmpEchoHeader { checksum: 0, ..request_header }.write_with_checksum(&request_payload);

        let _guard = self.send_lock.lock().await;
        let source = self.source;
        let timeout = self.timeout;
        let transport = self.transport.clone();
        let handle =
            tokio::task::spawn_blocking(move || transport.echo(source, destination, &request_bytes, timeout));

        let reply_bytes = match tokio::time::timeout(timeout, handle).await {
            Err(_) => {
                warn!(%destination, "icmp echo timed out waiting for reply");
                return Ok(());
            }
            Ok(Err(join_err)) => return Err(TunnelError::SocketFatal(join_err.to_string())),
            Ok(Ok(Err(io_err))) => return Err(TunnelError::Io(io_err)),
            Ok(Ok(Ok(bytes))) => bytes,
        };

        IcmpEchoHeader::parse(&reply_bytes)
            .ok_or_else(|| TunnelError::MalformedPacket("truncated ICMP reply".into()))?;
        let reply_payload = reply_bytes[icmp::ICMP_HEADER_LEN..].to_vec();

        let echo_reply = IcmpEchoHeader {
            icmp_type: icmp::TYPE_ECHO_REPLY,
            code: 0,
            checksum: 0,
            id: request_header.id,
            sequence: request_header.sequence,
        };
        let reply_ip = IpPacket::build(
            destination,
            source,
            64,
            IpNumber::ICMP,
            echo_reply.write_with_checksum(&reply_payload),
        )?;

        self.receiver.on_packet_received(reply_ip);
        Ok(())
    }

    fn announce_endpoints(&self, destination: Ipv4Addr) {
        let is_new_remote = self.seen_remotes.lock().unwrap().insert(destination);
        if is_new_remote {
            self.receiver.on_new_remote_endpoint(IpNumber::ICMP, IpAddr::V4(destination));
        }
        let mut seen_local = self.seen_local.lock().unwrap();
        let is_new_local = !*seen_local;
        *seen_local = true;
        if is_new_local || is_new_remote {
            self.receiver.on_new_endpoint(
                IpNumber::ICMP,
                IpAddr::V4(self.source),
                IpAddr::V4(destination),
                is_new_local,
                is_new_remote,
            );
        }
    }
}

struct PoolEntry {
    proxy: Arc<PingProxy>,
    last_used: Instant,
}

/// A bounded `sourceIp -> PingProxy` map with least-recently-used eviction.
pub struct PingProxyPool {
    receiver: Arc<dyn PingReceiver>,
    max_client_count: usize,
    icmp_timeout: Duration,
    transport: Arc<dyn IcmpEchoTransport>,
    metrics: Mutex<Option<Arc<Metrics>>>,
    entries: Mutex<HashMap<Ipv4Addr, PoolEntry>>,
}

impl PingProxyPool {
    pub fn new(receiver: Arc<dyn PingReceiver>, max_client_count: usize, icmp_timeout: Duration) -> Self {
        Self::with_transport(receiver, max_client_count, icmp_timeout, Arc::new(Socket2EchoTransport))
    }

    pub fn with_transport(
        receiver: Arc<dyn PingReceiver>,
        max_client_count: usize,
        icmp_timeout: Duration,
        transport: Arc<dyn IcmpEchoTransport>,
    ) -> Self {
        Self {
            receiver,
            max_client_count,
            icmp_timeout,
            transport,
            metrics: Mutex::new(None),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_metrics(&self, metrics: Arc<Metrics>) {
        *self.metrics.lock().unwrap() = Some(metrics);
    }

    pub fn size(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Looks up (or creates, evicting the LRU entry if at capacity) the
    /// proxy for `ip.source()`, then dispatches the echo. The map is only
    /// locked across the lookup/insert/evict, never across the I/O below.
    pub async fn send_packet(&self, ip: IpPacket) -> Result<()> {
        let source = ip.source();
        let metrics = self.metrics.lock().unwrap().clone();
        let proxy = {
            let mut entries = self.entries.lock().unwrap();
            if let Some(entry) = entries.get_mut(&source) {
                entry.last_used = Instant::now();
                entry.proxy.clone()
            } else {
                if entries.len() >= self.max_client_count {
                    if let Some(lru_key) = entries.iter().min_by_key(|(_, e)| e.last_used).map(|(k, _)| *k) {
                        entries.remove(&lru_key);
                        if let Some(metrics) = &metrics {
                            metrics.ping_proxy_evicted();
                        }
                    }
                }
                let proxy = Arc::new(PingProxy::with_transport(
                    source,
                    self.icmp_timeout,
                    self.receiver.clone(),
                    self.transport.clone(),
                ));
                entries.insert(source, PoolEntry { proxy: proxy.clone(), last_used: Instant::now() });
                if let Some(metrics) = &metrics {
                    metrics.ping_proxy_created();
                }
                proxy
            }
        };
        proxy.send_packet(ip).await
    }
}
