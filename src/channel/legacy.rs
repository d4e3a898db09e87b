//! `UdpChannel`: the legacy framing from spec §4.C — one UDP socket, one
//! session, no multiplexing. See [`crate::transmitter`] for the newer
//! shared-socket format multiple sessions can share.
//!
//! Wire format per datagram:
//!
//! ```text
//! client -> server:  sessionId(4) | cryptoPos(8) | Enc( sessionId(4) | packet* )
//! server -> client:                 cryptoPos(8) | Enc( sessionId(4) | packet* )
//! ```
//!
//! The post-cipher `sessionId` is a redundant integrity witness: a
//! datagram that decrypts to the wrong session id is dropped as
//! [`TunnelError::Unauthorized`], never delivered to the sink.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{
    new_last_activity, touch_last_activity, Channel, ChannelState, ChannelStateCell, MetricsSlot,
    PacketSink, SinkSlot, TrafficCounters,
};
use crate::crypto::{BufferCryptor, SERVER_POSITION_BASE};
use crate::error::{Result, TunnelError};
use crate::packet::{IpPacket, PacketCodec};
use crate::telemetry::Metrics;

/// Maximum UDP payload this crate will attempt to send or parse. Datagrams
/// larger than typical path MTU just get lost on real networks; this is a
/// generous ceiling against malformed-length amplification, not a tuning
/// knob.
const MAX_DATAGRAM: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Client,
    Server,
}

impl ChannelRole {
    fn position_base(self) -> i64 {
        match self {
            ChannelRole::Client => 0,
            ChannelRole::Server => SERVER_POSITION_BASE,
        }
    }

    /// Plaintext header length written before the encrypted portion of an
    /// *outgoing* datagram.
    fn outgoing_header_len(self) -> usize {
        match self {
            ChannelRole::Client => 12, // sessionId(4) + cryptoPos(8)
            ChannelRole::Server => 8,  // cryptoPos(8)
        }
    }

    fn writes_plaintext_session_id(self) -> bool {
        matches!(self, ChannelRole::Client)
    }
}

pub struct UdpChannel {
    self_ref: Weak<UdpChannel>,
    id: String,
    socket: UdpSocket,
    cryptor: BufferCryptor,
    session_id: u32,
    role: ChannelRole,
    mtu: usize,
    state: ChannelStateCell,
    connected: AtomicBool,
    last_activity: ArcSwap<Instant>,
    traffic: TrafficCounters,
    sink: SinkSlot,
    metrics: MetricsSlot,
    cancel: CancellationToken,
    receive_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl UdpChannel {
    /// Binds a fresh local socket, connects it to `remote`, and returns a
    /// channel in the `New` state. Call [`Channel::start`] to begin the
    /// receive loop.
    pub async fn connect(
        id: impl Into<String>,
        local: SocketAddr,
        remote: SocketAddr,
        key: [u8; 16],
        session_id: u32,
        role: ChannelRole,
        mtu: usize,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        let id = id.into();
        Ok(Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            id,
            socket,
            cryptor: BufferCryptor::new(key),
            session_id,
            role,
            mtu,
            state: ChannelStateCell::new(),
            connected: AtomicBool::new(false),
            last_activity: new_last_activity(),
            traffic: TrafficCounters::default(),
            sink: SinkSlot::default(),
            metrics: MetricsSlot::default(),
            cancel: CancellationToken::new(),
            receive_task: AsyncMutex::new(None),
        }))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Rebinds the socket's default peer. Useful when a channel is
    /// constructed before the remote's ephemeral port is known (e.g. two
    /// loopback test peers bootstrapping off each other's `local_addr`).
    pub async fn reconnect(&self, remote: SocketAddr) -> Result<()> {
        self.socket.connect(remote).await?;
        Ok(())
    }

    fn encode_datagram(&self, packets: &[IpPacket]) -> Result<Vec<u8>> {
        let packets_len: usize = packets.iter().map(|p| p.total_length()).sum();
        let budget = self.mtu.saturating_sub(self.role.outgoing_header_len());
        if packets_len > budget {
            return Err(TunnelError::Oversized { got: packets_len, max: budget });
        }
        let inner_len = 4 + packets_len;

        let crypto_pos = self.traffic.take_send_position(self.role.position_base(), inner_len as u64);

        let header_len = self.role.outgoing_header_len();
        let mut out = Vec::with_capacity(header_len + inner_len);
        if self.role.writes_plaintext_session_id() {
            out.extend_from_slice(&self.session_id.to_le_bytes());
        }
        out.extend_from_slice(&crypto_pos.to_le_bytes());

        let enc_start = out.len();
        out.extend_from_slice(&self.session_id.to_le_bytes());
        for packet in packets {
            out.extend_from_slice(&packet.to_bytes());
        }
        let enc_end = out.len();
        self.cryptor.cipher(&mut out, enc_start, enc_end, crypto_pos);

        Ok(out)
    }

    /// Parses and decrypts one received datagram into a batch of packets.
    /// The expected incoming format is the *other* role's outgoing format
    /// (a client receives server-framed datagrams and vice versa).
    fn decode_datagram(&self, datagram: &[u8]) -> Result<Vec<IpPacket>> {
        let incoming_header_len = match self.role {
            ChannelRole::Client => 8,  // receiving server-framed datagrams
            ChannelRole::Server => 12, // receiving client-framed datagrams
        };
        if datagram.len() < incoming_header_len + 4 {
            return Err(TunnelError::MalformedPacket("datagram shorter than header".into()));
        }

        let crypto_pos_offset = incoming_header_len - 8;
        let crypto_pos = i64::from_le_bytes(
            datagram[crypto_pos_offset..crypto_pos_offset + 8].try_into().unwrap(),
        );

        let mut body = datagram[incoming_header_len..].to_vec();
        self.cryptor.cipher(&mut body, 0, body.len(), crypto_pos);

        let received_session_id = u32::from_le_bytes(body[0..4].try_into().unwrap());
        if received_session_id != self.session_id {
            return Err(TunnelError::Unauthorized);
        }

        let mut packets = Vec::new();
        let mut idx = 4;
        while idx < body.len() {
            packets.push(PacketCodec::read_next(&body, &mut idx)?);
        }
        Ok(packets)
    }

    async fn run_receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut pending: Vec<IpPacket> = Vec::new();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.socket.recv(&mut buf) => {
                    match result {
                        Ok(n) => self.handle_datagram(&buf[..n], &mut pending),
                        Err(e) => {
                            if is_fatal(&e) {
                                warn!(channel = %self.id, error = %e, "fatal socket error, disposing channel");
                                self.state.set(ChannelState::Disposed);
                                break;
                            }
                            warn!(channel = %self.id, error = %e, "transient socket error, continuing");
                            continue;
                        }
                    }
                }
            }

            // Drain whatever else is already queued without awaiting, so a
            // burst of datagrams is delivered as one batch.
            loop {
                match self.socket.try_recv(&mut buf) {
                    Ok(n) => self.handle_datagram(&buf[..n], &mut pending),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        if is_fatal(&e) {
                            self.state.set(ChannelState::Disposed);
                        }
                        break;
                    }
                }
            }

            if !pending.is_empty() {
                let batch = std::mem::take(&mut pending);
                if let Some(sink) = self.sink.load_full() {
                    sink.on_packet_received(&self.id, batch);
                }
            }

            if self.state.get() == ChannelState::Disposed {
                break;
            }
        }
        debug!(channel = %self.id, "receive loop exited");
    }

    fn handle_datagram(&self, datagram: &[u8], pending: &mut Vec<IpPacket>) {
        self.connected.store(true, Ordering::Release);
        touch_last_activity(&self.last_activity);
        match self.decode_datagram(datagram) {
            Ok(packets) => {
                self.traffic.add_received(datagram.len() as u64);
                if let Some(metrics) = self.metrics.load_full() {
                    metrics.record_received(packets.len() as u64, datagram.len() as u64);
                }
                pending.extend(packets);
            }
            Err(TunnelError::Unauthorized) => {
                warn!(channel = %self.id, "dropping datagram: session id mismatch");
                if let Some(metrics) = self.metrics.load_full() {
                    metrics.record_dropped(1);
                }
            }
            Err(e) => {
                warn!(channel = %self.id, error = %e, "dropping malformed datagram");
                if let Some(metrics) = self.metrics.load_full() {
                    metrics.record_dropped(1);
                }
            }
        }
    }
}

fn is_fatal(e: &std::io::Error) -> bool {
    matches!(e.kind(), std::io::ErrorKind::InvalidInput | std::io::ErrorKind::NotConnected)
}

#[async_trait]
impl Channel for UdpChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> ChannelState {
        self.state.get()
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn last_activity(&self) -> Instant {
        **self.last_activity.load()
    }

    fn traffic(&self) -> (u64, u64) {
        (self.traffic.sent(), self.traffic.received())
    }

    fn mtu_budget(&self) -> usize {
        self.mtu.saturating_sub(self.role.outgoing_header_len())
    }

    fn set_sink(&self, sink: Arc<dyn PacketSink>) {
        self.sink.store(Some(sink));
    }

    fn set_metrics(&self, metrics: Arc<Metrics>) {
        self.metrics.store(Some(metrics));
    }

    async fn start(&self) -> Result<()> {
        if self.state.get() != ChannelState::New {
            return Ok(());
        }
        let Some(strong) = self.self_ref.upgrade() else {
            return Err(TunnelError::SocketFatal("channel dropped before start".into()));
        };
        self.state.set(ChannelState::Started);
        if let Some(metrics) = self.metrics.load_full() {
            metrics.channel_started();
        }
        let handle = tokio::spawn(strong.run_receive_loop());
        *self.receive_task.lock().await = Some(handle);
        info!(channel = %self.id, "channel started");
        Ok(())
    }

    async fn send_packets(&self, packets: &[IpPacket]) -> Result<()> {
        if self.state() != ChannelState::Started {
            return Err(TunnelError::ChannelNotStarted);
        }
        let datagram = self.encode_datagram(packets)?;
        let expected = datagram.len();
        let wrote = self.socket.send(&datagram).await?;
        if wrote != expected {
            return Err(TunnelError::ShortWrite { wrote, expected });
        }
        touch_last_activity(&self.last_activity);
        self.connected.store(true, Ordering::Release);
        if let Some(metrics) = self.metrics.load_full() {
            metrics.record_sent(packets.len() as u64, wrote as u64);
        }
        Ok(())
    }

    async fn dispose(&self) {
        if self.state.get() == ChannelState::Disposed {
            return;
        }
        self.cancel.cancel();
        self.state.set(ChannelState::Disposed);
        if let Some(handle) = self.receive_task.lock().await.take() {
            let _ = handle.await;
        }
        if let Some(metrics) = self.metrics.load_full() {
            metrics.channel_disposed();
        }
        info!(channel = %self.id, "channel disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::PacketSink;
    use etherparse::IpNumber;
    use std::net::Ipv4Addr;
    use tokio::sync::mpsc;

    struct ChannelSink(mpsc::UnboundedSender<Vec<IpPacket>>);

    impl PacketSink for ChannelSink {
        fn on_packet_received(&self, _channel_id: &str, batch: Vec<IpPacket>) {
            let _ = self.0.send(batch);
        }
    }

    fn sample_packets() -> Vec<IpPacket> {
        vec![IpPacket::build(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            64,
            IpNumber::ICMP,
            vec![8, 0, 0, 0, 0, 1, 0, 1, b'h', b'i'],
        )
        .unwrap()]
    }

    #[tokio::test]
    async fn loopback_round_trip_delivers_identical_packets() {
        let shared_key = [42u8; 16];
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();

        let server =
            UdpChannel::connect("server", any, any, shared_key, 200, ChannelRole::Server, 1500)
                .await
                .unwrap();
        let client_bootstrap_addr = server.local_addr().unwrap();
        let client = UdpChannel::connect(
            "client",
            any,
            client_bootstrap_addr,
            shared_key,
            200,
            ChannelRole::Client,
            1500,
        )
        .await
        .unwrap();
        let client_addr = client.local_addr().unwrap();
        server.socket.connect(client_addr).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        server.set_sink(Arc::new(ChannelSink(tx)));

        Channel::start(client.as_ref()).await.unwrap();
        Channel::start(server.as_ref()).await.unwrap();

        let sent = sample_packets();
        Channel::send_packets(client.as_ref(), &sent).await.unwrap();

        let received = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("server should receive within timeout")
            .expect("channel should not close");

        assert_eq!(received.len(), sent.len());
        assert_eq!(received[0].payload(), sent[0].payload());

        Channel::dispose(client.as_ref()).await;
        Channel::dispose(server.as_ref()).await;
    }

    #[tokio::test]
    async fn metrics_track_sends_and_receives_when_attached() {
        let shared_key = [3u8; 16];
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();

        let server =
            UdpChannel::connect("server", any, any, shared_key, 77, ChannelRole::Server, 1500)
                .await
                .unwrap();
        let client = UdpChannel::connect(
            "client",
            any,
            server.local_addr().unwrap(),
            shared_key,
            77,
            ChannelRole::Client,
            1500,
        )
        .await
        .unwrap();
        server.socket.connect(client.local_addr().unwrap()).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        server.set_sink(Arc::new(ChannelSink(tx)));

        let client_metrics = Arc::new(crate::telemetry::Metrics::new());
        let server_metrics = Arc::new(crate::telemetry::Metrics::new());
        Channel::set_metrics(client.as_ref(), client_metrics.clone());
        Channel::set_metrics(server.as_ref(), server_metrics.clone());

        Channel::start(client.as_ref()).await.unwrap();
        Channel::start(server.as_ref()).await.unwrap();
        assert_eq!(client_metrics.snapshot().active_channels, 1);

        Channel::send_packets(client.as_ref(), &sample_packets()).await.unwrap();
        rx.recv().await.expect("server should receive the batch");

        assert_eq!(client_metrics.snapshot().packets_sent, 1);
        assert_eq!(server_metrics.snapshot().packets_received, 1);

        Channel::dispose(client.as_ref()).await;
        Channel::dispose(server.as_ref()).await;
        assert_eq!(client_metrics.snapshot().active_channels, 0);
    }

    #[tokio::test]
    async fn session_id_mismatch_is_dropped_silently() {
        let shared_key = [7u8; 16];
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();

        let server =
            UdpChannel::connect("server", any, any, shared_key, 999, ChannelRole::Server, 1500)
                .await
                .unwrap();
        let client = UdpChannel::connect(
            "client",
            any,
            server.local_addr().unwrap(),
            shared_key,
            111, // different session id than the server expects
            ChannelRole::Client,
            1500,
        )
        .await
        .unwrap();
        server.socket.connect(client.local_addr().unwrap()).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        server.set_sink(Arc::new(ChannelSink(tx)));

        Channel::start(client.as_ref()).await.unwrap();
        Channel::start(server.as_ref()).await.unwrap();

        Channel::send_packets(client.as_ref(), &sample_packets()).await.unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_millis(300), rx.recv()).await;
        assert!(result.is_err(), "mismatched session id must never reach the sink");

        Channel::dispose(client.as_ref()).await;
        Channel::dispose(server.as_ref()).await;
    }
}
