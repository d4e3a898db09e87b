//! Channel: a long-lived, encrypted, bidirectional transport for batches
//! of [`IpPacket`]s.
//!
//! A `Channel` has exactly one owner (a [`crate::tunnel::Tunnel`]) for its
//! lifetime after attachment; before attachment it owns itself. See
//! [`ChannelState`] for the lifecycle and the module-level docs on
//! [`legacy::UdpChannel`] for the concrete wire format this crate ships.

pub mod legacy;

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::{ArcSwap, ArcSwapOption};
use async_trait::async_trait;

use crate::error::Result;
use crate::packet::IpPacket;
use crate::telemetry::Metrics;

/// `New -> Started -> Disposed`. Disposal is idempotent; there is no way
/// back to `Started` once `Disposed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    New,
    Started,
    Disposed,
}

impl ChannelState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ChannelState::New,
            1 => ChannelState::Started,
            _ => ChannelState::Disposed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ChannelState::New => 0,
            ChannelState::Started => 1,
            ChannelState::Disposed => 2,
        }
    }
}

/// Atomically-tracked channel lifecycle state.
#[derive(Default)]
pub struct ChannelStateCell(AtomicU8);

impl ChannelStateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(ChannelState::New.as_u8()))
    }

    pub fn get(&self) -> ChannelState {
        ChannelState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ChannelState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }
}

/// `(sent, received)` byte counters. `sent` is also the accumulator used
/// to derive the next cryptor position — see [`crate::crypto::BufferCryptor`].
#[derive(Default)]
pub struct TrafficCounters {
    sent: AtomicU64,
    received: AtomicU64,
}

impl TrafficCounters {
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Acquire)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Acquire)
    }

    /// Returns the position to encrypt at, then advances the counter by
    /// `len`. Single-writer discipline (enforced by the owning channel's
    /// send-side serialization) makes this safe without a CAS loop.
    pub fn take_send_position(&self, base: i64, len: u64) -> i64 {
        let prior = self.sent.fetch_add(len, Ordering::AcqRel);
        base + prior as i64
    }

    pub fn add_received(&self, len: u64) {
        self.received.fetch_add(len, Ordering::AcqRel);
    }
}

/// The Rust expression of the source's `PacketProxyReceiver` multicast
/// event. Implementations MUST NOT block: if a callback needs to do I/O,
/// it should dispatch to its own task instead of awaiting here.
pub trait PacketSink: Send + Sync {
    fn on_packet_received(&self, channel_id: &str, batch: Vec<IpPacket>);
}

/// A channel: one encrypted transport, one session, one receive loop.
#[async_trait]
pub trait Channel: Send + Sync {
    fn id(&self) -> &str;

    fn state(&self) -> ChannelState;

    /// Whether the underlying transport currently believes it has a live
    /// peer. UDP has no handshake, so this tracks "has sent or received
    /// at least one datagram" rather than anything TCP-like.
    fn connected(&self) -> bool;

    fn last_activity(&self) -> Instant;

    /// `(sent, received)` byte counters.
    fn traffic(&self) -> (u64, u64);

    /// The largest single batch this channel can carry in one send,
    /// in bytes of packet payload (see the legacy format's MTU budget).
    fn mtu_budget(&self) -> usize;

    fn set_sink(&self, sink: Arc<dyn PacketSink>);

    /// Registers a counters sink. Optional: a channel with no metrics
    /// attached just doesn't record anything, it never fails or blocks on
    /// this being absent.
    fn set_metrics(&self, metrics: Arc<Metrics>);

    async fn start(&self) -> Result<()>;

    async fn send_packets(&self, packets: &[IpPacket]) -> Result<()>;

    async fn dispose(&self);
}

pub(crate) fn new_last_activity() -> ArcSwap<Instant> {
    ArcSwap::new(Arc::new(Instant::now()))
}

pub(crate) fn touch_last_activity(cell: &ArcSwap<Instant>) {
    cell.store(Arc::new(Instant::now()));
}

pub(crate) type SinkSlot = ArcSwapOption<dyn PacketSink>;
pub(crate) type MetricsSlot = ArcSwapOption<Metrics>;
