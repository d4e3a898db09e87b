//! `Tunnel`: aggregates one or more [`Channel`]s, round-robins egress
//! across them, and demultiplexes ingress into a single event (spec §4.G).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use arc_swap::ArcSwapOption;

use crate::channel::{Channel, ChannelState, PacketSink};
use crate::error::{Result, TunnelError};
use crate::packet::{IpPacket, PacketCodec};
use crate::telemetry::Metrics;

/// Holds an ordered set of channels and presents them as one packet pipe.
///
/// `Tunnel` is itself a [`PacketSink`]: [`Tunnel::add_channel`] registers
/// it on the channel, so every channel's ingress batch arrives at
/// [`Tunnel::on_packet_received`] and is re-emitted verbatim to whatever
/// sink the upper layer registered with [`Tunnel::set_sink`].
pub struct Tunnel {
    self_ref: Weak<Tunnel>,
    channels: Mutex<Vec<Arc<dyn Channel>>>,
    sink: ArcSwapOption<dyn PacketSink>,
    metrics: ArcSwapOption<Metrics>,
    disposed: AtomicBool,
}

impl Tunnel {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            channels: Mutex::new(Vec::new()),
            sink: ArcSwapOption::default(),
            metrics: ArcSwapOption::default(),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn set_sink(&self, sink: Arc<dyn PacketSink>) {
        self.sink.store(Some(sink));
    }

    /// Registers a counters sink and retroactively applies it to every
    /// channel already attached; channels added afterwards pick it up in
    /// [`Tunnel::add_channel`].
    pub fn set_metrics(&self, metrics: Arc<Metrics>) {
        for channel in self.channels.lock().unwrap().iter() {
            channel.set_metrics(metrics.clone());
        }
        self.metrics.store(Some(metrics));
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().unwrap().len()
    }

    /// Starts `channel` if it hasn't been started yet, subscribes to its
    /// ingress, and adds it to the round-robin set.
    pub async fn add_channel(&self, channel: Arc<dyn Channel>) -> Result<()> {
        if channel.state() == ChannelState::New {
            channel.start().await?;
        }
        let strong_self: Arc<dyn PacketSink> =
            self.self_ref.upgrade().ok_or_else(|| TunnelError::SocketFatal("tunnel dropped before add_channel".into()))?;
        channel.set_sink(strong_self);
        if let Some(metrics) = self.metrics.load_full() {
            channel.set_metrics(metrics);
        }
        self.channels.lock().unwrap().push(channel);
        Ok(())
    }

    /// Partitions `batch` into sub-batches no larger than the chosen
    /// channel's MTU budget and dispatches them round-robin, preferring
    /// connected channels with the oldest `last_activity`. Fails with
    /// [`TunnelError::NoChannel`] if no channel is available at all.
    pub async fn send_packets(&self, batch: &[IpPacket]) -> Result<()> {
        let mut idx = 0;
        while idx < batch.len() {
            let channel = self.pick_channel()?;
            let budget = channel.mtu_budget();

            let mut sub_batch = Vec::new();
            let mut sub_len = 0usize;
            while idx < batch.len() {
                let packet_len = batch[idx].total_length();
                if sub_len + packet_len > budget && !sub_batch.is_empty() {
                    break;
                }
                sub_batch.push(PacketCodec::clone_packet(&batch[idx]));
                sub_len += packet_len;
                idx += 1;
            }
            channel.send_packets(&sub_batch).await?;
        }
        Ok(())
    }

    fn pick_channel(&self) -> Result<Arc<dyn Channel>> {
        let channels = self.channels.lock().unwrap();
        channels
            .iter()
            .filter(|c| c.state() == ChannelState::Started)
            .min_by_key(|c| (!c.connected(), c.last_activity()))
            .cloned()
            .ok_or(TunnelError::NoChannel)
    }

    /// Disposes the tunnel and every channel it owns. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let channels = std::mem::take(&mut *self.channels.lock().unwrap());
        for channel in channels {
            channel.dispose().await;
        }
    }
}

impl PacketSink for Tunnel {
    fn on_packet_received(&self, channel_id: &str, batch: Vec<IpPacket>) {
        if let Some(sink) = self.sink.load_full() {
            sink.on_packet_received(channel_id, batch);
        }
    }
}
