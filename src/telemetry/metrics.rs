//! Plain atomics-based counters. No exporter: the embedding process reads
//! these directly (e.g. to log a periodic summary) rather than scraping
//! a `/metrics` endpoint, which is out of scope for this core.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    pub packets_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub active_channels: AtomicI64,
    pub active_ping_proxies: AtomicI64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, packets: u64, bytes: u64) {
        self.packets_sent.fetch_add(packets, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_received(&self, packets: u64, bytes: u64) {
        self.packets_received.fetch_add(packets, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, packets: u64) {
        self.packets_dropped.fetch_add(packets, Ordering::Relaxed);
    }

    pub fn channel_started(&self) {
        self.active_channels.fetch_add(1, Ordering::Relaxed);
    }

    pub fn channel_disposed(&self) {
        self.active_channels.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn ping_proxy_created(&self) {
        self.active_ping_proxies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ping_proxy_evicted(&self) {
        self.active_ping_proxies.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            active_channels: self.active_channels.load(Ordering::Relaxed),
            active_ping_proxies: self.active_ping_proxies.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub active_channels: i64,
    pub active_ping_proxies: i64,
}
