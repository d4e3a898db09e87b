//! Parse/serialize IP packets from/into a contiguous byte buffer.
//!
//! This is the thin layer every channel routes packets through before
//! encryption: [`PacketCodec::read_next`] carves one [`IpPacket`] out of a
//! shared receive buffer, and [`IpPacket::to_bytes`] re-emits the wire
//! form after a mutation (e.g. the ping proxy rewriting source/destination
//! for an echo reply).

pub mod icmp;

use std::net::Ipv4Addr;

use etherparse::{IpNumber, Ipv4Header, Ipv4HeaderSlice};

use crate::error::{Result, TunnelError};
use icmp::internet_checksum;

/// An opaque parsed IPv4 datagram.
///
/// Invariant: `total_length()` always equals `to_bytes().len()`; the header
/// checksum and length fields are recomputed by [`IpPacket::update`]
/// whenever the payload or addresses are mutated through the accessors
/// below (constructing one directly and mutating its fields without going
/// through them is a caller bug, not something this type guards against).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpPacket {
    header: Ipv4Header,
    payload: Vec<u8>,
}

impl IpPacket {
    pub fn version(&self) -> u8 {
        4
    }

    pub fn protocol(&self) -> IpNumber {
        self.header.protocol
    }

    pub fn source(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.header.source)
    }

    pub fn destination(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.header.destination)
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn total_length(&self) -> usize {
        self.header.header_len() + self.payload.len()
    }

    /// Builds a fresh IPv4 packet around `payload`, computing the header
    /// checksum immediately.
    pub fn build(
        source: Ipv4Addr,
        destination: Ipv4Addr,
        ttl: u8,
        protocol: IpNumber,
        payload: Vec<u8>,
    ) -> Result<Self> {
        let header = Ipv4Header::new(payload.len() as u16, ttl, protocol, source.octets(), destination.octets())
            .map_err(|e| TunnelError::MalformedPacket(format!("cannot build IPv4 header: {e}")))?;
        let mut packet = Self { header, payload };
        packet.update();
        Ok(packet)
    }

    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.payload = payload;
        self.update();
    }

    pub fn set_addresses(&mut self, source: Ipv4Addr, destination: Ipv4Addr) {
        self.header.source = source.octets();
        self.header.destination = destination.octets();
        self.update();
    }

    /// Recomputes the IPv4 total-length and header-checksum fields, plus
    /// the transport checksum for UDP/TCP payloads (ICMP echo headers
    /// carry their own checksum, computed by the caller before the
    /// payload is handed to this type — see [`icmp::IcmpEchoHeader`]).
    pub fn update(&mut self) {
        self.header.total_len = self.header.header_len() as u16 + self.payload.len() as u16;
        self.header.header_checksum = self.header.calc_header_checksum();
        self.recompute_transport_checksum();
    }

    fn recompute_transport_checksum(&mut self) {
        if self.header.protocol != IpNumber::UDP || self.payload.len() < 8 {
            return;
        }
        // UDP checksum covers the pseudo-header + the UDP header/payload
        // with the checksum field itself zeroed.
        self.payload[6] = 0;
        self.payload[7] = 0;
        let mut pseudo = Vec::with_capacity(12 + self.payload.len());
        pseudo.extend_from_slice(&self.header.source);
        pseudo.extend_from_slice(&self.header.destination);
        pseudo.push(0);
        pseudo.push(IpNumber::UDP.0);
        pseudo.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        pseudo.extend_from_slice(&self.payload);
        let checksum = internet_checksum(&pseudo);
        let checksum = if checksum == 0 { 0xFFFF } else { checksum };
        self.payload[6..8].copy_from_slice(&checksum.to_be_bytes());
    }

    /// Re-emits the packet's wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_length());
        self.header
            .write(&mut out)
            .expect("serializing a validated IPv4 header never fails");
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Parses and serializes [`IpPacket`]s against a contiguous byte buffer.
pub struct PacketCodec;

impl PacketCodec {
    /// Reads one IP packet beginning at `buf[*idx]`, advancing `*idx` by
    /// its total length.
    ///
    /// Fails with [`TunnelError::MalformedPacket`] if the header is
    /// truncated or the declared total length exceeds the remaining
    /// buffer.
    pub fn read_next(buf: &[u8], idx: &mut usize) -> Result<IpPacket> {
        let remaining = buf
            .get(*idx..)
            .ok_or_else(|| TunnelError::MalformedPacket("index past end of buffer".into()))?;

        let header_slice = Ipv4HeaderSlice::from_slice(remaining)
            .map_err(|e| TunnelError::MalformedPacket(format!("truncated IPv4 header: {e}")))?;

        let total_len = header_slice.total_len() as usize;
        if total_len > remaining.len() {
            return Err(TunnelError::MalformedPacket(format!(
                "declared length {total_len} exceeds remaining buffer of {}",
                remaining.len()
            )));
        }
        let header_len = header_slice.slice().len();
        if header_len > total_len {
            return Err(TunnelError::MalformedPacket("header longer than total length".into()));
        }

        let header = header_slice.to_header();
        let payload = remaining[header_len..total_len].to_vec();
        *idx += total_len;
        Ok(IpPacket { header, payload })
    }

    /// Recomputes checksums and length fields after a mutation. Exposed
    /// alongside [`IpPacket::update`] for callers that prefer the
    /// free-function form the legacy API used.
    pub fn update(ip: &mut IpPacket) {
        ip.update();
    }

    /// Returns a deep copy whose mutation cannot affect `ip`.
    pub fn clone_packet(ip: &IpPacket) -> IpPacket {
        ip.clone()
    }
}
