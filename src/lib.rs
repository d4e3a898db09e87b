//! Tunneling core of a VPN data plane: encrypted UDP channels, a chunked
//! reusable byte-stream framing, an ICMP echo proxy pool, and the tunnel
//! multiplexer that ties channels together into one packet pipe.
//!
//! Session establishment, key negotiation, configuration parsing, the
//! OS-level packet source, and any higher-layer TCP proxying live outside
//! this crate; it only owns the wire formats and the concurrency around
//! them.

#![forbid(unsafe_code)]

pub mod channel;
pub mod chunk_stream;
pub mod crypto;
pub mod error;
pub mod packet;
pub mod ping;
pub mod telemetry;
pub mod transmitter;
pub mod tunnel;

pub use channel::{Channel, ChannelState, PacketSink};
pub use channel::legacy::{ChannelRole, UdpChannel};
pub use chunk_stream::ChunkStream;
pub use crypto::BufferCryptor;
pub use error::{Result, TunnelError};
pub use packet::{IpPacket, PacketCodec};
pub use ping::{PingProxy, PingProxyPool, PingReceiver};
pub use transmitter::{SessionDataSink, UdpChannelTransmitter};
pub use tunnel::Tunnel;
