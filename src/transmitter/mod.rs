//! `UdpChannelTransmitter`: the shared-socket framing from spec §4.D.
//!
//! Unlike [`crate::channel::legacy::UdpChannel`] (one socket per session),
//! this transports *many* sessions over a single UDP socket. The
//! transmitter never sees session keys — it only deobfuscates a fixed
//! 32-byte header and hands the still-encrypted payload to whichever
//! session-layer sink is registered.
//!
//! Fixed header layout:
//!
//! ```text
//! offset  field             size  encryption
//! 0       IV                8     plaintext
//! 8       signature "OK"    2     obfuscated
//! 10      reserved          6     obfuscated
//! 16      sessionId         8     obfuscated
//! 24      sessionCryptoPos  8     obfuscated
//! 32..    payload           var   encrypted by the session key (opaque here)
//! ```
//!
//! "Obfuscated" means XORed with a 24-byte keystream produced by the
//! *server key*'s [`BufferCryptor`] at position `IV` (the datagram's
//! 8 random bytes, reinterpreted as an `i64` position). The signature
//! check happens *after* deobfuscation; a mismatch drops the datagram
//! silently and the receive loop keeps serving later datagrams.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::crypto::BufferCryptor;
use crate::error::Result;
use crate::telemetry::Metrics;

const HEADER_LEN: usize = 32;
const SIGNATURE: [u8; 2] = [0x4F, 0x4B]; // "OK"
const MAX_DATAGRAM: usize = 64 * 1024;

/// The Rust expression of the session layer's `on_receive_data` consumer.
/// Called once per validated datagram; MUST NOT block (dispatch to your
/// own task if you need to do I/O or decrypt the payload).
pub trait SessionDataSink: Send + Sync {
    fn on_receive_data(
        &self,
        session_id: u64,
        remote: SocketAddr,
        session_crypto_pos: i64,
        buffer: &[u8],
        payload_offset: usize,
    );
}

struct SendState {
    scratch: Vec<u8>,
}

pub struct UdpChannelTransmitter {
    self_ref: Weak<UdpChannelTransmitter>,
    socket: Arc<UdpSocket>,
    server_cryptor: BufferCryptor,
    send_state: AsyncMutex<SendState>,
    sink: ArcSwapOption<dyn SessionDataSink>,
    metrics: ArcSwapOption<Metrics>,
    cancel: CancellationToken,
    receive_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl UdpChannelTransmitter {
    pub async fn bind(local: SocketAddr, server_key: [u8; 16]) -> Result<Arc<Self>> {
        let socket = Arc::new(UdpSocket::bind(local).await?);
        Ok(Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            socket,
            server_cryptor: BufferCryptor::new(server_key),
            send_state: AsyncMutex::new(SendState { scratch: Vec::new() }),
            sink: ArcSwapOption::default(),
            metrics: ArcSwapOption::default(),
            cancel: CancellationToken::new(),
            receive_task: AsyncMutex::new(None),
        }))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn set_sink(&self, sink: Arc<dyn SessionDataSink>) {
        self.sink.store(Some(sink));
    }

    pub fn set_metrics(&self, metrics: Arc<Metrics>) {
        self.metrics.store(Some(metrics));
    }

    pub fn start(&self) {
        let Some(strong) = self.self_ref.upgrade() else { return };
        let mut guard = self.receive_task.try_lock().expect("start is not called concurrently");
        if guard.is_some() {
            return;
        }
        *guard = Some(tokio::spawn(strong.run_receive_loop()));
    }

    pub async fn dispose(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.receive_task.lock().await.take() {
            let _ = handle.await;
        }
    }

    /// Sends `encrypted_payload` (already encrypted by the caller under
    /// the session key at `session_crypto_pos`) to `remote`, wrapped in a
    /// freshly obfuscated header.
    ///
    /// Concurrent callers are serialized by an internal mutex covering
    /// the scratch buffer and the random generator, so IVs never
    /// interleave between two in-flight sends.
    pub async fn send_to(
        &self,
        remote: SocketAddr,
        session_id: u64,
        session_crypto_pos: i64,
        encrypted_payload: &[u8],
    ) -> Result<()> {
        let mut state = self.send_state.lock().await;
        let mut iv = [0u8; 8];
        rand::rng().fill_bytes(&mut iv);
        // `BufferCryptor::cipher`'s position is a signed i64 that must not
        // be negative (spec §4.A). Clearing the IV's top bit costs one bit
        // of entropy out of 64, still leaving 2^63 of keyspace, nowhere
        // near enough to make IV reuse non-negligible, and keeps every
        // generated IV a legal cipher position.
        iv[7] &= 0x7F;
        let iv_pos = i64::from_le_bytes(iv);

        state.scratch.clear();
        state.scratch.extend_from_slice(&iv);
        state.scratch.extend_from_slice(&SIGNATURE);
        state.scratch.extend_from_slice(&[0u8; 6]); // reserved, zero before XOR
        state.scratch.extend_from_slice(&session_id.to_le_bytes());
        state.scratch.extend_from_slice(&session_crypto_pos.to_le_bytes());
        self.server_cryptor.cipher(&mut state.scratch, 8, HEADER_LEN, iv_pos);
        state.scratch.extend_from_slice(encrypted_payload);

        let expected = state.scratch.len();
        let wrote = self.socket.send_to(&state.scratch, remote).await?;
        if wrote != expected {
            return Err(crate::error::TunnelError::ShortWrite { wrote, expected });
        }
        if let Some(metrics) = self.metrics.load_full() {
            metrics.record_sent(1, wrote as u64);
        }
        Ok(())
    }

    async fn run_receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((n, remote)) => self.handle_datagram(&buf[..n], remote),
                        Err(e) => {
                            warn!(error = %e, "transient socket error on transmitter receive loop");
                            continue;
                        }
                    }
                }
            }
        }
        debug!("transmitter receive loop exited");
    }

    fn handle_datagram(&self, datagram: &[u8], remote: SocketAddr) {
        if datagram.len() < HEADER_LEN {
            warn!(len = datagram.len(), "dropping undersized datagram");
            if let Some(metrics) = self.metrics.load_full() {
                metrics.record_dropped(1);
            }
            return;
        }
        let iv_pos = i64::from_le_bytes(datagram[0..8].try_into().unwrap());
        if iv_pos < 0 {
            // A well-formed peer never sends one (see `send_to`'s masking);
            // a negative value here is a corrupted or adversarial IV, not a
            // legal cipher position. Drop it rather than let
            // `BufferCryptor::cipher` fail fast on it.
            warn!(%remote, "dropping datagram: negative IV");
            if let Some(metrics) = self.metrics.load_full() {
                metrics.record_dropped(1);
            }
            return;
        }
        let mut header = datagram[..HEADER_LEN].to_vec();
        self.server_cryptor.cipher(&mut header, 8, HEADER_LEN, iv_pos);

        if header[8..10] != SIGNATURE {
            warn!(%remote, "dropping datagram: signature mismatch");
            if let Some(metrics) = self.metrics.load_full() {
                metrics.record_dropped(1);
            }
            return;
        }
        let session_id = u64::from_le_bytes(header[16..24].try_into().unwrap());
        let session_crypto_pos = i64::from_le_bytes(header[24..32].try_into().unwrap());

        if let Some(metrics) = self.metrics.load_full() {
            metrics.record_received(1, datagram.len() as u64);
        }
        if let Some(sink) = self.sink.load_full() {
            sink.on_receive_data(session_id, remote, session_crypto_pos, datagram, HEADER_LEN);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    struct RecordingSink(mpsc::UnboundedSender<(u64, i64, Vec<u8>)>);

    impl SessionDataSink for RecordingSink {
        fn on_receive_data(
            &self,
            session_id: u64,
            _remote: SocketAddr,
            session_crypto_pos: i64,
            buffer: &[u8],
            payload_offset: usize,
        ) {
            let _ = self.0.send((session_id, session_crypto_pos, buffer[payload_offset..].to_vec()));
        }
    }

    #[tokio::test]
    async fn valid_datagram_reaches_the_sink_with_metadata_intact() {
        let key = [5u8; 16];
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = UdpChannelTransmitter::bind(any, key).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        server.set_sink(Arc::new(RecordingSink(tx)));
        server.start();

        let server_addr = server.local_addr().unwrap();

        // Build a datagram the same way send_to would, from the client side,
        // sharing the same server key.
        let client = UdpChannelTransmitter::bind(any, key).await.unwrap();
        client
            .send_to(server_addr, 77, 1000, b"ciphertext-stand-in")
            .await
            .unwrap();

        let (session_id, crypto_pos, payload) =
            tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
        assert_eq!(session_id, 77);
        assert_eq!(crypto_pos, 1000);
        assert_eq!(payload, b"ciphertext-stand-in");

        server.dispose().await;
    }

    #[tokio::test]
    async fn corrupted_signature_is_dropped_and_loop_keeps_serving() {
        let key = [9u8; 16];
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = UdpChannelTransmitter::bind(any, key).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        server.set_sink(Arc::new(RecordingSink(tx)));
        server.start();
        let server_addr = server.local_addr().unwrap();

        let raw = UdpSocket::bind(any).await.unwrap();
        // Correct IV, but the rest of the header is garbage so the
        // deobfuscated signature will not read "OK".
        let mut datagram = vec![0u8; HEADER_LEN + 4];
        datagram[0..8].copy_from_slice(&42i64.to_le_bytes());
        raw.send_to(&datagram, server_addr).await.unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_millis(300), rx.recv()).await;
        assert!(result.is_err(), "corrupted signature must never reach the sink");

        // The loop must still serve a subsequent, well-formed datagram.
        let client = UdpChannelTransmitter::bind(any, key).await.unwrap();
        client.send_to(server_addr, 1, 2, b"ok-now").await.unwrap();
        let (session_id, _, payload) =
            tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
        assert_eq!(session_id, 1);
        assert_eq!(payload, b"ok-now");

        server.dispose().await;
    }

    #[tokio::test]
    async fn negative_iv_is_dropped_without_panicking_and_loop_keeps_serving() {
        let key = [13u8; 16];
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = UdpChannelTransmitter::bind(any, key).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        server.set_sink(Arc::new(RecordingSink(tx)));
        server.start();
        let server_addr = server.local_addr().unwrap();

        let raw = UdpSocket::bind(any).await.unwrap();
        // Top bit of the IV set, so reinterpreting it as a little-endian
        // i64 yields a negative cipher position.
        let mut datagram = vec![0u8; HEADER_LEN + 4];
        datagram[0..8].copy_from_slice(&(-1i64).to_le_bytes());
        raw.send_to(&datagram, server_addr).await.unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_millis(300), rx.recv()).await;
        assert!(result.is_err(), "negative IV must never reach the sink");

        // The loop must still serve a subsequent, well-formed datagram sent
        // the normal way (whose generated IV is always masked non-negative).
        let client = UdpChannelTransmitter::bind(any, key).await.unwrap();
        client.send_to(server_addr, 5, 6, b"still-alive").await.unwrap();
        let (session_id, _, payload) =
            tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
        assert_eq!(session_id, 5);
        assert_eq!(payload, b"still-alive");

        server.dispose().await;
    }

    #[tokio::test]
    async fn generated_iv_is_always_a_legal_non_negative_cipher_position() {
        let key = [21u8; 16];
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let client = UdpChannelTransmitter::bind(any, key).await.unwrap();
        let sink_addr: SocketAddr = "127.0.0.1:1".parse().unwrap();

        // Send enough datagrams that, absent masking, roughly half would be
        // expected to carry a negative IV and panic inside `cipher`.
        for _ in 0..256 {
            // `send_to` doesn't need a reachable peer to exercise IV
            // generation; UDP sends to a closed port still succeed locally.
            let _ = client.send_to(sink_addr, 1, 1, b"x").await;
        }
    }
}
