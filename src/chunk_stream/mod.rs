//! `ChunkStream`: length-delimited framing over a reliable byte transport,
//! with in-band termination and transport reuse (spec §4.E).
//!
//! ```text
//! chunk := len(4, little-endian signed) | bytes(len)
//! stream := chunk+ | terminator
//! terminator := chunk with len == 0, followed by reuseHandshake
//! reuseHandshake := 16-byte nonce (the next stream's secret)
//! ```
//!
//! The terminator is asymmetric by construction: one side writes the
//! zero-length chunk and a freshly generated secret and immediately has
//! everything it needs to build the next [`ChunkStream`]
//! ([`ChunkStream::create_reuse`]); the other side observes `len == 0` on
//! a read, then reads the same 16 bytes off the wire and builds its own
//! next instance from them ([`ChunkStream::accept_reuse`]). Both land on
//! the same secret because it is the same bytes on the wire — that is
//! what makes the reuse bilateral without any extra negotiation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{Result, TunnelError};

/// Chunks larger than this are rejected as malformed. 16 MiB comfortably
/// covers the crate's own 10 MiB+ test buffers with headroom.
pub const MAX_CHUNK: usize = 16 * 1024 * 1024;

pub type ReuseSecret = [u8; 16];

pub struct ChunkStream<T> {
    id: String,
    secret: ReuseSecret,
    wrote_chunk_count: AtomicU64,
    can_reuse: AtomicBool,
    finished: AtomicBool,
    reader: AsyncMutex<Option<ReadHalf<T>>>,
    writer: AsyncMutex<Option<WriteHalf<T>>>,
}

impl<T> ChunkStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(id: impl Into<String>, secret: ReuseSecret, transport: T) -> Self {
        let (reader, writer) = tokio::io::split(transport);
        Self {
            id: id.into(),
            secret,
            wrote_chunk_count: AtomicU64::new(0),
            can_reuse: AtomicBool::new(true),
            finished: AtomicBool::new(false),
            reader: AsyncMutex::new(Some(reader)),
            writer: AsyncMutex::new(Some(writer)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn secret(&self) -> ReuseSecret {
        self.secret
    }

    pub fn wrote_chunk_count(&self) -> u64 {
        self.wrote_chunk_count.load(Ordering::Acquire)
    }

    pub fn can_reuse(&self) -> bool {
        self.can_reuse.load(Ordering::Acquire)
    }

    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Writes one chunk carrying `buf`.
    pub async fn write_chunk(&self, buf: &[u8]) -> Result<()> {
        if buf.len() > MAX_CHUNK {
            return Err(TunnelError::MalformedFrame(format!(
                "chunk of {} bytes exceeds max_chunk of {MAX_CHUNK}",
                buf.len()
            )));
        }
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TunnelError::StreamClosed)?;
        writer.write_all(&(buf.len() as i32).to_le_bytes()).await?;
        writer.write_all(buf).await?;
        self.wrote_chunk_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Reads one chunk. Returns `Ok(None)` once the zero-length terminator
    /// is observed; from that point the reader must call
    /// [`ChunkStream::accept_reuse`] (or the stream is simply done).
    pub async fn read_chunk(&self) -> Result<Option<Vec<u8>>> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(TunnelError::StreamClosed)?;

        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await?;
        let len = i32::from_le_bytes(len_buf);
        if len < 0 {
            return Err(TunnelError::MalformedFrame(format!("negative chunk length {len}")));
        }
        let len = len as usize;
        if len == 0 {
            self.finished.store(true, Ordering::Release);
            return Ok(None);
        }
        if len > MAX_CHUNK {
            return Err(TunnelError::MalformedFrame(format!(
                "chunk of {len} bytes exceeds max_chunk of {MAX_CHUNK}"
            )));
        }
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await?;
        Ok(Some(buf))
    }

    /// Writes the terminator (a zero-length chunk followed by a fresh
    /// 16-byte secret) and returns a new `ChunkStream` over the same
    /// transport, carrying that secret. The old instance's `can_reuse`
    /// becomes `false` and any further read/write on it fails with
    /// [`TunnelError::StreamClosed`].
    pub async fn create_reuse(&self) -> Result<ChunkStream<T>> {
        if !self.can_reuse.swap(false, Ordering::AcqRel) {
            return Err(TunnelError::StreamClosed);
        }

        let mut secret = [0u8; 16];
        rand::rng().fill_bytes(&mut secret);

        {
            let mut guard = self.writer.lock().await;
            let writer = guard.as_mut().ok_or(TunnelError::StreamClosed)?;
            writer.write_all(&0i32.to_le_bytes()).await?;
            writer.write_all(&secret).await?;
        }
        self.wrote_chunk_count.fetch_add(1, Ordering::AcqRel);

        self.rebuild_over_same_transport(secret).await
    }

    /// For the peer that observed [`ChunkStream::read_chunk`] return
    /// `Ok(None)`: reads the 16-byte secret the other side wrote and
    /// returns a new `ChunkStream` over the same transport carrying it.
    pub async fn accept_reuse(&self) -> Result<ChunkStream<T>> {
        if !self.finished.load(Ordering::Acquire) {
            return Err(TunnelError::StreamClosed);
        }
        if !self.can_reuse.swap(false, Ordering::AcqRel) {
            return Err(TunnelError::StreamClosed);
        }

        let mut secret = [0u8; 16];
        {
            let mut guard = self.reader.lock().await;
            let reader = guard.as_mut().ok_or(TunnelError::StreamClosed)?;
            reader.read_exact(&mut secret).await?;
        }

        self.rebuild_over_same_transport(secret).await
    }

    /// Tears the stream down. `graceful` writes a terminator (discarding the
    /// fresh secret it carries — nothing will read it) before dropping the
    /// transport; an abrupt disposal just drops the transport outright. Safe
    /// to call more than once.
    pub async fn dispose(&self, graceful: bool) {
        if graceful && self.can_reuse.swap(false, Ordering::AcqRel) {
            let mut secret = [0u8; 16];
            rand::rng().fill_bytes(&mut secret);
            let mut guard = self.writer.lock().await;
            if let Some(writer) = guard.as_mut() {
                let _ = writer.write_all(&0i32.to_le_bytes()).await;
                let _ = writer.write_all(&secret).await;
                self.wrote_chunk_count.fetch_add(1, Ordering::AcqRel);
            }
        }
        self.reader.lock().await.take();
        self.writer.lock().await.take();
    }

    async fn rebuild_over_same_transport(&self, secret: ReuseSecret) -> Result<ChunkStream<T>> {
        let reader = self.reader.lock().await.take().ok_or(TunnelError::StreamClosed)?;
        let writer = self.writer.lock().await.take().ok_or(TunnelError::StreamClosed)?;
        let transport = reader.unsplit(writer);
        Ok(ChunkStream::new(format!("{}-reuse", self.id), secret, transport))
    }
}
