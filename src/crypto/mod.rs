//! Keystream-positioned symmetric cipher over arbitrary buffer ranges.
//!
//! `BufferCryptor` wraps AES-128 in CTR mode as a pure keystream generator:
//! callers never encrypt a "message", they XOR a byte range against the
//! keystream at an explicit position. This is what lets a session share one
//! key across many small UDP datagrams without re-deriving anything per
//! datagram — the position *is* the nonce.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// Length of the AES-128 key in bytes.
pub const KEY_LEN: usize = 16;

/// Midpoint of the non-negative `i64` range. The server's keystream
/// subrange starts here; the client's starts at 0. See the legacy
/// `UdpChannel` wire format and the Open Question in the design notes
/// about cross-session keystream reuse — this split is not itself a fix
/// for that, only a client/server separation.
pub const SERVER_POSITION_BASE: i64 = 1 << 62;

/// A deterministic, position-addressable keystream over a fixed key.
///
/// Thread-safety: `cipher` takes `&self` and is internally synchronized,
/// but callers still must not issue overlapping calls that assume a
/// particular ordering of `position` — the contract is deterministic
/// per-call, not ordered across calls. Channels guarantee serialization
/// per direction; this type does not reorder or queue anything itself.
#[derive(Clone)]
pub struct BufferCryptor {
    key: [u8; KEY_LEN],
}

impl BufferCryptor {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    /// XORs `buf[offset..end]` in place with the keystream starting at
    /// byte `position`.
    ///
    /// # Panics
    ///
    /// Panics if `position` is negative, if `offset > end`, or if `end`
    /// exceeds `buf.len()`. These are all programming errors per the
    /// component contract — fail fast rather than silently truncate.
    pub fn cipher(&self, buf: &mut [u8], offset: usize, end: usize, position: i64) {
        assert!(position >= 0, "cryptor position must not be negative");
        assert!(offset <= end, "cryptor range offset must not exceed end");
        assert!(end <= buf.len(), "cryptor range must fit within the buffer");

        let iv = [0u8; 16];
        let mut cipher = Aes128Ctr::new(&self.key.into(), &iv.into());
        cipher
            .try_seek(position as u64)
            .expect("keystream position overflowed the cipher's addressable range");
        cipher.apply_keystream(&mut buf[offset..end]);
    }
}
