//! Key schedule
//!
//! A session is bound to a single 32-byte seed produced by HKDF-Extract over
//! the handshake secret. Each traffic direction then reads its key material
//! from a [`KeyStream`] expanded from that seed with the sender's tag as
//! context, so both ends derive the same material without further exchange.
//!
//! The first 255 blocks are exactly `HKDF-Expand(seed, info)`. HKDF-Expand
//! is capped there, so later segments expand under `info || be64(segment)`
//! (segment 1, 2, ...), which keeps the stream deterministic and unbounded.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{KEY_SEED_SIZE, KEY_STREAM_SEGMENT_SIZE};
use crate::error::{CryptoError, CryptoResult};

/// Pseudorandom key a session's key streams are expanded from
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeySeed {
    bytes: [u8; KEY_SEED_SIZE],
}

impl KeySeed {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_SEED_SIZE]) -> Self {
        Self { bytes }
    }

    /// Try to create from a slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        let bytes = slice.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: KEY_SEED_SIZE,
            actual: slice.len(),
        })?;
        Ok(Self { bytes })
    }

    /// Generate a random seed
    pub fn generate() -> Self {
        Self {
            bytes: rand::random(),
        }
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SEED_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for KeySeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeySeed(..)")
    }
}

/// HKDF-SHA256 extract: `PRK = HMAC(salt, ikm)`
pub fn extract(salt: &[u8], ikm: &[u8]) -> KeySeed {
    let (prk, _) = Hkdf::<Sha256>::extract(Some(salt), ikm);
    let mut bytes = [0u8; KEY_SEED_SIZE];
    bytes.copy_from_slice(&prk);
    KeySeed { bytes }
}

/// Unbounded deterministic reader over HKDF-Expand output
pub struct KeyStream {
    hkdf: Hkdf<Sha256>,
    info: Vec<u8>,
    segment: u64,
    buffer: Vec<u8>,
    offset: usize,
}

impl KeyStream {
    /// Create a stream expanding `seed` under the context `info`
    pub fn new(seed: &KeySeed, info: &[u8]) -> CryptoResult<Self> {
        let hkdf = Hkdf::<Sha256>::from_prk(seed.as_bytes())
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;

        Ok(Self {
            hkdf,
            info: info.to_vec(),
            segment: 0,
            buffer: vec![0u8; KEY_STREAM_SEGMENT_SIZE],
            // Empty until the first read
            offset: KEY_STREAM_SEGMENT_SIZE,
        })
    }

    /// Fill `out` with the next bytes of the stream
    pub fn fill(&mut self, out: &mut [u8]) -> CryptoResult<()> {
        let mut written = 0;
        while written < out.len() {
            if self.offset == self.buffer.len() {
                self.refill()?;
            }

            let take = (out.len() - written).min(self.buffer.len() - self.offset);
            out[written..written + take]
                .copy_from_slice(&self.buffer[self.offset..self.offset + take]);
            self.offset += take;
            written += take;
        }
        Ok(())
    }

    fn refill(&mut self) -> CryptoResult<()> {
        let mut info = Vec::with_capacity(self.info.len() + 8);
        info.extend_from_slice(&self.info);
        if self.segment > 0 {
            info.extend_from_slice(&self.segment.to_be_bytes());
        }

        self.hkdf
            .expand(&info, &mut self.buffer)
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;

        self.segment += 1;
        self.offset = 0;
        Ok(())
    }
}

impl Drop for KeyStream {
    fn drop(&mut self) {
        self.buffer.zeroize();
    }
}
