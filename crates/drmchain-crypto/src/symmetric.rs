//! Symmetric Primitives (AES-256-CTR, HMAC-SHA256)
//!
//! Sealed gossip frames are encrypted with a stream cipher and
//! authenticated encrypt-then-MAC. Keys are never reused: the sealer
//! ratchets to fresh material for every frame.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{CIPHER_BLOCK_SIZE, CIPHER_KEY_SIZE, MAC_KEY_SIZE, MAC_SIZE};
use crate::error::{CryptoError, CryptoResult};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// A 256-bit AES key
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CipherKey {
    bytes: [u8; CIPHER_KEY_SIZE],
}

/// A 128-bit HMAC key
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MacKey {
    bytes: [u8; MAC_KEY_SIZE],
}

impl CipherKey {
    /// Create a key from raw bytes
    pub fn from_bytes(bytes: [u8; CIPHER_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Try to create from a slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        let bytes = slice.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: CIPHER_KEY_SIZE,
            actual: slice.len(),
        })?;
        Ok(Self { bytes })
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; CIPHER_KEY_SIZE] {
        &self.bytes
    }
}

impl MacKey {
    /// Create a key from raw bytes
    pub fn from_bytes(bytes: [u8; MAC_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Try to create from a slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        let bytes = slice.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: MAC_KEY_SIZE,
            actual: slice.len(),
        })?;
        Ok(Self { bytes })
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; MAC_KEY_SIZE] {
        &self.bytes
    }
}

/// XOR the AES-256-CTR keystream into `data` in place.
///
/// Encryption and decryption are the same operation.
pub fn apply_keystream(key: &CipherKey, iv: &[u8; CIPHER_BLOCK_SIZE], data: &mut [u8]) -> CryptoResult<()> {
    let mut cipher = Aes256Ctr::new_from_slices(&key.bytes, iv)
        .map_err(|e| CryptoError::CipherFailed(e.to_string()))?;
    cipher
        .try_apply_keystream(data)
        .map_err(|e| CryptoError::CipherFailed(e.to_string()))
}

/// Compute HMAC-SHA256 over the concatenation of `parts`
pub fn compute_mac(key: &MacKey, parts: &[&[u8]]) -> CryptoResult<[u8; MAC_SIZE]> {
    let mut mac = keyed(key)?;
    for part in parts {
        mac.update(part);
    }
    let mut tag = [0u8; MAC_SIZE];
    tag.copy_from_slice(&mac.finalize().into_bytes());
    Ok(tag)
}

/// Verify an HMAC-SHA256 tag in constant time
pub fn verify_mac(key: &MacKey, parts: &[&[u8]], tag: &[u8]) -> CryptoResult<()> {
    let mut mac = keyed(key)?;
    for part in parts {
        mac.update(part);
    }
    mac.verify_slice(tag)
        .map_err(|_| CryptoError::MacVerificationFailed)
}

/// SHA-256 digest, used to evolve the sealer IV
pub fn digest(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

fn keyed(key: &MacKey) -> CryptoResult<HmacSha256> {
    <HmacSha256 as Mac>::new_from_slice(&key.bytes)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))
}
