//! drmchain Cryptographic Primitives
//!
//! This crate provides the cryptographic building blocks used by the
//! drmchain transport:
//! - Node identity (Ed25519 signatures + static X25519 key agreement)
//! - Ephemeral key exchange (X25519)
//! - Key schedule (HKDF-SHA256 extract and an unbounded expand stream)
//! - Symmetric primitives for sealing (AES-256-CTR, HMAC-SHA256)

pub mod keys;
pub mod symmetric;
pub mod kdf;
pub mod identity;
pub mod error;

pub use keys::{KeyPair, PublicKey, SecretKey, SharedSecret, EphemeralKeyPair};
pub use symmetric::{apply_keystream, compute_mac, digest, verify_mac, CipherKey, MacKey};
pub use kdf::{extract, KeySeed, KeyStream};
pub use identity::{NodeIdentity, PublicIdentity, Signature};
pub use error::{CryptoError, CryptoResult};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::keys::*;
    pub use crate::symmetric::*;
    pub use crate::kdf::*;
    pub use crate::identity::*;
    pub use crate::error::*;
}

/// Protocol constants
pub mod constants {
    /// X25519 key size in bytes
    pub const X25519_KEY_SIZE: usize = 32;

    /// X25519 shared secret size
    pub const SHARED_SECRET_SIZE: usize = 32;

    /// Ed25519 signature size
    pub const SIGNATURE_SIZE: usize = 64;

    /// Ed25519 public key size
    pub const ED25519_PUBKEY_SIZE: usize = 32;

    /// Encoded public identity size (signing key followed by exchange key)
    pub const PUBLIC_IDENTITY_SIZE: usize = ED25519_PUBKEY_SIZE + X25519_KEY_SIZE;

    /// HKDF-SHA256 pseudorandom key size
    pub const KEY_SEED_SIZE: usize = 32;

    /// Bytes produced by a single HKDF-SHA256 expand call (255 * HashLen)
    pub const KEY_STREAM_SEGMENT_SIZE: usize = 255 * 32;

    /// HMAC key size used by the sealer
    pub const MAC_KEY_SIZE: usize = 16;

    /// AES-256 key size
    pub const CIPHER_KEY_SIZE: usize = 32;

    /// AES block size; the IV is truncated to this length
    pub const CIPHER_BLOCK_SIZE: usize = 16;

    /// HMAC-SHA256 tag size
    pub const MAC_SIZE: usize = 32;
}
