//! X25519 Key Exchange
//!
//! Provides Diffie-Hellman key agreement using Curve25519.
//! A node's static key is part of its identity; handshake initiators
//! bring a single-use ephemeral key.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::constants::{SHARED_SECRET_SIZE, X25519_KEY_SIZE};
use crate::error::{CryptoError, CryptoResult};

/// A static X25519 secret key (for long-term node identity)
#[derive(ZeroizeOnDrop)]
pub struct SecretKey {
    inner: StaticSecret,
}

/// A X25519 public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey {
    bytes: [u8; X25519_KEY_SIZE],
}

/// A keypair containing both secret and public keys
pub struct KeyPair {
    pub secret: SecretKey,
    pub public: PublicKey,
}

/// An ephemeral keypair for single-use key exchange
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    pub public: PublicKey,
}

/// Shared secret derived from X25519 key exchange
#[derive(ZeroizeOnDrop)]
pub struct SharedSecret {
    bytes: [u8; SHARED_SECRET_SIZE],
}

impl SecretKey {
    /// Generate a new random secret key
    pub fn generate() -> Self {
        Self {
            inner: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        Self {
            inner: StaticSecret::from(bytes),
        }
    }

    /// Perform Diffie-Hellman key exchange
    pub fn diffie_hellman(&self, their_public: &PublicKey) -> CryptoResult<SharedSecret> {
        let their_public = X25519Public::from(their_public.bytes);
        SharedSecret::from_exchange(self.inner.diffie_hellman(&their_public))
    }

    /// Get the corresponding public key
    pub fn public_key(&self) -> PublicKey {
        let public = X25519Public::from(&self.inner);
        PublicKey {
            bytes: public.to_bytes(),
        }
    }

    /// Export raw bytes (use with caution!)
    pub fn to_bytes(&self) -> [u8; X25519_KEY_SIZE] {
        self.inner.to_bytes()
    }
}

impl Clone for SecretKey {
    fn clone(&self) -> Self {
        Self::from_bytes(self.to_bytes())
    }
}

impl PublicKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Try to create from a slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; X25519_KEY_SIZE] =
            slice.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                expected: X25519_KEY_SIZE,
                actual: slice.len(),
            })?;
        Ok(Self { bytes })
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; X25519_KEY_SIZE] {
        &self.bytes
    }

    /// Convert to bytes
    pub fn to_bytes(&self) -> [u8; X25519_KEY_SIZE] {
        self.bytes
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({}...)", hex::encode(&self.bytes[..4]))
    }
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        Self::from_secret(SecretKey::generate())
    }

    /// Create from an existing secret key
    pub fn from_secret(secret: SecretKey) -> Self {
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Create from raw secret bytes
    pub fn from_bytes(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        Self::from_secret(SecretKey::from_bytes(bytes))
    }
}

impl Clone for KeyPair {
    fn clone(&self) -> Self {
        Self {
            secret: self.secret.clone(),
            public: self.public,
        }
    }
}

impl EphemeralKeyPair {
    /// Generate a new ephemeral keypair (single use)
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Self {
            secret,
            public: PublicKey {
                bytes: public.to_bytes(),
            },
        }
    }

    /// Perform Diffie-Hellman and consume the ephemeral secret
    pub fn diffie_hellman(self, their_public: &PublicKey) -> CryptoResult<SharedSecret> {
        let their_public = X25519Public::from(their_public.bytes);
        SharedSecret::from_exchange(self.secret.diffie_hellman(&their_public))
    }
}

impl SharedSecret {
    /// Reject low-order peer keys, which force an all-zero secret
    fn from_exchange(shared: x25519_dalek::SharedSecret) -> CryptoResult<Self> {
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidPublicKey);
        }
        Ok(Self {
            bytes: shared.to_bytes(),
        })
    }

    /// Get the shared secret bytes
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_SIZE] {
        &self.bytes
    }

    /// Copy out the secret bytes
    pub fn to_bytes(&self) -> [u8; SHARED_SECRET_SIZE] {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_exchange() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let alice_shared = alice.secret.diffie_hellman(&bob.public).unwrap();
        let bob_shared = bob.secret.diffie_hellman(&alice.public).unwrap();

        assert_eq!(alice_shared.as_bytes(), bob_shared.as_bytes());
    }

    #[test]
    fn test_ephemeral_key_exchange() {
        let static_keypair = KeyPair::generate();
        let ephemeral = EphemeralKeyPair::generate();
        let ephemeral_public = ephemeral.public;

        // Ephemeral side computes shared secret
        let shared1 = ephemeral.diffie_hellman(&static_keypair.public).unwrap();

        // Static side computes same shared secret
        let shared2 = static_keypair.secret.diffie_hellman(&ephemeral_public).unwrap();

        assert_eq!(shared1.as_bytes(), shared2.as_bytes());
    }

    #[test]
    fn test_low_order_point_rejected() {
        let keypair = KeyPair::generate();
        let identity_point = PublicKey::from_bytes([0u8; X25519_KEY_SIZE]);

        let result = keypair.secret.diffie_hellman(&identity_point);
        assert!(matches!(result, Err(CryptoError::InvalidPublicKey)));
    }

    #[test]
    fn test_public_key_from_slice() {
        let keypair = KeyPair::generate();
        let restored = PublicKey::try_from_slice(keypair.public.as_bytes()).unwrap();
        assert_eq!(keypair.public, restored);

        assert!(PublicKey::try_from_slice(&[0u8; 31]).is_err());
    }
}
