//! Node Identity Management
//!
//! Provides the identity every drmchain node carries on the network.
//! Each node has:
//! - A signing keypair (Ed25519) for authenticating handshake messages
//! - A static key-agreement keypair (X25519) for session establishment
//! - A tag: the unpadded base64 encoding of both public keys, used as the
//!   stable peer identifier on the wire

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{Signature as Ed25519Sig, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use zeroize::ZeroizeOnDrop;

use crate::constants::{ED25519_PUBKEY_SIZE, PUBLIC_IDENTITY_SIZE, SIGNATURE_SIZE, X25519_KEY_SIZE};
use crate::error::{CryptoError, CryptoResult};
use crate::keys::{KeyPair, PublicKey};

/// Ed25519 signature
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    #[serde(with = "BigArray")]
    bytes: [u8; SIGNATURE_SIZE],
}

/// A node's complete identity (signing + key agreement keys)
#[derive(ZeroizeOnDrop)]
pub struct NodeIdentity {
    /// Ed25519 signing key
    #[zeroize(skip)]
    signing_key: SigningKey,

    /// X25519 static keypair
    #[zeroize(skip)]
    exchange_keypair: KeyPair,

    /// Cached public half
    #[zeroize(skip)]
    public: PublicIdentity,
}

/// Public identity information (shareable)
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicIdentity {
    /// Ed25519 public key for verifying signatures
    pub signing_pubkey: [u8; ED25519_PUBKEY_SIZE],

    /// X25519 public key for key agreement
    pub exchange_pubkey: PublicKey,
}

impl Signature {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self { bytes }
    }

    /// Try to create from slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; SIGNATURE_SIZE] =
            slice.try_into().map_err(|_| CryptoError::InvalidSignature)?;
        Ok(Self { bytes })
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({}...)", hex::encode(&self.bytes[..8]))
    }
}

impl NodeIdentity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        Self::assemble(SigningKey::generate(&mut OsRng), KeyPair::generate())
    }

    /// Create from existing keys (for loading from storage)
    pub fn from_keys(signing_key_bytes: [u8; 32], exchange_key_bytes: [u8; 32]) -> Self {
        Self::assemble(
            SigningKey::from_bytes(&signing_key_bytes),
            KeyPair::from_bytes(exchange_key_bytes),
        )
    }

    fn assemble(signing_key: SigningKey, exchange_keypair: KeyPair) -> Self {
        let public = PublicIdentity {
            signing_pubkey: signing_key.verifying_key().to_bytes(),
            exchange_pubkey: exchange_keypair.public,
        };

        Self {
            signing_key,
            exchange_keypair,
            public,
        }
    }

    /// Get the public half of this identity
    pub fn public_identity(&self) -> &PublicIdentity {
        &self.public
    }

    /// Shorthand for `public_identity().tag()`
    pub fn tag(&self) -> String {
        self.public.tag()
    }

    /// Get the X25519 keypair for key agreement
    pub fn exchange_keypair(&self) -> &KeyPair {
        &self.exchange_keypair
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> Signature {
        let sig = self.signing_key.sign(message);
        Signature {
            bytes: sig.to_bytes(),
        }
    }

    /// Export secret keys for secure storage
    pub fn export_secrets(&self) -> ([u8; 32], [u8; 32]) {
        (
            self.signing_key.to_bytes(),
            self.exchange_keypair.secret.to_bytes(),
        )
    }
}

impl Clone for NodeIdentity {
    fn clone(&self) -> Self {
        let (signing_bytes, exchange_bytes) = self.export_secrets();
        Self::from_keys(signing_bytes, exchange_bytes)
    }
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

impl PublicIdentity {
    /// Deterministic wire identifier for this identity
    pub fn tag(&self) -> String {
        let mut bytes = [0u8; PUBLIC_IDENTITY_SIZE];
        bytes[..ED25519_PUBKEY_SIZE].copy_from_slice(&self.signing_pubkey);
        bytes[ED25519_PUBKEY_SIZE..].copy_from_slice(self.exchange_pubkey.as_bytes());
        STANDARD_NO_PAD.encode(bytes)
    }

    /// Parse a tag produced by [`PublicIdentity::tag`]
    pub fn from_tag(tag: &str) -> CryptoResult<Self> {
        let bytes = STANDARD_NO_PAD
            .decode(tag)
            .map_err(|e| CryptoError::InvalidTag(e.to_string()))?;

        if bytes.len() != PUBLIC_IDENTITY_SIZE {
            return Err(CryptoError::InvalidTag(format!(
                "expected {} bytes, got {}",
                PUBLIC_IDENTITY_SIZE,
                bytes.len()
            )));
        }

        let mut signing_pubkey = [0u8; ED25519_PUBKEY_SIZE];
        signing_pubkey.copy_from_slice(&bytes[..ED25519_PUBKEY_SIZE]);
        VerifyingKey::from_bytes(&signing_pubkey).map_err(|_| CryptoError::InvalidPublicKey)?;

        let mut exchange = [0u8; X25519_KEY_SIZE];
        exchange.copy_from_slice(&bytes[ED25519_PUBKEY_SIZE..]);

        Ok(Self {
            signing_pubkey,
            exchange_pubkey: PublicKey::from_bytes(exchange),
        })
    }

    /// Verify a signature from this node
    pub fn verify(&self, message: &[u8], signature: &Signature) -> CryptoResult<()> {
        let verifying_key = VerifyingKey::from_bytes(&self.signing_pubkey)
            .map_err(|_| CryptoError::InvalidPublicKey)?;

        let sig = Ed25519Sig::from_bytes(&signature.bytes);

        verifying_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::SignatureVerificationFailed)
    }
}

impl std::fmt::Debug for PublicIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = self.tag();
        write!(f, "PublicIdentity({})", &tag[..12])
    }
}

impl std::fmt::Display for PublicIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let identity = NodeIdentity::generate();
        let public = identity.public_identity();

        let message = b"Hello, drmchain!";
        let signature = identity.sign(message);

        // Should verify correctly
        assert!(public.verify(message, &signature).is_ok());

        // Different message should fail
        let wrong_message = b"Hello, World!";
        assert!(public.verify(wrong_message, &signature).is_err());

        // Different signer should fail
        let other = NodeIdentity::generate();
        assert!(other.public_identity().verify(message, &signature).is_err());
    }

    #[test]
    fn test_export_import() {
        let identity = NodeIdentity::generate();
        let (signing_bytes, exchange_bytes) = identity.export_secrets();

        let restored = NodeIdentity::from_keys(signing_bytes, exchange_bytes);

        assert_eq!(identity.public_identity(), restored.public_identity());
        assert_eq!(identity.tag(), restored.tag());
    }

    #[test]
    fn test_tag_roundtrip() {
        let identity = NodeIdentity::generate();
        let tag = identity.tag();

        let parsed = PublicIdentity::from_tag(&tag).unwrap();
        assert_eq!(&parsed, identity.public_identity());

        // Tags are deterministic and distinct per identity
        assert_eq!(tag, identity.clone().tag());
        assert_ne!(tag, NodeIdentity::generate().tag());
    }

    #[test]
    fn test_malformed_tag_rejected() {
        assert!(PublicIdentity::from_tag("not base64 !!").is_err());
        assert!(PublicIdentity::from_tag(&STANDARD_NO_PAD.encode([1u8; 10])).is_err());
    }
}
