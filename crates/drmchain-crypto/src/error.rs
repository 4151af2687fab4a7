//! Cryptographic error types

use thiserror::Error;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Invalid key length provided
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Cipher construction or keystream application failed
    #[error("Cipher failure: {0}")]
    CipherFailed(String),

    /// Message authentication code did not match
    #[error("MAC verification failed")]
    MacVerificationFailed,

    /// Signature verification failed
    #[error("Signature verification failed")]
    SignatureVerificationFailed,

    /// Invalid signature format
    #[error("Invalid signature format")]
    InvalidSignature,

    /// Key derivation failed
    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    /// Invalid public key (malformed, or yields a non-contributory secret)
    #[error("Invalid public key")]
    InvalidPublicKey,

    /// Identity tag could not be parsed
    #[error("Invalid identity tag: {0}")]
    InvalidTag(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;
