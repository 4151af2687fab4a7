//! Network error types

use thiserror::Error;

/// Errors raised by a [`Sealer`](crate::gossip::Sealer)
#[derive(Debug, Error)]
pub enum SealError {
    /// Frame was sealed for another session
    #[error("Wrong session: expected {expected}, got {actual}")]
    WrongSession { expected: String, actual: String },

    /// Frame sequence does not match the ratchet position
    #[error("Wrong sequence: expected {expected}, got {actual}")]
    WrongSequence { expected: u64, actual: u64 },

    /// MAC check failed
    #[error("Invalid seal")]
    InvalidSeal,

    /// Ratchet cannot move backwards
    #[error("Cannot rewind sealer from {current} to {target}")]
    CannotRewind { current: u64, target: u64 },

    /// Key stream or cipher failure
    #[error("Crypto error: {0}")]
    Crypto(#[from] drmchain_crypto::CryptoError),
}

/// Result type for sealer operations
pub type SealResult<T> = Result<T, SealError>;

/// Network layer errors
#[derive(Debug, Error)]
pub enum NetworkError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Crypto error (from drmchain-crypto)
    #[error("Crypto error: {0}")]
    Crypto(#[from] drmchain_crypto::CryptoError),

    /// Sealing or unsealing failed
    #[error("Seal error: {0}")]
    Seal(#[from] SealError),

    /// Wire encoding error
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Handshake peer did not answer in time
    #[error("Handshake timed out waiting for {0}")]
    HandshakeTimeout(&'static str),

    /// Handshake reply did not echo our nonce
    #[error("Handshake nonce mismatch in {0}")]
    HandshakeNonceMismatch(&'static str),

    /// Responder's signature over the shared secret did not verify
    #[error("Handshake signature invalid")]
    HandshakeSignatureInvalid,

    /// Session id not present in the registry
    #[error("Unknown session: {0}")]
    SessionUnknown(String),

    /// Session already has a tunnel
    #[error("Session already connected: {0}")]
    SessionAlreadyConnected(String),

    /// Inbound frame is older than the ratchet position
    #[error("Sequence behind: expected {expected}, got {actual}")]
    SequenceBehind { expected: u64, actual: u64 },

    /// Inbound frame skipped ahead; the ratchet was fast-forwarded past it
    #[error("Sequence ahead: expected {expected}, got {actual}")]
    SequenceAhead { expected: u64, actual: u64 },

    /// Inbound frame skipped further ahead than the configured limit
    #[error("Sequence gap of {gap} exceeds limit {limit}")]
    SequenceGapExceeded { gap: u64, limit: u64 },

    /// Inbound frame belongs to another session
    #[error("Wrong session: expected {expected}, got {actual}")]
    WrongSession { expected: String, actual: String },

    /// Unexpected local failure
    #[error("Internal error: {0}")]
    InternalError(String),

    /// No acknowledgement arrived for a sealed frame
    #[error("No acknowledgement for sequence {0}")]
    AckTimeout(u64),

    /// Waiting on the stream timed out
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// Endpoint is already listening
    #[error("Already listening on {0}")]
    AlreadyListening(std::net::SocketAddr),

    /// Endpoint has not been started
    #[error("Not listening")]
    NotListening,

    /// Underlying transport is closed
    #[error("Transport closed")]
    TransportClosed,
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;
