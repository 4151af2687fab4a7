//! Gossip wire messages

use serde::{Deserialize, Serialize};

use crate::encoding;
use crate::error::NetworkResult;

/// Which subscriber channel a frame is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SealKind {
    /// Application payload
    Data,
    /// Acknowledgement or error report
    Control,
}

/// An encrypted, authenticated frame on a gossip stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSeal {
    /// Routing kind
    pub kind: SealKind,

    /// Session the frame belongs to
    pub session_id: String,

    /// HMAC-SHA256 over `ciphertext || be64(sequence)`
    pub mac: Vec<u8>,

    /// Ratchet position the frame was sealed at
    pub sequence: u64,

    /// Encrypted payload
    pub ciphertext: Vec<u8>,
}

impl MessageSeal {
    /// Encode for the wire
    pub fn to_bytes(&self) -> NetworkResult<Vec<u8>> {
        encoding::encode(self)
    }

    /// Decode from the wire
    pub fn from_bytes(bytes: &[u8]) -> NetworkResult<Self> {
        encoding::decode(bytes)
    }
}

/// Reason a frame was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlErrorKind {
    /// Frame could not be decoded
    UnreadableSeal,
    /// Frame was for another session
    WrongSession,
    /// Frame was older than the receiver's ratchet
    WrongSequence,
    /// MAC check failed
    InvalidSeal,
    /// Receiver failed for its own reasons
    InternalError,
}

/// Reply to a data frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    /// Whether the frame was accepted
    pub succeeded: bool,

    /// Set when `succeeded` is false
    pub error: Option<ControlErrorKind>,

    /// Sequence of the frame this replies to
    pub acknowledged_sequence: u64,
}

impl ControlMessage {
    /// Positive acknowledgement
    pub fn ack(sequence: u64) -> Self {
        Self {
            succeeded: true,
            error: None,
            acknowledged_sequence: sequence,
        }
    }

    /// Negative acknowledgement
    pub fn reject(kind: ControlErrorKind, sequence: u64) -> Self {
        Self {
            succeeded: false,
            error: Some(kind),
            acknowledged_sequence: sequence,
        }
    }
}
