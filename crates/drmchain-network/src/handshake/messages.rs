//! Handshake wire messages
//!
//! Every datagram is a [`SignedEnvelope`]: the encoded [`HandshakeMessage`]
//! plus the sender's Ed25519 signature over those exact bytes.

use std::net::SocketAddr;

use drmchain_crypto::{NodeIdentity, PublicIdentity, PublicKey, Signature};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::encoding;
use crate::error::{NetworkError, NetworkResult};

/// Freshness nonce size
pub const NONCE_SIZE: usize = 32;

/// Random freshness value
pub type Nonce = [u8; NONCE_SIZE];

/// Draw a fresh nonce from the OS-seeded RNG
pub fn generate_nonce() -> Nonce {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Step 1, initiator to responder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Initiator's tag; the envelope is verified against it
    pub src_tag: String,
    /// Tag of the node the initiator expects to reach
    pub dst_tag: String,
    /// Initiator's handshake address
    pub src_addr: SocketAddr,
    /// Initiator freshness
    pub nonce_a: Nonce,
}

/// Step 2, responder to initiator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    /// Echo of `Hello::nonce_a`
    pub nonce_a: Nonce,
    /// Responder freshness
    pub nonce_b: Nonce,
}

/// Step 3, initiator to responder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    /// Initiator's ephemeral X25519 key
    pub ephemeral_pubkey: PublicKey,
    /// Echo of `Challenge::nonce_b`
    pub nonce_b: Nonce,
    /// Nonce the responder must echo in `Accepted`
    pub accept_nonce: Nonce,
}

/// Step 4, responder to initiator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accepted {
    /// Echo of `Answer::accept_nonce`
    pub accept_nonce: Nonce,
    /// Id of the session the responder registered
    pub session_id: String,
    /// Responder's signature over the raw shared secret
    pub secret_signature: Signature,
    /// Where the responder accepts gossip streams
    pub stream_addr: SocketAddr,
}

/// Any handshake step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeMessage {
    Hello(Hello),
    Challenge(Challenge),
    Answer(Answer),
    Accepted(Accepted),
}

impl HandshakeMessage {
    /// Step name, for logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            HandshakeMessage::Hello(_) => "hello",
            HandshakeMessage::Challenge(_) => "challenge",
            HandshakeMessage::Answer(_) => "answer",
            HandshakeMessage::Accepted(_) => "accepted",
        }
    }
}

/// A signed handshake datagram
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    /// Encoded `HandshakeMessage`
    pub payload: Vec<u8>,
    /// Sender's signature over `payload`
    pub signature: Signature,
}

impl SignedEnvelope {
    /// Encode and sign a message
    pub fn seal(identity: &NodeIdentity, message: &HandshakeMessage) -> NetworkResult<Self> {
        let payload = encoding::encode(message)?;
        let signature = identity.sign(&payload);
        Ok(Self { payload, signature })
    }

    /// Decode the payload without checking the signature
    pub fn message(&self) -> NetworkResult<HandshakeMessage> {
        encoding::decode(&self.payload)
    }

    /// Check the signature against `signer`, then decode
    pub fn open(&self, signer: &PublicIdentity) -> NetworkResult<HandshakeMessage> {
        signer
            .verify(&self.payload, &self.signature)
            .map_err(|_| NetworkError::HandshakeSignatureInvalid)?;
        self.message()
    }

    /// Encode for the wire
    pub fn to_bytes(&self) -> NetworkResult<Vec<u8>> {
        encoding::encode(self)
    }

    /// Decode from the wire
    pub fn from_bytes(bytes: &[u8]) -> NetworkResult<Self> {
        encoding::decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello(from: &NodeIdentity, to: &NodeIdentity) -> HandshakeMessage {
        HandshakeMessage::Hello(Hello {
            src_tag: from.tag(),
            dst_tag: to.tag(),
            src_addr: "127.0.0.1:2503".parse().unwrap(),
            nonce_a: generate_nonce(),
        })
    }

    #[test]
    fn test_envelope_verifies_against_signer() {
        let alice = NodeIdentity::generate();
        let bob = NodeIdentity::generate();
        let message = hello(&alice, &bob);

        let envelope = SignedEnvelope::seal(&alice, &message).unwrap();
        let decoded = SignedEnvelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded.open(alice.public_identity()).unwrap(), message);
        assert!(matches!(
            decoded.open(bob.public_identity()),
            Err(NetworkError::HandshakeSignatureInvalid)
        ));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let alice = NodeIdentity::generate();
        let bob = NodeIdentity::generate();

        let mut envelope = SignedEnvelope::seal(&alice, &hello(&alice, &bob)).unwrap();
        let last = envelope.payload.len() - 1;
        envelope.payload[last] ^= 0x01;

        assert!(envelope.open(alice.public_identity()).is_err());
    }

    #[test]
    fn test_nonces_are_fresh() {
        assert_ne!(generate_nonce(), generate_nonce());
    }
}
