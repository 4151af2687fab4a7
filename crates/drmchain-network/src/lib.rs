//! drmchain Network Layer
//!
//! Provides the secure transport between drmchain nodes:
//! - UDP handshake (signed 4-message exchange producing a session)
//! - Session registry
//! - Sealed tunnels over TCP with ratcheting keys, acks and retry
//! - Gossip endpoint binding tunnels to sessions
//! - `Network`, wiring the pieces together for a node

pub mod error;
pub mod encoding;
pub mod subscription;
pub mod session;
pub mod connection;
pub mod handshake;
pub mod gossip;
pub mod node;

pub use error::{NetworkError, NetworkResult, SealError, SealResult};
pub use subscription::Subscription;
pub use session::{Peer, Session, SessionRegistry};
pub use connection::{Connection, DuplexTunnel, GossipConnection, OnConnect};
pub use handshake::{HandshakeEndpoint, HandshakeMessage, Handshaker, SignedEnvelope};
pub use gossip::{
    ControlErrorKind, ControlMessage, GossipEndpoint, Gossiper, MessageSeal, SealKind, Sealer, Tunnel,
};
pub use node::Network;

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Maximum handshake datagram size
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// Default handshake (UDP) port
pub const DEFAULT_HANDSHAKE_PORT: u16 = 2503;

/// Default gossip (TCP) port
pub const DEFAULT_GOSSIP_PORT: u16 = 2504;

/// Network configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Where the handshake endpoint listens
    pub handshake_addr: SocketAddr,

    /// Where the gossip endpoint listens
    pub gossip_addr: SocketAddr,

    /// Bound on handshake steps, acknowledgements and the tunnel's
    /// initial exchange
    pub response_timeout: Duration,

    /// Back-off after a transient transport error
    pub poll_interval: Duration,

    /// Largest forward sequence jump a tunnel will fast-forward over
    /// (`None` = unbounded)
    pub max_sequence_gap: Option<u64>,

    /// Depth of the publish/subscribe buffers
    pub channel_capacity: usize,

    /// Largest gossip frame accepted, in bytes
    pub max_frame_len: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            handshake_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_HANDSHAKE_PORT)),
            gossip_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_GOSSIP_PORT)),
            response_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            max_sequence_gap: None,
            channel_capacity: 1024,
            max_frame_len: 1024 * 1024,
        }
    }
}

impl NetworkConfig {
    /// Defaults bound to ephemeral loopback ports
    pub fn local() -> Self {
        Self {
            handshake_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            gossip_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Self::default()
        }
    }

    /// Reject settings the transport cannot run with
    pub fn validate(&self) -> NetworkResult<()> {
        if self.response_timeout.is_zero() {
            return Err(NetworkError::Config("response_timeout must be non-zero".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(NetworkError::Config("poll_interval must be non-zero".into()));
        }
        if self.channel_capacity == 0 {
            return Err(NetworkError::Config("channel_capacity must be non-zero".into()));
        }
        if self.max_frame_len == 0 {
            return Err(NetworkError::Config("max_frame_len must be non-zero".into()));
        }
        Ok(())
    }
}
