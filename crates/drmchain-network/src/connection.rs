//! Connection Abstractions
//!
//! What the rest of a node sees of the transport: a connection to an
//! authenticated peer, and the duplex tunnel it carries.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::NetworkResult;
use crate::gossip::Tunnel;
use crate::session::Peer;
use crate::subscription::Subscription;

/// Callback invoked whenever a connection is established, in either direction
pub type OnConnect = Arc<dyn Fn(Arc<dyn Connection>) + Send + Sync>;

/// A reliable, ordered, sealed byte-message channel
#[async_trait]
pub trait DuplexTunnel: Send + Sync {
    /// Queue a payload; delivery is retried until the peer acknowledges it
    fn send(&self, payload: Bytes) -> NetworkResult<()>;

    /// Receive every data payload published from now on
    fn subscribe(&self) -> Subscription<Bytes>;

    /// Resolve once the tunnel has closed
    async fn wait_close(&self);

    /// Close the tunnel. Safe to call more than once.
    async fn close(&self) -> NetworkResult<()>;

    /// Whether the tunnel has closed
    fn is_closed(&self) -> bool;
}

/// An established link to a peer
pub trait Connection: Send + Sync {
    /// The authenticated remote side
    fn peer(&self) -> &Peer;

    /// Session the link was built from
    fn session_id(&self) -> &str;

    /// The tunnel carrying this connection's traffic
    fn tunnel(&self) -> Arc<dyn DuplexTunnel>;
}

/// A connection carried by a gossip stream
pub struct GossipConnection {
    peer: Peer,
    tunnel: Arc<Tunnel>,
}

impl GossipConnection {
    /// Bind a tunnel to the peer it talks to
    pub fn new(peer: Peer, tunnel: Arc<Tunnel>) -> Self {
        Self { peer, tunnel }
    }
}

impl Connection for GossipConnection {
    fn peer(&self) -> &Peer {
        &self.peer
    }

    fn session_id(&self) -> &str {
        &self.tunnel.session().id
    }

    fn tunnel(&self) -> Arc<dyn DuplexTunnel> {
        self.tunnel.clone()
    }
}

impl std::fmt::Debug for GossipConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipConnection")
            .field("peer", &self.peer)
            .field("tunnel", &self.tunnel)
            .finish()
    }
}
