//! Gossip Endpoint
//!
//! Turns handshake sessions into live tunnels over TCP:
//! - The initiator dials the responder's advertised stream address and
//!   announces the session id
//! - The acceptor claims the session from the registry (once only) and
//!   answers with the id sealed under the session keys
//! - Both sides report the new connection through the `OnConnect` callback

pub mod messages;
pub mod sealer;
pub mod tunnel;

pub use messages::{ControlErrorKind, ControlMessage, MessageSeal, SealKind};
pub use sealer::Sealer;
pub use tunnel::Tunnel;

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use drmchain_crypto::NodeIdentity;
use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{Connection, DuplexTunnel, GossipConnection, OnConnect};
use crate::encoding::frame_codec;
use crate::error::{NetworkError, NetworkResult};
use crate::session::{Session, SessionRegistry};
use crate::NetworkConfig;

/// Establishes tunnels for handshake sessions
#[async_trait]
pub trait Gossiper: Send + Sync {
    /// Bind and start accepting; returns the bound address
    async fn listen(&self, addr: SocketAddr, on_connect: OnConnect) -> NetworkResult<SocketAddr>;

    /// Open a tunnel for a session this node initiated
    async fn connect_to(&self, session: Arc<Session>) -> NetworkResult<Arc<dyn Connection>>;

    /// Stop accepting. Established tunnels are left to their owners.
    async fn close(&self) -> NetworkResult<()>;
}

struct GossipShared {
    identity: Arc<NodeIdentity>,
    sessions: Arc<SessionRegistry>,
    config: NetworkConfig,
    on_connect: OnceLock<OnConnect>,
    local_addr: OnceLock<SocketAddr>,
    cancel: CancellationToken,
}

/// TCP gossip endpoint
#[derive(Clone)]
pub struct GossipEndpoint {
    shared: Arc<GossipShared>,
}

impl GossipEndpoint {
    /// Create an endpoint that resolves sessions from `sessions`
    pub fn new(identity: Arc<NodeIdentity>, sessions: Arc<SessionRegistry>, config: NetworkConfig) -> Self {
        Self {
            shared: Arc::new(GossipShared {
                identity,
                sessions,
                config,
                on_connect: OnceLock::new(),
                local_addr: OnceLock::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Bound address, once listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr.get().copied()
    }
}

impl GossipShared {
    /// Take the session for an inbound stream.
    ///
    /// Fails if the id is unknown or a tunnel already owns the session.
    fn claim_session(&self, id: &str) -> NetworkResult<Arc<Session>> {
        let session = self
            .sessions
            .get_session(id)
            .ok_or_else(|| NetworkError::SessionUnknown(id.to_string()))?;

        if !session.try_mark_connected() {
            return Err(NetworkError::SessionAlreadyConnected(id.to_string()));
        }
        Ok(session)
    }

    fn notify(&self, connection: Arc<dyn Connection>) {
        if let Some(on_connect) = self.on_connect.get() {
            on_connect(connection);
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, from)) => {
                    debug!("Gossip connection from {}", from);
                    let shared = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = shared.accept_connection(stream, from).await {
                            warn!("Rejected gossip connection from {}: {}", from, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Error accepting gossip connection: {}", e);
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
        debug!("Gossip listener stopped");
    }

    async fn accept_connection(&self, stream: TcpStream, from: SocketAddr) -> NetworkResult<()> {
        let mut framed = Framed::new(stream, frame_codec(self.config.max_frame_len));

        let announced = match tokio::time::timeout(self.config.response_timeout, framed.next()).await {
            Err(_) => return Err(NetworkError::Timeout("session announcement")),
            Ok(None) => return Err(NetworkError::TransportClosed),
            Ok(Some(frame)) => frame?,
        };
        let session_id = String::from_utf8(announced.to_vec())
            .map_err(|e| NetworkError::Encoding(e.to_string()))?;

        let session = self.claim_session(&session_id)?;
        let tunnel = Tunnel::new(framed, session.clone(), self.identity.public_identity(), &self.config)?;
        if let Err(e) = tunnel.answer_init().await {
            let _ = tunnel.close().await;
            return Err(e);
        }

        // Subscribers attached in the callback see every frame
        self.notify(Arc::new(GossipConnection::new(session.peer.clone(), tunnel.clone())));
        tunnel.start();

        info!(
            "Accepted tunnel from {} ({:?}) for session {}",
            from, session.peer.identity, session.id
        );
        Ok(())
    }

    /// Dial the session's stream address and run the initiator exchange
    async fn dial(&self, session: &Arc<Session>) -> NetworkResult<Arc<Tunnel>> {
        let stream = TcpStream::connect(session.peer.addr).await?;
        let framed = Framed::new(stream, frame_codec(self.config.max_frame_len));
        let tunnel = Tunnel::new(framed, session.clone(), self.identity.public_identity(), &self.config)?;

        if let Err(e) = tunnel.send_init().await {
            let _ = tunnel.close().await;
            return Err(e);
        }
        Ok(tunnel)
    }
}

#[async_trait]
impl Gossiper for GossipEndpoint {
    async fn listen(&self, addr: SocketAddr, on_connect: OnConnect) -> NetworkResult<SocketAddr> {
        if let Some(bound) = self.local_addr() {
            return Err(NetworkError::AlreadyListening(bound));
        }

        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        self.shared
            .local_addr
            .set(bound)
            .map_err(NetworkError::AlreadyListening)?;
        let _ = self.shared.on_connect.set(on_connect);

        tokio::spawn(self.shared.clone().accept_loop(listener));
        info!("Gossip endpoint listening on {}", bound);
        Ok(bound)
    }

    async fn connect_to(&self, session: Arc<Session>) -> NetworkResult<Arc<dyn Connection>> {
        if !session.try_mark_connected() {
            return Err(NetworkError::SessionAlreadyConnected(session.id.clone()));
        }

        let tunnel = match self.shared.dial(&session).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                session.release();
                return Err(e);
            }
        };

        let connection: Arc<dyn Connection> =
            Arc::new(GossipConnection::new(session.peer.clone(), tunnel.clone()));
        self.shared.notify(connection.clone());
        tunnel.start();

        info!(
            "Opened tunnel to {} ({:?}) for session {}",
            session.peer.addr, session.peer.identity, session.id
        );
        Ok(connection)
    }

    async fn close(&self) -> NetworkResult<()> {
        self.shared.cancel.cancel();
        Ok(())
    }
}
