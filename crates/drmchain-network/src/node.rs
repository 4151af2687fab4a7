//! Network
//!
//! The composition root a node runs: one handshake endpoint, one gossip
//! endpoint, a shared session registry, and the set of live connections
//! keyed by peer tag. A connection leaves the set (and its session the
//! registry) when its tunnel closes.
//!
//! The handler given to [`Network::open`] sees each new connection before
//! its tunnel starts reading, so payload subscribers attached there miss
//! nothing. [`Network::subscribe`] events may arrive later.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use drmchain_crypto::{NodeIdentity, PublicIdentity};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::connection::{Connection, DuplexTunnel, OnConnect};
use crate::error::NetworkResult;
use crate::gossip::{GossipEndpoint, Gossiper};
use crate::handshake::{HandshakeEndpoint, Handshaker};
use crate::session::{Peer, SessionRegistry};
use crate::subscription::Subscription;
use crate::NetworkConfig;

/// Live connections, keyed by peer tag
struct ConnectionRegistry {
    connections: DashMap<String, Arc<dyn Connection>>,
    sessions: Arc<SessionRegistry>,
    handler: OnceLock<OnConnect>,
    events: broadcast::Sender<Arc<dyn Connection>>,
}

impl ConnectionRegistry {
    fn register(self: &Arc<Self>, connection: Arc<dyn Connection>) {
        let tag = connection.peer().tag();
        if let Some(existing) = self.connections.get(&tag) {
            if Arc::ptr_eq(existing.value(), &connection) {
                return;
            }
        }

        debug!("Registered connection to {:?}", connection.peer().identity);
        self.connections.insert(tag.clone(), connection.clone());
        if let Some(handler) = self.handler.get() {
            handler(connection.clone());
        }
        let _ = self.events.send(connection.clone());

        let registry = self.clone();
        tokio::spawn(async move {
            connection.tunnel().wait_close().await;
            registry
                .connections
                .remove_if(&tag, |_, current| Arc::ptr_eq(current, &connection));
            registry.sessions.remove_session(connection.session_id());
            debug!("Connection to {:?} closed", connection.peer().identity);
        });
    }
}

/// A node's view of the drmchain network
pub struct Network {
    identity: Arc<NodeIdentity>,
    config: NetworkConfig,
    handshake: HandshakeEndpoint,
    gossip: GossipEndpoint,
    registry: Arc<ConnectionRegistry>,
    closed: CancellationToken,
}

impl Network {
    /// Wire up the endpoints. Nothing is bound until [`open`](Self::open).
    pub fn new(identity: NodeIdentity, config: NetworkConfig) -> NetworkResult<Self> {
        config.validate()?;

        let identity = Arc::new(identity);
        let sessions = Arc::new(SessionRegistry::new());
        let handshake = HandshakeEndpoint::new(identity.clone(), sessions.clone(), config.clone());
        let gossip = GossipEndpoint::new(identity.clone(), sessions.clone(), config.clone());
        let (events, _) = broadcast::channel(config.channel_capacity);

        Ok(Self {
            identity,
            config,
            handshake,
            gossip,
            registry: Arc::new(ConnectionRegistry {
                connections: DashMap::new(),
                sessions,
                handler: OnceLock::new(),
                events,
            }),
            closed: CancellationToken::new(),
        })
    }

    /// This node's public identity
    pub fn identity(&self) -> &PublicIdentity {
        self.identity.public_identity()
    }

    /// Start both endpoints.
    ///
    /// `handler` runs for every new connection, dialed or accepted, before
    /// its tunnel reads the first frame. The gossip endpoint binds first so
    /// the handshake can advertise the address it actually got.
    pub async fn open(&self, handler: OnConnect) -> NetworkResult<()> {
        let _ = self.registry.handler.set(handler);
        let registry = self.registry.clone();
        let on_connect: OnConnect = Arc::new(move |connection: Arc<dyn Connection>| {
            registry.register(connection);
        });

        let gossip_addr = self.gossip.listen(self.config.gossip_addr, on_connect).await?;
        self.handshake.set_stream_addr(gossip_addr);
        let handshake_addr = self.handshake.listen(self.config.handshake_addr).await?;

        info!(
            "Network open as {:?} (handshake {}, gossip {})",
            self.identity(), handshake_addr, gossip_addr
        );
        Ok(())
    }

    /// Bound handshake address, once open
    pub fn handshake_addr(&self) -> Option<SocketAddr> {
        self.handshake.local_addr()
    }

    /// Bound gossip address, once open
    pub fn gossip_addr(&self) -> Option<SocketAddr> {
        self.gossip.local_addr()
    }

    /// Handshake with `identity` at `handshake_addr`, then open a tunnel
    pub async fn connect_to(
        &self,
        identity: PublicIdentity,
        handshake_addr: SocketAddr,
    ) -> NetworkResult<Arc<dyn Connection>> {
        let session = self
            .handshake
            .connect_to(&Peer::new(identity, handshake_addr))
            .await?;

        let connection = match self.gossip.connect_to(session.clone()).await {
            Ok(connection) => connection,
            Err(e) => {
                self.registry.sessions.remove_session(&session.id);
                return Err(e);
            }
        };
        self.register_connection(connection.clone());
        Ok(connection)
    }

    /// Track a connection until its tunnel closes
    pub fn register_connection(&self, connection: Arc<dyn Connection>) {
        self.registry.register(connection);
    }

    /// Snapshot of live connections
    pub fn connections(&self) -> Vec<Arc<dyn Connection>> {
        self.registry
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Live connection to the peer with `tag`
    pub fn connection(&self, tag: &str) -> Option<Arc<dyn Connection>> {
        self.registry
            .connections
            .get(tag)
            .map(|entry| entry.value().clone())
    }

    /// Connections registered from now on, in either direction.
    ///
    /// Events can arrive after the tunnel started delivering; attach payload
    /// subscribers in the [`open`](Self::open) handler instead.
    pub fn subscribe(&self) -> Subscription<Arc<dyn Connection>> {
        Subscription::new(self.registry.events.subscribe(), self.closed.clone())
    }

    /// Stop both endpoints and close every live tunnel
    pub async fn close(&self) -> NetworkResult<()> {
        self.closed.cancel();
        self.handshake.close().await?;
        self.gossip.close().await?;

        for connection in self.connections() {
            if let Err(e) = connection.tunnel().close().await {
                debug!("Error closing connection to {:?}: {}", connection.peer().identity, e);
            }
        }
        info!("Network closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use bytes::Bytes;

    const WAIT: Duration = Duration::from_secs(3);

    async fn open_network() -> Network {
        let network = Network::new(NodeIdentity::generate(), NetworkConfig::local()).unwrap();
        network.open(ignore_connections()).await.unwrap();
        network
    }

    fn ignore_connections() -> OnConnect {
        Arc::new(|_: Arc<dyn Connection>| {})
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..300 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn test_end_to_end() {
        let alice = open_network().await;
        let bob = open_network().await;
        let mut bob_events = bob.subscribe();

        let to_bob = alice
            .connect_to(bob.identity().clone(), bob.handshake_addr().unwrap())
            .await
            .unwrap();
        assert_eq!(to_bob.peer().identity, *bob.identity());
        assert!(alice.connection(&bob.identity().tag()).is_some());

        let from_alice = bob_events.recv_timeout(WAIT).await.expect("bob should see alice");
        assert_eq!(from_alice.peer().identity, *alice.identity());
        assert_eq!(from_alice.session_id(), to_bob.session_id());

        let mut inbox = from_alice.tunnel().subscribe();
        to_bob.tunnel().send(Bytes::from_static(b"Hello, world!")).unwrap();
        to_bob.tunnel().send(Bytes::from_static(b"Goodbye, world! 2")).unwrap();
        assert_eq!(inbox.recv_timeout(WAIT).await, Some(Bytes::from_static(b"Hello, world!")));
        assert_eq!(inbox.recv_timeout(WAIT).await, Some(Bytes::from_static(b"Goodbye, world! 2")));

        let mut reply_inbox = to_bob.tunnel().subscribe();
        from_alice.tunnel().send(Bytes::from_static(b"Hi Alice")).unwrap();
        assert_eq!(reply_inbox.recv_timeout(WAIT).await, Some(Bytes::from_static(b"Hi Alice")));

        alice.close().await.unwrap();
        let alice_tag = alice.identity().tag();
        wait_until(|| bob.connection(&alice_tag).is_none()).await;
        assert!(to_bob.tunnel().is_closed());

        bob.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_to_wrong_identity_fails() {
        let config = NetworkConfig {
            response_timeout: Duration::from_millis(300),
            ..NetworkConfig::local()
        };
        let alice = Network::new(NodeIdentity::generate(), config).unwrap();
        alice.open(ignore_connections()).await.unwrap();
        let bob = open_network().await;

        let imposter = NodeIdentity::generate();
        let result = alice
            .connect_to(imposter.public_identity().clone(), bob.handshake_addr().unwrap())
            .await;
        assert!(result.is_err());
        assert!(alice.connections().is_empty());
    }

    #[tokio::test]
    async fn test_payload_sent_right_after_connect_is_delivered() {
        let alice = open_network().await;

        let inboxes = Arc::new(Mutex::new(Vec::<Subscription<Bytes>>::new()));
        let sink = inboxes.clone();
        let bob = Network::new(NodeIdentity::generate(), NetworkConfig::local()).unwrap();
        bob.open(Arc::new(move |connection: Arc<dyn Connection>| {
            sink.lock().unwrap().push(connection.tunnel().subscribe());
        }))
        .await
        .unwrap();

        let to_bob = alice
            .connect_to(bob.identity().clone(), bob.handshake_addr().unwrap())
            .await
            .unwrap();
        to_bob.tunnel().send(Bytes::from_static(b"first")).unwrap();
        to_bob.tunnel().send(Bytes::from_static(b"second")).unwrap();

        wait_until(|| !inboxes.lock().unwrap().is_empty()).await;
        let mut inbox = inboxes.lock().unwrap().remove(0);
        assert_eq!(inbox.recv_timeout(WAIT).await, Some(Bytes::from_static(b"first")));
        assert_eq!(inbox.recv_timeout(WAIT).await, Some(Bytes::from_static(b"second")));

        alice.close().await.unwrap();
        bob.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_sees_dialed_connections() {
        let dialed = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = dialed.clone();
        let alice = Network::new(NodeIdentity::generate(), NetworkConfig::local()).unwrap();
        alice
            .open(Arc::new(move |connection: Arc<dyn Connection>| {
                sink.lock().unwrap().push(connection.peer().tag());
            }))
            .await
            .unwrap();
        let bob = open_network().await;

        alice
            .connect_to(bob.identity().clone(), bob.handshake_addr().unwrap())
            .await
            .unwrap();
        assert_eq!(*dialed.lock().unwrap(), vec![bob.identity().tag()]);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = NetworkConfig {
            max_frame_len: 0,
            ..NetworkConfig::local()
        };
        assert!(Network::new(NodeIdentity::generate(), config).is_err());
    }
}
