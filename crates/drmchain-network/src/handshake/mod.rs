//! Handshake Endpoint
//!
//! Four signed datagrams over UDP establish a session:
//!
//! ```text
//! initiator                                   responder
//!   Hello{src, dst, addr, nonce_a}        ->
//!                                         <-  Challenge{nonce_a, nonce_b}
//!   Answer{ephemeral, nonce_b, accept}    ->
//!                                         <-  Accepted{accept, id, sig(secret), stream}
//! ```
//!
//! The secret is X25519 between the initiator's ephemeral key and the
//! responder's static key; the key seed is `HKDF-Extract(nonce_a || nonce_b,
//! secret)`. The responder signs the raw secret so the initiator learns the
//! responder really holds the identity it dialed.

pub mod messages;

pub use messages::{
    generate_nonce, Accepted, Answer, Challenge, HandshakeMessage, Hello, Nonce, SignedEnvelope,
};

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use drmchain_crypto::{extract, EphemeralKeyPair, KeySeed, NodeIdentity, PublicIdentity, SharedSecret};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{NetworkError, NetworkResult};
use crate::session::{Peer, Session, SessionRegistry};
use crate::subscription::Subscription;
use crate::{NetworkConfig, MAX_DATAGRAM_SIZE};

/// Authenticated key exchange producing sessions
#[async_trait]
pub trait Handshaker: Send + Sync {
    /// Bind and start answering handshakes; returns the bound address
    async fn listen(&self, addr: SocketAddr) -> NetworkResult<SocketAddr>;

    /// Run the initiator side against `peer` (its handshake address)
    async fn connect_to(&self, peer: &Peer) -> NetworkResult<Arc<Session>>;

    /// Stop listening and abort pending handshakes
    async fn close(&self) -> NetworkResult<()>;
}

/// A datagram other than Hello, handed to whichever handshake waits for it
#[derive(Debug, Clone)]
struct Datagram {
    from: SocketAddr,
    envelope: SignedEnvelope,
}

struct HandshakeShared {
    identity: Arc<NodeIdentity>,
    sessions: Arc<SessionRegistry>,
    config: NetworkConfig,
    stream_addr: Mutex<SocketAddr>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    inbox: broadcast::Sender<Datagram>,
    cancel: CancellationToken,
}

/// UDP handshake endpoint, acting as initiator and responder at once
#[derive(Clone)]
pub struct HandshakeEndpoint {
    shared: Arc<HandshakeShared>,
}

impl HandshakeEndpoint {
    /// Create an endpoint that stores sessions in `sessions`.
    ///
    /// The advertised stream address starts as `config.gossip_addr`.
    pub fn new(identity: Arc<NodeIdentity>, sessions: Arc<SessionRegistry>, config: NetworkConfig) -> Self {
        let (inbox, _) = broadcast::channel(config.channel_capacity);
        Self {
            shared: Arc::new(HandshakeShared {
                identity,
                sessions,
                stream_addr: Mutex::new(config.gossip_addr),
                config,
                socket: Mutex::new(None),
                inbox,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Set the gossip address handed out in `Accepted`
    pub fn set_stream_addr(&self, addr: SocketAddr) {
        *self
            .shared
            .stream_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = addr;
    }

    /// Bound address, once listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.socket().ok().and_then(|socket| socket.local_addr().ok())
    }
}

fn derive_seed(nonce_a: &Nonce, nonce_b: &Nonce, secret: &SharedSecret) -> KeySeed {
    let salt = [nonce_a.as_slice(), nonce_b.as_slice()].concat();
    extract(&salt, secret.as_bytes())
}

impl HandshakeShared {
    fn socket(&self) -> NetworkResult<Arc<UdpSocket>> {
        self.socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(NetworkError::NotListening)
    }

    fn stream_addr(&self) -> SocketAddr {
        *self.stream_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribe(&self) -> Subscription<Datagram> {
        Subscription::new(self.inbox.subscribe(), self.cancel.clone())
    }

    async fn send(&self, message: HandshakeMessage, to: SocketAddr) -> NetworkResult<()> {
        let socket = self.socket()?;
        let bytes = SignedEnvelope::seal(&self.identity, &message)?.to_bytes()?;
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(NetworkError::Encoding(format!(
                "Handshake datagram too large: {} bytes",
                bytes.len()
            )));
        }

        trace!("Sending {} ({} bytes) to {}", message.name(), bytes.len(), to);
        socket.send_to(&bytes, to).await?;
        Ok(())
    }

    /// Wait for the next `step` message from `peer`.
    ///
    /// Datagrams from other addresses, with bad signatures, or of another
    /// kind are skipped.
    async fn wait_for<T>(
        &self,
        inbox: &mut Subscription<Datagram>,
        peer: &Peer,
        step: &'static str,
        pick: impl Fn(HandshakeMessage) -> Option<T>,
    ) -> NetworkResult<T> {
        let wait = async {
            while let Some(datagram) = inbox.recv().await {
                if datagram.from != peer.addr {
                    continue;
                }
                match datagram.envelope.open(&peer.identity) {
                    Ok(message) => {
                        if let Some(found) = pick(message) {
                            return Ok(found);
                        }
                    }
                    Err(e) => debug!("Discarding {} candidate from {}: {}", step, datagram.from, e),
                }
            }
            Err(NetworkError::TransportClosed)
        };

        tokio::time::timeout(self.config.response_timeout, wait)
            .await
            .map_err(|_| NetworkError::HandshakeTimeout(step))?
    }

    async fn listen_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => received,
            };

            let (len, from) = match received {
                Ok(received) => received,
                Err(e) => {
                    warn!("Error receiving handshake datagram: {}", e);
                    tokio::time::sleep(self.config.poll_interval).await;
                    continue;
                }
            };
            trace!("Received {} bytes from {}", len, from);

            let envelope = match SignedEnvelope::from_bytes(&buf[..len]) {
                Ok(envelope) => envelope,
                Err(e) => {
                    debug!("Dropping malformed handshake datagram from {}: {}", from, e);
                    continue;
                }
            };

            match envelope.message() {
                Ok(HandshakeMessage::Hello(hello)) => self.on_hello(hello, &envelope, from),
                Ok(_) => {
                    // Nobody waiting is fine
                    let _ = self.inbox.send(Datagram { from, envelope });
                }
                Err(e) => debug!("Dropping undecodable handshake payload from {}: {}", from, e),
            }
        }
        debug!("Handshake listener stopped");
    }

    fn on_hello(self: &Arc<Self>, hello: Hello, envelope: &SignedEnvelope, from: SocketAddr) {
        if hello.dst_tag != self.identity.tag() {
            debug!("Ignoring hello from {} addressed to another node", from);
            return;
        }

        let initiator = match PublicIdentity::from_tag(&hello.src_tag) {
            Ok(identity) => identity,
            Err(e) => {
                warn!("Dropping hello from {} with bad tag: {}", from, e);
                return;
            }
        };
        if let Err(e) = envelope.open(&initiator) {
            warn!("Dropping unauthenticated hello from {}: {}", from, e);
            return;
        }

        let shared = self.clone();
        tokio::spawn(async move {
            let peer = Peer::new(initiator, from);
            match shared.respond(hello, peer).await {
                Ok(session) => info!(
                    "Handshake with {} ({:?}) complete, session {}",
                    from, session.peer.identity, session.id
                ),
                Err(e) => warn!("Handshake with {} failed: {}", from, e),
            }
        });
    }

    async fn respond(&self, hello: Hello, initiator: Peer) -> NetworkResult<Arc<Session>> {
        let mut inbox = self.subscribe();
        let nonce_b = generate_nonce();

        self.send(
            HandshakeMessage::Challenge(Challenge {
                nonce_a: hello.nonce_a,
                nonce_b,
            }),
            initiator.addr,
        )
        .await?;

        let answer = self
            .wait_for(&mut inbox, &initiator, "answer", |message| match message {
                HandshakeMessage::Answer(answer) => Some(answer),
                _ => None,
            })
            .await?;
        if answer.nonce_b != nonce_b {
            return Err(NetworkError::HandshakeNonceMismatch("answer"));
        }

        let secret = self
            .identity
            .exchange_keypair()
            .secret
            .diffie_hellman(&answer.ephemeral_pubkey)?;
        let key_seed = derive_seed(&hello.nonce_a, &nonce_b, &secret);
        let session = self.sessions.generate_session(initiator.clone(), key_seed);

        let accepted = Accepted {
            accept_nonce: answer.accept_nonce,
            session_id: session.id.clone(),
            secret_signature: self.identity.sign(secret.as_bytes()),
            stream_addr: self.stream_addr(),
        };
        if let Err(e) = self.send(HandshakeMessage::Accepted(accepted), initiator.addr).await {
            self.sessions.remove_session(&session.id);
            return Err(e);
        }
        Ok(session)
    }

    async fn initiate(&self, peer: &Peer) -> NetworkResult<Arc<Session>> {
        let socket = self.socket()?;
        let mut inbox = self.subscribe();
        let nonce_a = generate_nonce();

        self.send(
            HandshakeMessage::Hello(Hello {
                src_tag: self.identity.tag(),
                dst_tag: peer.tag(),
                src_addr: socket.local_addr()?,
                nonce_a,
            }),
            peer.addr,
        )
        .await?;

        let challenge = self
            .wait_for(&mut inbox, peer, "challenge", |message| match message {
                HandshakeMessage::Challenge(challenge) => Some(challenge),
                _ => None,
            })
            .await?;
        if challenge.nonce_a != nonce_a {
            return Err(NetworkError::HandshakeNonceMismatch("challenge"));
        }

        let ephemeral = EphemeralKeyPair::generate();
        let accept_nonce = generate_nonce();
        self.send(
            HandshakeMessage::Answer(Answer {
                ephemeral_pubkey: ephemeral.public,
                nonce_b: challenge.nonce_b,
                accept_nonce,
            }),
            peer.addr,
        )
        .await?;

        let accepted = self
            .wait_for(&mut inbox, peer, "accepted", |message| match message {
                HandshakeMessage::Accepted(accepted) => Some(accepted),
                _ => None,
            })
            .await?;
        if accepted.accept_nonce != accept_nonce {
            return Err(NetworkError::HandshakeNonceMismatch("accepted"));
        }

        let secret = ephemeral.diffie_hellman(&peer.identity.exchange_pubkey)?;
        peer.identity
            .verify(secret.as_bytes(), &accepted.secret_signature)
            .map_err(|_| NetworkError::HandshakeSignatureInvalid)?;

        let key_seed = derive_seed(&nonce_a, &challenge.nonce_b, &secret);
        let session = self.sessions.register_session(Session::new(
            accepted.session_id,
            key_seed,
            Peer::new(peer.identity.clone(), accepted.stream_addr),
        ));

        info!(
            "Handshake with {} ({:?}) complete, session {}",
            peer.addr, peer.identity, session.id
        );
        Ok(session)
    }
}

#[async_trait]
impl Handshaker for HandshakeEndpoint {
    async fn listen(&self, addr: SocketAddr) -> NetworkResult<SocketAddr> {
        if let Ok(socket) = self.shared.socket() {
            return Err(NetworkError::AlreadyListening(socket.local_addr()?));
        }

        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let bound = socket.local_addr()?;
        *self
            .shared
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(socket.clone());

        tokio::spawn(self.shared.clone().listen_loop(socket));
        info!("Handshake endpoint listening on {}", bound);
        Ok(bound)
    }

    async fn connect_to(&self, peer: &Peer) -> NetworkResult<Arc<Session>> {
        self.shared.initiate(peer).await
    }

    async fn close(&self) -> NetworkResult<()> {
        self.shared.cancel.cancel();
        self.shared
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }
}
