//! Sealed Tunnel
//!
//! A tunnel multiplexes sealed frames over one length-delimited stream:
//! - Data frames are sealed with our own sealer and acknowledged by the
//!   peer with a control frame
//! - Control frames are sealed with the sealer keyed by the *requester's*
//!   tag, so we verify the peer's acks with the same sealer we send with
//! - Outbound payloads sit in a FIFO queue and are re-queued until the
//!   peer acknowledges them
//! - A frame that skips ahead fast-forwards the ratchet past it; a frame
//!   from the past, or one too far ahead, closes the tunnel
//! - A rejected data frame still consumes its slot, so the negative ack is
//!   sealed where the sender expects it

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use drmchain_crypto::PublicIdentity;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::connection::DuplexTunnel;
use crate::encoding;
use crate::error::{NetworkError, NetworkResult, SealError};
use crate::gossip::messages::{ControlErrorKind, ControlMessage, MessageSeal, SealKind};
use crate::gossip::sealer::Sealer;
use crate::session::Session;
use crate::subscription::Subscription;
use crate::NetworkConfig;

type FrameSink = Pin<Box<dyn Sink<Bytes, Error = io::Error> + Send>>;
type FrameSource = Pin<Box<dyn Stream<Item = io::Result<BytesMut>> + Send>>;

/// Which of the two sealers a frame goes through
#[derive(Debug, Clone, Copy)]
enum Direction {
    /// Keyed by our tag: our data, the peer's replies to it
    Outbound,
    /// Keyed by the peer's tag: the peer's data, our replies to it
    Inbound,
}

enum FrameOutcome {
    Continue,
    Fatal,
}

/// A sealed, acknowledged, bidirectional channel bound to one session
pub struct Tunnel {
    session: Arc<Session>,
    config: NetworkConfig,
    outbound: Mutex<Sealer>,
    inbound: Mutex<Sealer>,
    /// `true` while the stream may be written; close takes it exclusively
    open: RwLock<bool>,
    writer: tokio::sync::Mutex<Option<FrameSink>>,
    reader: tokio::sync::Mutex<Option<FrameSource>>,
    queue_tx: mpsc::UnboundedSender<Bytes>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    data: broadcast::Sender<Bytes>,
    control: broadcast::Sender<Bytes>,
    closed: CancellationToken,
}

impl Tunnel {
    /// Wrap a framed stream for `session`.
    ///
    /// Nothing is read or written until [`send_init`](Self::send_init),
    /// [`answer_init`](Self::answer_init) or [`start`](Self::start).
    pub fn new<T>(
        framed: Framed<T, LengthDelimitedCodec>,
        session: Arc<Session>,
        local: &PublicIdentity,
        config: &NetworkConfig,
    ) -> NetworkResult<Arc<Self>>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let outbound = Sealer::new(session.id.clone(), &session.key_seed, &local.tag())?;
        let inbound = Sealer::new(session.id.clone(), &session.key_seed, &session.peer.tag())?;

        let (sink, source) = framed.split::<Bytes>();
        let sink: FrameSink = Box::pin(sink);
        let source: FrameSource = Box::pin(source);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (data, _) = broadcast::channel(config.channel_capacity);
        let (control, _) = broadcast::channel(config.channel_capacity);

        Ok(Arc::new(Self {
            session,
            config: config.clone(),
            outbound: Mutex::new(outbound),
            inbound: Mutex::new(inbound),
            open: RwLock::new(true),
            writer: tokio::sync::Mutex::new(Some(sink)),
            reader: tokio::sync::Mutex::new(Some(source)),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            data,
            control,
            closed: CancellationToken::new(),
        }))
    }

    /// Session this tunnel is bound to
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Initiator side: announce the session id in clear and wait for the
    /// acceptor to echo it back sealed.
    pub async fn send_init(&self) -> NetworkResult<()> {
        self.write_frame(Bytes::from(self.session.id.clone().into_bytes()))
            .await?;

        let frame = self.read_frame("session confirmation").await?;
        let seal = MessageSeal::from_bytes(&frame)?;
        let confirmed = {
            let mut sealer = lock(&self.inbound);
            let plaintext = sealer.unseal(&seal)?;
            sealer.update()?;
            plaintext
        };

        if confirmed != self.session.id.as_bytes() {
            return Err(NetworkError::WrongSession {
                expected: self.session.id.clone(),
                actual: String::from_utf8_lossy(&confirmed).into_owned(),
            });
        }
        debug!("Session {} confirmed by {:?}", self.session.id, self.session.peer.identity);
        Ok(())
    }

    /// Acceptor side: prove possession of the session keys by sealing
    /// the session id.
    pub async fn answer_init(&self) -> NetworkResult<()> {
        let id = self.session.id.clone();
        self.seal_and_write(id.as_bytes(), SealKind::Data, Direction::Outbound)
            .await?;
        Ok(())
    }

    /// Spawn the receive and send loops
    pub fn start(self: &Arc<Self>) {
        tokio::spawn(self.clone().receive_loop());
        tokio::spawn(self.clone().send_loop());
        debug!("Tunnel started for session {}", self.session.id);
    }

    fn enqueue(&self, payload: Bytes) -> NetworkResult<()> {
        if self.closed.is_cancelled() {
            return Err(NetworkError::TransportClosed);
        }
        self.queue_tx
            .send(payload)
            .map_err(|_| NetworkError::TransportClosed)
    }

    async fn shutdown(&self) -> NetworkResult<()> {
        self.closed.cancel();

        let mut open = self.open.write().await;
        if !*open {
            return Ok(());
        }
        *open = false;

        let sink = self.writer.lock().await.take();
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        info!("Closed tunnel for session {}", self.session.id);

        match sink {
            Some(mut sink) => {
                match tokio::time::timeout(self.config.response_timeout, sink.close()).await {
                    Ok(result) => result.map_err(NetworkError::from),
                    Err(_) => {
                        debug!("Timed out flushing tunnel for session {}", self.session.id);
                        Ok(())
                    }
                }
            }
            None => Ok(()),
        }
    }

    fn sealer(&self, direction: Direction) -> &Mutex<Sealer> {
        match direction {
            Direction::Outbound => &self.outbound,
            Direction::Inbound => &self.inbound,
        }
    }

    async fn write_frame(&self, frame: Bytes) -> NetworkResult<()> {
        let open = self.open.read().await;
        if !*open {
            return Err(NetworkError::TransportClosed);
        }
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(NetworkError::TransportClosed)?;
        self.send_on(sink, frame).await
    }

    /// Seal and write under the writer lock so frames leave in sealing order
    async fn seal_and_write(
        &self,
        payload: &[u8],
        kind: SealKind,
        direction: Direction,
    ) -> NetworkResult<u64> {
        let open = self.open.read().await;
        if !*open {
            return Err(NetworkError::TransportClosed);
        }
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(NetworkError::TransportClosed)?;

        let seal = lock(self.sealer(direction)).seal(payload, kind)?;
        let frame = seal.to_bytes()?;
        self.send_on(sink, Bytes::from(frame)).await?;

        trace!(
            "Sent {:?} frame {} on session {}",
            kind, seal.sequence, self.session.id
        );
        Ok(seal.sequence)
    }

    async fn send_on(&self, sink: &mut FrameSink, frame: Bytes) -> NetworkResult<()> {
        tokio::select! {
            result = sink.send(frame) => result.map_err(NetworkError::from),
            _ = self.closed.cancelled() => Err(NetworkError::TransportClosed),
        }
    }

    async fn read_frame(&self, waiting_for: &'static str) -> NetworkResult<BytesMut> {
        let mut reader = self.reader.lock().await;
        let source = reader.as_mut().ok_or(NetworkError::TransportClosed)?;

        match tokio::time::timeout(self.config.response_timeout, source.next()).await {
            Err(_) => Err(NetworkError::Timeout(waiting_for)),
            Ok(None) => Err(NetworkError::TransportClosed),
            Ok(Some(frame)) => Ok(frame?),
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let Some(mut source) = self.reader.lock().await.take() else {
            return;
        };

        loop {
            let next = tokio::select! {
                _ = self.closed.cancelled() => break,
                next = source.next() => next,
            };

            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    warn!("Read failed on session {}: {}", self.session.id, e);
                    break;
                }
                None => {
                    debug!("Peer closed stream for session {}", self.session.id);
                    break;
                }
            };

            if let FrameOutcome::Fatal = self.handle_frame(&frame).await {
                break;
            }
        }

        drop(source);
        if let Err(e) = self.shutdown().await {
            debug!("Error closing session {}: {}", self.session.id, e);
        }
        debug!("Receive loop stopped for session {}", self.session.id);
    }

    async fn handle_frame(&self, frame: &[u8]) -> FrameOutcome {
        let seal = match MessageSeal::from_bytes(frame) {
            Ok(seal) => seal,
            Err(e) => {
                warn!("Dropping unreadable frame on session {}: {}", self.session.id, e);
                return FrameOutcome::Continue;
            }
        };

        let direction = match seal.kind {
            SealKind::Data => Direction::Inbound,
            SealKind::Control => Direction::Outbound,
        };

        match self.open_seal(&seal, direction) {
            Ok(plaintext) => {
                match seal.kind {
                    SealKind::Data => {
                        if self.data.send(Bytes::from(plaintext)).is_err() {
                            debug!(
                                "No subscriber for frame {} on session {}",
                                seal.sequence, self.session.id
                            );
                        }
                        self.reply(ControlMessage::ack(seal.sequence)).await;
                    }
                    SealKind::Control => {
                        let _ = self.control.send(Bytes::from(plaintext));
                    }
                }
                FrameOutcome::Continue
            }
            Err(NetworkError::SequenceAhead { expected, actual }) => {
                info!(
                    "Session {} jumped from sequence {} to {}, frame dropped",
                    self.session.id, expected, actual
                );
                FrameOutcome::Continue
            }
            Err(NetworkError::SequenceGapExceeded { gap, limit }) => {
                // Our ratchet stays behind the peer's for good
                warn!(
                    "Session {} skipped {} frames (limit {}), closing",
                    self.session.id, gap, limit
                );
                self.reply(ControlMessage::reject(ControlErrorKind::InternalError, seal.sequence))
                    .await;
                FrameOutcome::Fatal
            }
            Err(NetworkError::SequenceBehind { expected, actual }) => {
                warn!(
                    "Session {} received stale sequence {} (expected {}), closing",
                    self.session.id, actual, expected
                );
                self.reply(ControlMessage::reject(ControlErrorKind::WrongSequence, actual))
                    .await;
                FrameOutcome::Fatal
            }
            Err(e) => {
                warn!(
                    "Rejected {:?} frame {} on session {}: {}",
                    seal.kind, seal.sequence, self.session.id, e
                );
                if seal.kind == SealKind::Data {
                    self.reply(ControlMessage::reject(rejection_kind(&e), seal.sequence))
                        .await;
                }
                FrameOutcome::Continue
            }
        }
    }

    /// Check a frame against the sealer for its direction and decrypt it.
    ///
    /// Accepted frames and rejected data frames consume their sequence slot.
    fn open_seal(&self, seal: &MessageSeal, direction: Direction) -> NetworkResult<Vec<u8>> {
        let mut sealer = lock(self.sealer(direction));
        let expected = sealer.sequence();

        if seal.session_id != self.session.id {
            if seal.kind == SealKind::Data
                && seal.sequence >= expected
                && self.check_gap(expected, seal.sequence).is_ok()
            {
                sealer.update_to_seq(seal.sequence.saturating_add(1))?;
            }
            return Err(NetworkError::WrongSession {
                expected: self.session.id.clone(),
                actual: seal.session_id.clone(),
            });
        }

        if seal.sequence < expected {
            return Err(NetworkError::SequenceBehind {
                expected,
                actual: seal.sequence,
            });
        }

        if seal.sequence > expected {
            self.check_gap(expected, seal.sequence)?;
            sealer
                .update_to_seq(seal.sequence.saturating_add(1))
                .map_err(|e| NetworkError::InternalError(e.to_string()))?;
            return Err(NetworkError::SequenceAhead {
                expected,
                actual: seal.sequence,
            });
        }

        match sealer.unseal(seal) {
            Ok(plaintext) => {
                sealer.update()?;
                Ok(plaintext)
            }
            Err(SealError::InvalidSeal) => {
                sealer.update()?;
                Err(SealError::InvalidSeal.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn check_gap(&self, expected: u64, actual: u64) -> NetworkResult<()> {
        let gap = actual - expected;
        match self.config.max_sequence_gap {
            Some(limit) if gap > limit => Err(NetworkError::SequenceGapExceeded { gap, limit }),
            _ => Ok(()),
        }
    }

    async fn reply(&self, message: ControlMessage) {
        let result = match encoding::encode(&message) {
            Ok(payload) => self
                .seal_and_write(&payload, SealKind::Control, Direction::Inbound)
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            debug!(
                "Failed to reply to frame {} on session {}: {}",
                message.acknowledged_sequence, self.session.id, e
            );
        }
    }

    async fn send_loop(self: Arc<Self>) {
        let Some(mut queue) = lock(&self.queue_rx).take() else {
            return;
        };

        loop {
            let payload = tokio::select! {
                _ = self.closed.cancelled() => break,
                next = queue.recv() => match next {
                    Some(payload) => payload,
                    None => break,
                },
            };

            let mut acks = Subscription::new(self.control.subscribe(), self.closed.clone());
            let sequence = match self
                .seal_and_write(&payload, SealKind::Data, Direction::Outbound)
                .await
            {
                Ok(sequence) => sequence,
                Err(NetworkError::TransportClosed) => break,
                Err(e) => {
                    warn!("Send failed on session {}, retrying: {}", self.session.id, e);
                    self.requeue(payload);
                    tokio::time::sleep(self.config.poll_interval).await;
                    continue;
                }
            };

            match self.wait_for_ack(&mut acks, sequence).await {
                Ok(reply) if reply.succeeded => {
                    trace!("Frame {} acknowledged on session {}", sequence, self.session.id);
                }
                Ok(reply) => {
                    warn!(
                        "Frame {} rejected on session {} ({:?}), retrying",
                        sequence, self.session.id, reply.error
                    );
                    self.requeue(payload);
                }
                Err(NetworkError::TransportClosed) => break,
                Err(e) => {
                    warn!("{} on session {}, retrying", e, self.session.id);
                    self.requeue(payload);
                }
            }
        }
        debug!("Send loop stopped for session {}", self.session.id);
    }

    async fn wait_for_ack(
        &self,
        acks: &mut Subscription<Bytes>,
        sequence: u64,
    ) -> NetworkResult<ControlMessage> {
        let wait = async {
            while let Some(bytes) = acks.recv().await {
                match encoding::decode::<ControlMessage>(&bytes) {
                    Ok(reply) if reply.acknowledged_sequence == sequence => return Ok(reply),
                    Ok(reply) => trace!(
                        "Ignoring reply for frame {} while waiting on {}",
                        reply.acknowledged_sequence, sequence
                    ),
                    Err(e) => debug!("Unreadable control message: {}", e),
                }
            }
            Err(NetworkError::TransportClosed)
        };

        tokio::time::timeout(self.config.response_timeout, wait)
            .await
            .map_err(|_| NetworkError::AckTimeout(sequence))?
    }

    fn requeue(&self, payload: Bytes) {
        if self.queue_tx.send(payload).is_err() {
            debug!("Dropping payload, queue closed for session {}", self.session.id);
        }
    }
}

#[async_trait]
impl DuplexTunnel for Tunnel {
    fn send(&self, payload: Bytes) -> NetworkResult<()> {
        self.enqueue(payload)
    }

    fn subscribe(&self) -> Subscription<Bytes> {
        Subscription::new(self.data.subscribe(), self.closed.clone())
    }

    async fn wait_close(&self) {
        self.closed.cancelled().await;
    }

    async fn close(&self) -> NetworkResult<()> {
        self.shutdown().await
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("session", &self.session.id)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

fn rejection_kind(error: &NetworkError) -> ControlErrorKind {
    match error {
        NetworkError::WrongSession { .. } => ControlErrorKind::WrongSession,
        NetworkError::Seal(SealError::InvalidSeal) => ControlErrorKind::InvalidSeal,
        NetworkError::Seal(SealError::WrongSession { .. }) => ControlErrorKind::WrongSession,
        NetworkError::Seal(SealError::WrongSequence { .. }) => ControlErrorKind::WrongSequence,
        NetworkError::Encoding(_) => ControlErrorKind::UnreadableSeal,
        _ => ControlErrorKind::InternalError,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use drmchain_crypto::{KeySeed, NodeIdentity};
    use tokio::io::DuplexStream;

    use crate::encoding::frame_codec;
    use crate::session::Peer;

    const WAIT: Duration = Duration::from_secs(2);

    fn test_config() -> NetworkConfig {
        NetworkConfig {
            response_timeout: Duration::from_millis(200),
            ..NetworkConfig::local()
        }
    }

    fn peer_of(identity: &NodeIdentity) -> Peer {
        Peer::new(identity.public_identity().clone(), "127.0.0.1:2504".parse().unwrap())
    }

    fn framed(stream: DuplexStream) -> Framed<DuplexStream, LengthDelimitedCodec> {
        Framed::new(stream, frame_codec(NetworkConfig::local().max_frame_len))
    }

    fn tunnel_pair(config: &NetworkConfig) -> (Arc<Tunnel>, Arc<Tunnel>) {
        let a = NodeIdentity::generate();
        let b = NodeIdentity::generate();
        let seed = KeySeed::generate();
        let (stream_a, stream_b) = tokio::io::duplex(64 * 1024);

        let session_a = Arc::new(Session::new("s1", seed.clone(), peer_of(&b)));
        let session_b = Arc::new(Session::new("s1", seed, peer_of(&a)));

        let tunnel_a = Tunnel::new(framed(stream_a), session_a, a.public_identity(), config).unwrap();
        let tunnel_b = Tunnel::new(framed(stream_b), session_b, b.public_identity(), config).unwrap();
        (tunnel_a, tunnel_b)
    }

    /// The far end of a tunnel driven by hand
    struct RawPeer {
        framed: Framed<DuplexStream, LengthDelimitedCodec>,
        /// Keyed by the raw side's tag: its data and the tunnel's replies
        own: Sealer,
    }

    impl RawPeer {
        async fn send(&mut self, seal: &MessageSeal) {
            self.framed
                .send(Bytes::from(seal.to_bytes().unwrap()))
                .await
                .unwrap();
        }

        async fn next_seal(&mut self) -> MessageSeal {
            let frame = tokio::time::timeout(WAIT, self.framed.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .unwrap();
            MessageSeal::from_bytes(&frame).unwrap()
        }

        async fn next_reply(&mut self) -> ControlMessage {
            let seal = self.next_seal().await;
            assert_eq!(seal.kind, SealKind::Control);
            self.own.update_to_seq(seal.sequence).unwrap();
            let plaintext = self.own.unseal(&seal).unwrap();
            self.own.update().unwrap();
            encoding::decode(&plaintext).unwrap()
        }
    }

    /// A started tunnel plus a raw peer and a sealer for reading the
    /// tunnel's own data frames
    fn raw_pair(config: &NetworkConfig) -> (Arc<Tunnel>, RawPeer, Sealer) {
        let local = NodeIdentity::generate();
        let remote = NodeIdentity::generate();
        let seed = KeySeed::generate();
        let (stream_a, stream_b) = tokio::io::duplex(64 * 1024);

        let session = Arc::new(Session::new("s1", seed.clone(), peer_of(&remote)));
        let tunnel = Tunnel::new(framed(stream_a), session, local.public_identity(), config).unwrap();
        tunnel.start();

        let raw = RawPeer {
            framed: framed(stream_b),
            own: Sealer::new("s1", &seed, &remote.tag()).unwrap(),
        };
        let tunnel_data = Sealer::new("s1", &seed, &local.tag()).unwrap();
        (tunnel, raw, tunnel_data)
    }

    #[tokio::test]
    async fn test_init_and_ordered_delivery() {
        let config = test_config();
        let (initiator, acceptor) = tunnel_pair(&config);

        let (init, answer) = tokio::join!(initiator.send_init(), acceptor.answer_init());
        init.unwrap();
        answer.unwrap();
        initiator.start();
        acceptor.start();

        let mut inbox = acceptor.subscribe();
        for i in 0..5 {
            initiator.send(Bytes::from(format!("message {}", i))).unwrap();
        }
        for i in 0..5 {
            let received = inbox.recv_timeout(WAIT).await.expect("message not delivered");
            assert_eq!(received, Bytes::from(format!("message {}", i)));
        }

        let mut reply_inbox = initiator.subscribe();
        acceptor.send(Bytes::from_static(b"reply")).unwrap();
        assert_eq!(
            reply_inbox.recv_timeout(WAIT).await,
            Some(Bytes::from_static(b"reply"))
        );

        initiator.close().await.unwrap();
        tokio::time::timeout(WAIT, acceptor.wait_close())
            .await
            .expect("peer close should close the acceptor");
        assert!(acceptor.send(Bytes::from_static(b"late")).is_err());
    }

    #[tokio::test]
    async fn test_send_init_rejects_wrong_confirmation() {
        let config = test_config();
        let local = NodeIdentity::generate();
        let remote = NodeIdentity::generate();
        let seed = KeySeed::generate();
        let (stream_a, stream_b) = tokio::io::duplex(64 * 1024);

        let session = Arc::new(Session::new("s1", seed.clone(), peer_of(&remote)));
        let tunnel = Tunnel::new(framed(stream_a), session, local.public_identity(), &config).unwrap();

        let mut raw = framed(stream_b);
        let answer = async {
            let announced = raw.next().await.unwrap().unwrap();
            assert_eq!(&announced[..], b"s1");
            let mut sealer = Sealer::new("s1", &seed, &remote.tag()).unwrap();
            let seal = sealer.seal(b"not-the-session", SealKind::Data).unwrap();
            raw.send(Bytes::from(seal.to_bytes().unwrap())).await.unwrap();
        };

        let (result, _) = tokio::join!(tunnel.send_init(), answer);
        assert!(matches!(result, Err(NetworkError::WrongSession { .. })));
    }

    #[tokio::test]
    async fn test_stale_sequence_closes_tunnel() {
        let (tunnel, mut raw, _) = raw_pair(&test_config());
        let mut inbox = tunnel.subscribe();

        let seal = raw.own.seal(b"first", SealKind::Data).unwrap();
        raw.send(&seal).await;
        assert_eq!(inbox.recv_timeout(WAIT).await, Some(Bytes::from_static(b"first")));
        assert!(raw.next_reply().await.succeeded);

        raw.send(&seal).await;
        tokio::time::timeout(WAIT, tunnel.wait_close())
            .await
            .expect("replayed frame should close the tunnel");
        assert!(tunnel.is_closed());
    }

    #[tokio::test]
    async fn test_unacknowledged_frame_is_resealed() {
        let (tunnel, mut raw, mut tunnel_data) = raw_pair(&test_config());

        tunnel.send(Bytes::from_static(b"ping")).unwrap();

        let first = raw.next_seal().await;
        let second = raw.next_seal().await;
        assert_eq!(first.kind, SealKind::Data);
        assert!(second.sequence > first.sequence);

        assert_eq!(tunnel_data.unseal(&first).unwrap(), b"ping");
        tunnel_data.update_to_seq(second.sequence).unwrap();
        assert_eq!(tunnel_data.unseal(&second).unwrap(), b"ping");

        tunnel.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_negative_ack_on_tampered_frame() {
        let (tunnel, mut raw, _) = raw_pair(&test_config());
        let mut inbox = tunnel.subscribe();

        let mut tampered = raw.own.seal(b"evil", SealKind::Data).unwrap();
        tampered.mac[0] ^= 0xff;
        raw.send(&tampered).await;

        let reply = raw.next_reply().await;
        assert!(!reply.succeeded);
        assert_eq!(reply.error, Some(ControlErrorKind::InvalidSeal));
        assert_eq!(reply.acknowledged_sequence, tampered.sequence);

        let seal = raw.own.seal(b"honest", SealKind::Data).unwrap();
        raw.send(&seal).await;
        assert_eq!(inbox.recv_timeout(WAIT).await, Some(Bytes::from_static(b"honest")));
        assert!(raw.next_reply().await.succeeded);
        assert!(!tunnel.is_closed());
    }

    #[tokio::test]
    async fn test_gap_fast_forwards_past_dropped_frame() {
        let (tunnel, mut raw, _) = raw_pair(&test_config());
        let mut inbox = tunnel.subscribe();

        raw.own.update_to_seq(3).unwrap();
        let skipped = raw.own.seal(b"skipped", SealKind::Data).unwrap();
        raw.send(&skipped).await;

        let seal = raw.own.seal(b"after gap", SealKind::Data).unwrap();
        assert_eq!(seal.sequence, 4);
        raw.send(&seal).await;

        assert_eq!(inbox.recv_timeout(WAIT).await, Some(Bytes::from_static(b"after gap")));
        assert!(!tunnel.is_closed());
    }

    #[tokio::test]
    async fn test_gap_over_limit_is_rejected() {
        let config = NetworkConfig {
            max_sequence_gap: Some(2),
            ..test_config()
        };
        let (tunnel, mut raw, _) = raw_pair(&config);
        let mut inbox = tunnel.subscribe();

        raw.own.update_to_seq(10).unwrap();
        let seal = raw.own.seal(b"too far", SealKind::Data).unwrap();
        raw.send(&seal).await;

        let frame = raw.next_seal().await;
        assert_eq!(frame.kind, SealKind::Control);
        assert_eq!(inbox.recv_timeout(Duration::from_millis(100)).await, None);
        tokio::time::timeout(WAIT, tunnel.wait_close())
            .await
            .expect("a gap over the limit should close the tunnel");
    }

    #[tokio::test]
    async fn test_wrong_session_frame_not_delivered() {
        let (tunnel, mut raw, _) = raw_pair(&test_config());
        let mut inbox = tunnel.subscribe();

        let mut seal = raw.own.seal(b"lost", SealKind::Data).unwrap();
        seal.session_id = "other".into();
        raw.send(&seal).await;

        // The rejection is sealed at the slot after the rejected frame
        let reply = raw.next_reply().await;
        assert!(!reply.succeeded);
        assert_eq!(reply.error, Some(ControlErrorKind::WrongSession));
        assert_eq!(reply.acknowledged_sequence, seal.sequence);
        assert_eq!(inbox.recv_timeout(Duration::from_millis(100)).await, None);

        let honest = raw.own.seal(b"found", SealKind::Data).unwrap();
        raw.send(&honest).await;
        assert_eq!(inbox.recv_timeout(WAIT).await, Some(Bytes::from_static(b"found")));
        assert!(raw.next_reply().await.succeeded);
        assert!(!tunnel.is_closed());
    }

    #[tokio::test]
    async fn test_wrong_session_reply_keeps_peer_tunnel_open() {
        let config = test_config();
        let (initiator, acceptor) = tunnel_pair(&config);
        let (init, answer) = tokio::join!(initiator.send_init(), acceptor.answer_init());
        init.unwrap();
        answer.unwrap();

        // Inject a foreign-session data frame from the initiator's sealer
        let mut foreign = lock(&initiator.outbound).seal(b"stray", SealKind::Data).unwrap();
        foreign.session_id = "other".into();
        initiator
            .write_frame(Bytes::from(foreign.to_bytes().unwrap()))
            .await
            .unwrap();

        let mut replies = Subscription::new(initiator.control.subscribe(), initiator.closed.clone());
        initiator.start();
        acceptor.start();

        let reply = replies.recv_timeout(WAIT).await.expect("rejection not verified");
        let reply: ControlMessage = encoding::decode(&reply).unwrap();
        assert_eq!(reply.error, Some(ControlErrorKind::WrongSession));

        let mut inbox = acceptor.subscribe();
        initiator.send(Bytes::from_static(b"after stray")).unwrap();
        assert_eq!(
            inbox.recv_timeout(WAIT).await,
            Some(Bytes::from_static(b"after stray"))
        );
        assert!(!initiator.is_closed());
        assert!(!acceptor.is_closed());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (a, _b) = tunnel_pair(&test_config());
        a.start();

        let mut inbox = a.subscribe();
        a.close().await.unwrap();
        a.close().await.unwrap();

        assert!(a.is_closed());
        assert_eq!(inbox.recv().await, None);
        assert!(matches!(a.send(Bytes::new()), Err(NetworkError::TransportClosed)));
    }
}
