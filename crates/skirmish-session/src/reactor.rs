//! TCP network reactor.
//!
//! A [`NetworkReactor`] serves a single protocol family (IPv4 or IPv6) and
//! runs its sockets on a private tokio runtime. The game thread talks to it
//! without blocking: commands go out through per-peer [`PeerLink`]s and
//! connection events come back through a channel drained by
//! [`NetworkReactor::poll_event`].
//!
//! Every peer starts with a handshake: the connecting side sends
//! [`Frame::Connect`] with its application data, and the accepting side echoes
//! it back once the transport version has been checked. Both ends then
//! exchange [`Frame::Ping`]/[`Frame::Pong`] heartbeats and drop the peer when
//! nothing has been heard for [`ReactorConfig::peer_timeout`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::framing::{
    Frame, FrameConfig, FrameError, TRANSPORT_VERSION, read_message, write_message,
};
use crate::socket::SocketConfig;

/// Identifier of a peer within one reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

/// Address family served by a reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolFamily {
    /// IPv4.
    V4,
    /// IPv6.
    V6,
}

impl ProtocolFamily {
    /// Family of `addr`.
    pub fn of(addr: &SocketAddr) -> Self {
        if addr.is_ipv6() { Self::V6 } else { Self::V4 }
    }

    /// Slot index used by per-family tables.
    pub fn index(self) -> usize {
        match self {
            Self::V4 => 0,
            Self::V6 => 1,
        }
    }
}

/// Reactor tuning.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Maximum number of simultaneous peers. Default: 64.
    pub max_peers: usize,
    /// Framing limits.
    pub frame: FrameConfig,
    /// Delay between two pings. Default: 1s.
    pub heartbeat_interval: Duration,
    /// Silence after which a peer is dropped. Default: 10s.
    pub peer_timeout: Duration,
    /// Time allowed to connect and complete the handshake. Default: 5s.
    pub handshake_timeout: Duration,
    /// Socket options.
    pub socket: SocketConfig,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            max_peers: 64,
            frame: FrameConfig::default(),
            heartbeat_interval: Duration::from_secs(1),
            peer_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            socket: SocketConfig::default(),
        }
    }
}

/// Errors raised by reactor operations.
#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    /// Runtime or socket setup failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The address does not belong to the reactor's family.
    #[error("{addr} is not reachable from a {family:?} reactor")]
    FamilyMismatch {
        /// Reactor family.
        family: ProtocolFamily,
        /// Rejected address.
        addr: SocketAddr,
    },

    /// The reactor already has `max_peers` peers.
    #[error("peer limit of {0} reached")]
    PeerLimit(usize),

    /// The peer is unknown or already gone.
    #[error("unknown peer {0:?}")]
    UnknownPeer(PeerId),
}

/// Event drained from a reactor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactorEvent {
    /// Handshake completed.
    Connected {
        /// Peer.
        peer: PeerId,
        /// Application data sent by the connecting side.
        data: u32,
    },
    /// The peer is gone.
    Disconnected {
        /// Peer.
        peer: PeerId,
        /// Application data of the disconnection, 0 on timeout or error.
        data: u32,
    },
    /// A packet arrived.
    Packet {
        /// Peer.
        peer: PeerId,
        /// Channel the packet was sent on.
        channel: u8,
        /// Packet bytes.
        payload: Bytes,
    },
}

enum PeerCommand {
    Send { channel: u8, flags: u8, payload: Bytes },
    Disconnect(u32),
}

/// Game-thread handle to a peer task.
#[derive(Debug, Clone)]
pub struct PeerLink {
    commands: mpsc::UnboundedSender<PeerCommand>,
    rtt_ms: Arc<AtomicU32>,
}

impl PeerLink {
    fn new() -> (Self, mpsc::UnboundedReceiver<PeerCommand>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let link = Self {
            commands,
            rtt_ms: Arc::new(AtomicU32::new(0)),
        };
        (link, rx)
    }

    /// Queue a packet. Returns `false` once the peer task has ended.
    pub fn send(&self, channel: u8, flags: u8, payload: Bytes) -> bool {
        self.commands
            .send(PeerCommand::Send {
                channel,
                flags,
                payload,
            })
            .is_ok()
    }

    /// Ask the peer task to say goodbye and close the connection.
    pub fn disconnect(&self, data: u32) {
        let _ = self.commands.send(PeerCommand::Disconnect(data));
    }

    /// Last measured round-trip time in milliseconds.
    pub fn ping(&self) -> u32 {
        self.rtt_ms.load(Ordering::Relaxed)
    }

    /// Returns `true` while the peer task is alive.
    pub fn is_alive(&self) -> bool {
        !self.commands.is_closed()
    }
}

/// Event sent by peer tasks to the game thread.
enum PeerEvent {
    Connected { peer: PeerId, data: u32, link: PeerLink },
    Disconnected { peer: PeerId, data: u32 },
    Packet { peer: PeerId, channel: u8, payload: Bytes },
}

/// State shared by the accept loop and every peer task.
struct Shared {
    config: ReactorConfig,
    events: crossbeam_channel::Sender<PeerEvent>,
    next_peer: AtomicU64,
    active: AtomicUsize,
}

impl Shared {
    /// Peer ids start at 1 and are never reused by a reactor.
    fn allocate_peer(&self) -> PeerId {
        PeerId(self.next_peer.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn try_reserve(&self) -> bool {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.config.max_peers).then_some(n + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// TCP reactor for one protocol family.
pub struct NetworkReactor {
    family: ProtocolFamily,
    runtime: Option<tokio::runtime::Runtime>,
    shared: Arc<Shared>,
    events: crossbeam_channel::Receiver<PeerEvent>,
    peers: FxHashMap<PeerId, PeerLink>,
    shutdown_tx: watch::Sender<bool>,
    local_addr: Option<SocketAddr>,
}

impl NetworkReactor {
    /// Create a client reactor for `family`.
    pub fn new(family: ProtocolFamily, config: ReactorConfig) -> Result<Self, ReactorError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("skirmish-reactor")
            .enable_all()
            .build()?;
        let (events_tx, events) = crossbeam_channel::unbounded();
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            family,
            runtime: Some(runtime),
            shared: Arc::new(Shared {
                config,
                events: events_tx,
                next_peer: AtomicU64::new(0),
                active: AtomicUsize::new(0),
            }),
            events,
            peers: FxHashMap::default(),
            shutdown_tx,
            local_addr: None,
        })
    }

    /// Create a server reactor accepting peers on `addr`.
    pub fn listen(addr: SocketAddr, config: ReactorConfig) -> Result<Self, ReactorError> {
        let mut reactor = Self::new(ProtocolFamily::of(&addr), config)?;
        let runtime = reactor.runtime()?;

        let listener = {
            let _guard = runtime.enter();
            reactor.shared.config.socket.bind(addr)?
        };
        let local_addr = listener.local_addr()?;

        let shared = Arc::clone(&reactor.shared);
        let shutdown_rx = reactor.shutdown_tx.subscribe();
        runtime.spawn(accept_loop(listener, shared, shutdown_rx));

        tracing::info!(%local_addr, "reactor listening");
        reactor.local_addr = Some(local_addr);
        Ok(reactor)
    }

    fn runtime(&self) -> Result<&tokio::runtime::Runtime, ReactorError> {
        self.runtime.as_ref().ok_or_else(|| {
            ReactorError::Io(std::io::Error::other("reactor runtime is shut down"))
        })
    }

    /// Family served by this reactor.
    pub fn family(&self) -> ProtocolFamily {
        self.family
    }

    /// Bound address of a listening reactor.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of peers currently connecting or connected.
    pub fn peer_count(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Start connecting to `addr`. The outcome is reported later as a
    /// [`ReactorEvent::Connected`] or [`ReactorEvent::Disconnected`] event.
    pub fn connect(&mut self, addr: SocketAddr, data: u32) -> Result<PeerId, ReactorError> {
        if ProtocolFamily::of(&addr) != self.family {
            return Err(ReactorError::FamilyMismatch {
                family: self.family,
                addr,
            });
        }
        if !self.shared.try_reserve() {
            return Err(ReactorError::PeerLimit(self.shared.config.max_peers));
        }

        let peer = self.shared.allocate_peer();
        let (link, commands) = PeerLink::new();
        self.peers.insert(peer, link.clone());

        let shared = Arc::clone(&self.shared);
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.runtime()?
            .spawn(connect_peer(peer, addr, data, link, commands, shared, shutdown_rx));

        tracing::debug!(?peer, %addr, "connecting");
        Ok(peer)
    }

    /// Link of a known peer.
    pub fn link(&self, peer: PeerId) -> Option<PeerLink> {
        self.peers.get(&peer).cloned()
    }

    /// Queue a packet for `peer`.
    pub fn send(&self, peer: PeerId, channel: u8, flags: u8, payload: Bytes) -> Result<(), ReactorError> {
        let link = self.peers.get(&peer).ok_or(ReactorError::UnknownPeer(peer))?;
        if link.send(channel, flags, payload) {
            Ok(())
        } else {
            Err(ReactorError::UnknownPeer(peer))
        }
    }

    /// Ask `peer` to disconnect. Its [`ReactorEvent::Disconnected`] event
    /// follows.
    pub fn disconnect(&self, peer: PeerId, data: u32) {
        if let Some(link) = self.peers.get(&peer) {
            link.disconnect(data);
        }
    }

    /// Next pending event.
    pub fn poll_event(&mut self) -> Option<ReactorEvent> {
        let event = self.events.try_recv().ok()?;
        Some(match event {
            PeerEvent::Connected { peer, data, link } => {
                self.peers.insert(peer, link);
                ReactorEvent::Connected { peer, data }
            }
            PeerEvent::Disconnected { peer, data } => {
                self.peers.remove(&peer);
                ReactorEvent::Disconnected { peer, data }
            }
            PeerEvent::Packet {
                peer,
                channel,
                payload,
            } => ReactorEvent::Packet {
                peer,
                channel,
                payload,
            },
        })
    }
}

impl Drop for NetworkReactor {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(runtime) = self.runtime.take() {
            // Remote peers observe the closed sockets as a disconnect.
            runtime.shutdown_timeout(Duration::from_millis(200));
        }
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!(%err, "accept failed");
                        continue;
                    }
                };
                if !shared.try_reserve() {
                    tracing::warn!(%peer_addr, "peer limit reached, rejecting");
                    continue;
                }
                if let Err(err) = shared.config.socket.apply(&stream) {
                    tracing::warn!(%peer_addr, %err, "failed to configure socket");
                }
                let peer = shared.allocate_peer();
                tracing::info!(?peer, %peer_addr, "accepted connection");
                tokio::spawn(accept_peer(peer, stream, Arc::clone(&shared), shutdown_rx.clone()));
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("reactor shutting down");
                    break;
                }
            }
        }
    }
}

async fn accept_peer(
    peer: PeerId,
    mut stream: TcpStream,
    shared: Arc<Shared>,
    shutdown_rx: watch::Receiver<bool>,
) {
    let config = &shared.config;
    let handshake = tokio::time::timeout(config.handshake_timeout, read_message(&mut stream, &config.frame)).await;

    let data = match handshake {
        Ok(Ok(Frame::Connect { version, data })) if version == TRANSPORT_VERSION => data,
        Ok(Ok(Frame::Connect { version, .. })) => {
            tracing::warn!(?peer, version, "transport version mismatch");
            let _ = write_message(&mut stream, &Frame::Disconnect(0), &config.frame).await;
            shared.release();
            return;
        }
        other => {
            tracing::warn!(?peer, ?other, "handshake failed");
            shared.release();
            return;
        }
    };

    let ack = Frame::Connect {
        version: TRANSPORT_VERSION,
        data,
    };
    if let Err(err) = write_message(&mut stream, &ack, &config.frame).await {
        tracing::warn!(?peer, %err, "handshake reply failed");
        shared.release();
        return;
    }

    let (link, commands) = PeerLink::new();
    let rtt = Arc::clone(&link.rtt_ms);
    let _ = shared.events.send(PeerEvent::Connected { peer, data, link });
    run_peer(peer, stream, commands, rtt, &shared, shutdown_rx).await;
}

async fn connect_peer(
    peer: PeerId,
    addr: SocketAddr,
    data: u32,
    link: PeerLink,
    commands: mpsc::UnboundedReceiver<PeerCommand>,
    shared: Arc<Shared>,
    shutdown_rx: watch::Receiver<bool>,
) {
    let config = &shared.config;
    let handshake = tokio::time::timeout(config.handshake_timeout, async {
        let mut stream = TcpStream::connect(addr).await?;
        config.socket.apply(&stream)?;
        let hello = Frame::Connect {
            version: TRANSPORT_VERSION,
            data,
        };
        write_message(&mut stream, &hello, &config.frame).await?;
        let reply = read_message(&mut stream, &config.frame).await?;
        Ok::<_, FrameError>((stream, reply))
    })
    .await;

    let stream = match handshake {
        Ok(Ok((stream, Frame::Connect { .. }))) => stream,
        Ok(Ok((_, reply))) => {
            tracing::warn!(?peer, %addr, ?reply, "connection refused");
            disconnected(peer, 0, &shared);
            return;
        }
        Ok(Err(err)) => {
            tracing::warn!(?peer, %addr, %err, "connection failed");
            disconnected(peer, 0, &shared);
            return;
        }
        Err(_) => {
            tracing::warn!(?peer, %addr, "connection timed out");
            disconnected(peer, 0, &shared);
            return;
        }
    };

    tracing::info!(?peer, %addr, "connected");
    let rtt = Arc::clone(&link.rtt_ms);
    let _ = shared.events.send(PeerEvent::Connected { peer, data, link });
    run_peer(peer, stream, commands, rtt, &shared, shutdown_rx).await;
}

fn disconnected(peer: PeerId, data: u32, shared: &Shared) {
    shared.release();
    let _ = shared.events.send(PeerEvent::Disconnected { peer, data });
}

async fn send_frame(writer: &mut OwnedWriteHalf, frame: &Frame, config: &FrameConfig) -> bool {
    match write_message(writer, frame, config).await {
        Ok(()) => true,
        Err(err) => {
            tracing::debug!(%err, "write failed");
            false
        }
    }
}

/// Pump a connected peer until either side ends the connection.
async fn run_peer(
    peer: PeerId,
    stream: TcpStream,
    mut commands: mpsc::UnboundedReceiver<PeerCommand>,
    rtt: Arc<AtomicU32>,
    shared: &Shared,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let config = &shared.config;
    let (mut reader, mut writer) = stream.into_split();

    // Frame reads are not cancel-safe, so they run on their own task.
    let (frames_tx, mut frames) = mpsc::unbounded_channel();
    let frame_config = config.frame.clone();
    let reader_task = tokio::spawn(async move {
        loop {
            match read_message(&mut reader, &frame_config).await {
                Ok(frame) => {
                    if frames_tx.send(frame).is_err() {
                        break;
                    }
                }
                Err(FrameError::ConnectionClosed) => break,
                Err(err) => {
                    tracing::debug!(%err, "read failed");
                    break;
                }
            }
        }
    });

    let epoch = Instant::now();
    let mut last_heard = Instant::now();
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let data = loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else { break 0 };
                last_heard = Instant::now();
                match frame {
                    Frame::Data { channel, payload, .. } => {
                        let _ = shared.events.send(PeerEvent::Packet { peer, channel, payload });
                    }
                    Frame::Ping(stamp) => {
                        if !send_frame(&mut writer, &Frame::Pong(stamp), &config.frame).await {
                            break 0;
                        }
                    }
                    Frame::Pong(stamp) => {
                        let now = epoch.elapsed().as_millis() as u64;
                        rtt.store(now.saturating_sub(stamp) as u32, Ordering::Relaxed);
                    }
                    Frame::Disconnect(data) => break data,
                    Frame::Connect { .. } => {
                        tracing::warn!(?peer, "unexpected handshake frame");
                    }
                }
            }
            command = commands.recv() => {
                match command {
                    Some(PeerCommand::Send { channel, flags, payload }) => {
                        let frame = Frame::Data { channel, flags, payload };
                        if !send_frame(&mut writer, &frame, &config.frame).await {
                            break 0;
                        }
                    }
                    Some(PeerCommand::Disconnect(data)) => {
                        send_frame(&mut writer, &Frame::Disconnect(data), &config.frame).await;
                        break data;
                    }
                    None => {
                        // Every link is gone; nobody can talk to this peer anymore.
                        send_frame(&mut writer, &Frame::Disconnect(0), &config.frame).await;
                        break 0;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if last_heard.elapsed() > config.peer_timeout {
                    tracing::warn!(?peer, timeout = ?config.peer_timeout, "peer timed out");
                    break 0;
                }
                let stamp = epoch.elapsed().as_millis() as u64;
                if !send_frame(&mut writer, &Frame::Ping(stamp), &config.frame).await {
                    break 0;
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    send_frame(&mut writer, &Frame::Disconnect(0), &config.frame).await;
                    break 0;
                }
            }
        }
    };

    reader_task.abort();
    tracing::info!(?peer, data, "peer disconnected");
    disconnected(peer, data, shared);
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::time::Instant as StdInstant;

    use super::*;

    fn test_config() -> ReactorConfig {
        ReactorConfig {
            heartbeat_interval: Duration::from_millis(20),
            handshake_timeout: Duration::from_secs(2),
            ..ReactorConfig::default()
        }
    }

    fn next_event(reactor: &mut NetworkReactor) -> ReactorEvent {
        let deadline = StdInstant::now() + Duration::from_secs(5);
        loop {
            if let Some(event) = reactor.poll_event() {
                return event;
            }
            assert!(StdInstant::now() < deadline, "timed out waiting for reactor event");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn pair() -> (NetworkReactor, NetworkReactor, PeerId, PeerId) {
        let mut server =
            NetworkReactor::listen("127.0.0.1:0".parse().unwrap(), test_config()).unwrap();
        let addr = server.local_addr().unwrap();
        let mut client = NetworkReactor::new(ProtocolFamily::V4, test_config()).unwrap();

        let client_peer = client.connect(addr, 42).unwrap();
        let ReactorEvent::Connected { peer, data } = next_event(&mut client) else {
            panic!("client did not connect");
        };
        assert_eq!((peer, data), (client_peer, 42));
        let ReactorEvent::Connected { peer: server_peer, data } = next_event(&mut server) else {
            panic!("server did not accept");
        };
        assert_eq!(data, 42);
        (server, client, server_peer, client_peer)
    }

    #[test]
    fn test_handshake_carries_connect_data() {
        let (server, client, _, _) = pair();
        assert_eq!(server.peer_count(), 1);
        assert_eq!(client.peer_count(), 1);
    }

    #[test]
    fn test_packets_arrive_in_order() {
        let (mut server, client, server_peer, client_peer) = pair();
        for i in 0u8..5 {
            client
                .send(client_peer, 1, 1, Bytes::from(vec![i; 3]))
                .unwrap();
        }

        for i in 0u8..5 {
            assert_eq!(
                next_event(&mut server),
                ReactorEvent::Packet {
                    peer: server_peer,
                    channel: 1,
                    payload: Bytes::from(vec![i; 3]),
                }
            );
        }
    }

    #[test]
    fn test_disconnect_data_reaches_remote() {
        let (mut server, mut client, server_peer, client_peer) = pair();
        client.disconnect(client_peer, 9);

        assert_eq!(
            next_event(&mut server),
            ReactorEvent::Disconnected {
                peer: server_peer,
                data: 9
            }
        );
        assert_eq!(
            next_event(&mut client),
            ReactorEvent::Disconnected {
                peer: client_peer,
                data: 9
            }
        );
        assert!(client.link(client_peer).is_none());
    }

    #[test]
    fn test_peer_ids_are_not_reused() {
        let mut client = NetworkReactor::new(ProtocolFamily::V4, test_config()).unwrap();
        let unreachable: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let first = client.connect(unreachable, 0).unwrap();
        next_event(&mut client);
        let second = client.connect(unreachable, 0).unwrap();

        assert_eq!(first, PeerId(1));
        assert!(second > first);
    }

    #[test]
    fn test_family_mismatch_is_rejected() {
        let mut client = NetworkReactor::new(ProtocolFamily::V4, test_config()).unwrap();
        let result = client.connect("[::1]:7777".parse().unwrap(), 0);
        assert!(matches!(result, Err(ReactorError::FamilyMismatch { .. })));
    }

    #[test]
    fn test_peer_limit_is_enforced() {
        let config = ReactorConfig {
            max_peers: 1,
            ..test_config()
        };
        // Accepts at the TCP level but never answers the handshake.
        let silent = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = silent.local_addr().unwrap();
        let mut client = NetworkReactor::new(ProtocolFamily::V4, config).unwrap();
        client.connect(addr, 0).unwrap();
        assert!(matches!(
            client.connect(addr, 0),
            Err(ReactorError::PeerLimit(1))
        ));
    }

    #[test]
    fn test_refused_connection_reports_disconnect() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut client = NetworkReactor::new(ProtocolFamily::V4, test_config()).unwrap();
        let peer = client
            .connect(format!("127.0.0.1:{port}").parse().unwrap(), 0)
            .unwrap();

        assert_eq!(
            next_event(&mut client),
            ReactorEvent::Disconnected { peer, data: 0 }
        );
        assert_eq!(client.peer_count(), 0);
    }

    #[test]
    fn test_wrong_transport_version_is_refused() {
        let mut server =
            NetworkReactor::listen("127.0.0.1:0".parse().unwrap(), test_config()).unwrap();
        let mut stream = std::net::TcpStream::connect(server.local_addr().unwrap()).unwrap();

        let body = Frame::Connect {
            version: TRANSPORT_VERSION + 1,
            data: 0,
        }
        .encode()
        .unwrap();
        stream.write_all(&(body.len() as u32).to_le_bytes()).unwrap();
        stream.write_all(&body).unwrap();

        let mut len = [0u8; 4];
        stream.read_exact(&mut len).unwrap();
        let mut reply = vec![0u8; u32::from_le_bytes(len) as usize];
        stream.read_exact(&mut reply).unwrap();
        assert_eq!(Frame::decode(&reply).unwrap(), Frame::Disconnect(0));
        assert!(server.poll_event().is_none());
    }
}
