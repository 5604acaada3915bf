//! Network sessions backed by [`NetworkReactor`]s.
//!
//! The server side ([`NetworkSessionManager`]) turns accepted reactor peers
//! into pooled sessions. The client side ([`NetworkReactorManager`]) lazily
//! creates one reactor per protocol family and hands out bridges for outgoing
//! connections.

use std::net::SocketAddr;

use rustc_hash::FxHashMap;
use skirmish_protocol::OutgoingPacket;

use crate::bridge::{
    BridgeError, BridgeEvent, BridgeFeed, BridgeInbox, BridgeKind, BridgeState, SessionBridge,
    bridge_channel,
};
use crate::reactor::{
    NetworkReactor, PeerId, PeerLink, ProtocolFamily, ReactorConfig, ReactorError, ReactorEvent,
};
use crate::sessions::{SessionManager, SessionRegistry};

/// Bridge to one reactor peer.
pub struct NetworkSessionBridge {
    peer: PeerId,
    link: PeerLink,
    inbox: BridgeInbox,
}

impl NetworkSessionBridge {
    fn new(peer: PeerId, link: PeerLink) -> (Self, BridgeFeed) {
        let (feed, inbox) = bridge_channel();
        (Self { peer, link, inbox }, feed)
    }

    /// Reactor peer behind this bridge.
    pub fn peer(&self) -> PeerId {
        self.peer
    }
}

impl SessionBridge for NetworkSessionBridge {
    fn kind(&self) -> BridgeKind {
        BridgeKind::Network
    }

    fn state(&self) -> BridgeState {
        self.inbox.state()
    }

    fn send(&mut self, packet: OutgoingPacket) -> Result<(), BridgeError> {
        if self.inbox.state() == BridgeState::Disconnected {
            return Err(BridgeError::Disconnected);
        }
        if self
            .link
            .send(packet.channel, packet.flags.bits(), packet.payload)
        {
            Ok(())
        } else {
            Err(BridgeError::Disconnected)
        }
    }

    fn disconnect(&mut self, data: u32) {
        if self.inbox.state() == BridgeState::Disconnected {
            return;
        }
        self.link.disconnect(data);
        self.inbox.set_state(BridgeState::Disconnected);
    }

    fn poll_event(&mut self) -> Option<BridgeEvent> {
        self.inbox.poll_event()
    }

    fn ping(&self) -> u32 {
        self.link.ping()
    }
}

impl Drop for NetworkSessionBridge {
    fn drop(&mut self) {
        self.disconnect(0);
    }
}

fn peer_key(family: ProtocolFamily, peer: PeerId) -> (usize, PeerId) {
    (family.index(), peer)
}

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

/// Accepts network peers and binds each one to a pooled session.
pub struct NetworkSessionManager {
    reactors: Vec<NetworkReactor>,
    peers: FxHashMap<(usize, PeerId), BridgeFeed>,
}

impl NetworkSessionManager {
    /// Listen on every address of `addrs`, one reactor per address.
    pub fn listen(addrs: &[SocketAddr], config: &ReactorConfig) -> Result<Self, ReactorError> {
        let mut reactors: Vec<NetworkReactor> = Vec::with_capacity(addrs.len());
        for &addr in addrs {
            let family = ProtocolFamily::of(&addr);
            if reactors.iter().any(|r| r.family() == family) {
                tracing::warn!(%addr, ?family, "family already served, skipping");
                continue;
            }
            reactors.push(NetworkReactor::listen(addr, config.clone())?);
        }
        Ok(Self {
            reactors,
            peers: FxHashMap::default(),
        })
    }

    /// Bound addresses, one per reactor.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.reactors.iter().filter_map(|r| r.local_addr()).collect()
    }

    /// Number of peers bound to a session.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

impl SessionManager for NetworkSessionManager {
    fn poll(&mut self, registry: &mut SessionRegistry) {
        for reactor in &mut self.reactors {
            let family = reactor.family();
            while let Some(event) = reactor.poll_event() {
                match event {
                    ReactorEvent::Connected { peer, data } => {
                        let Some(link) = reactor.link(peer) else {
                            continue;
                        };
                        let (bridge, feed) = NetworkSessionBridge::new(peer, link);
                        feed.push(BridgeEvent::Connected(data));
                        // On a full pool the bridge is dropped, which closes the peer.
                        let Some(session) = registry.create_session(Box::new(bridge)) else {
                            continue;
                        };
                        tracing::debug!(?peer, ?session, "peer bound to session");
                        self.peers.insert(peer_key(family, peer), feed);
                    }
                    ReactorEvent::Packet { peer, payload, .. } => {
                        if let Some(feed) = self.peers.get(&peer_key(family, peer)) {
                            feed.push(BridgeEvent::Packet(payload));
                        }
                    }
                    ReactorEvent::Disconnected { peer, data } => {
                        // The session goes away once its bridge has drained
                        // every packet queued before this.
                        if let Some(feed) = self.peers.remove(&peer_key(family, peer)) {
                            feed.push(BridgeEvent::Disconnected(data));
                        }
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// Client-side owner of the per-family reactors.
pub struct NetworkReactorManager {
    config: ReactorConfig,
    reactors: [Option<NetworkReactor>; 2],
    bridges: FxHashMap<(usize, PeerId), BridgeFeed>,
}

impl NetworkReactorManager {
    /// Create a manager; reactors are allocated on first use.
    pub fn new(config: ReactorConfig) -> Self {
        Self {
            config,
            reactors: [None, None],
            bridges: FxHashMap::default(),
        }
    }

    fn reactor_for(&mut self, family: ProtocolFamily) -> Result<&mut NetworkReactor, ReactorError> {
        let slot = &mut self.reactors[family.index()];
        if slot.is_none() {
            tracing::debug!(?family, "allocating reactor");
            *slot = Some(NetworkReactor::new(family, self.config.clone())?);
        }
        slot.as_mut()
            .ok_or_else(|| ReactorError::Io(std::io::Error::other("reactor allocation failed")))
    }

    /// Start connecting to `addr`. Failures are logged and reported as `None`.
    pub fn connect_to_server(&mut self, addr: SocketAddr, data: u32) -> Option<NetworkSessionBridge> {
        let family = ProtocolFamily::of(&addr);
        let result = self.reactor_for(family).and_then(|reactor| {
            let peer = reactor.connect(addr, data)?;
            let link = reactor.link(peer).ok_or(ReactorError::UnknownPeer(peer))?;
            Ok((peer, link))
        });

        match result {
            Ok((peer, link)) => {
                let (bridge, feed) = NetworkSessionBridge::new(peer, link);
                self.bridges.insert(peer_key(family, peer), feed);
                Some(bridge)
            }
            Err(err) => {
                tracing::error!(%addr, %err, "failed to connect to server");
                None
            }
        }
    }

    /// Number of bridges still tracked.
    pub fn bridge_count(&self) -> usize {
        self.bridges.len()
    }

    /// Forward reactor events to their bridges.
    pub fn poll(&mut self) {
        for reactor in self.reactors.iter_mut().flatten() {
            let family = reactor.family();
            while let Some(event) = reactor.poll_event() {
                match event {
                    ReactorEvent::Connected { peer, data } => {
                        let key = peer_key(family, peer);
                        let delivered = self
                            .bridges
                            .get(&key)
                            .is_some_and(|feed| feed.push(BridgeEvent::Connected(data)));
                        if !delivered {
                            self.bridges.remove(&key);
                            reactor.disconnect(peer, 0);
                        }
                    }
                    ReactorEvent::Packet { peer, payload, .. } => {
                        if let Some(feed) = self.bridges.get(&peer_key(family, peer)) {
                            feed.push(BridgeEvent::Packet(payload));
                        }
                    }
                    ReactorEvent::Disconnected { peer, data } => {
                        if let Some(feed) = self.bridges.remove(&peer_key(family, peer)) {
                            feed.push(BridgeEvent::Disconnected(data));
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::sessions::{MatchClientSession, MatchSessions, SessionEvent};
    use skirmish_protocol::packets::{Auth, AuthSuccess};
    use skirmish_protocol::{CommandStore, match_protocol};

    fn server_sessions() -> (MatchSessions, SocketAddr, Rc<RefCell<Vec<String>>>) {
        let table = Arc::new(match_protocol());
        let players = Rc::new(RefCell::new(Vec::new()));

        let mut commands = CommandStore::<MatchClientSession>::new(table);
        let sink = Rc::clone(&players);
        commands
            .on_incoming::<Auth, _>(move |session, auth| {
                sink.borrow_mut().extend(auth.players);
                let session_id = session.id().0;
                // Fails when the peer already left.
                let _ = session.send_packet(&AuthSuccess {
                    session_id,
                    player_indices: vec![0],
                });
            })
            .unwrap();
        commands.enable_outgoing::<AuthSuccess>().unwrap();

        let manager = NetworkSessionManager::listen(
            &["127.0.0.1:0".parse().unwrap()],
            &ReactorConfig::default(),
        )
        .unwrap();
        let addr = manager.local_addrs()[0];

        let mut sessions = MatchSessions::new(commands, 8);
        sessions.add_manager(Box::new(manager));
        (sessions, addr, players)
    }

    fn pump_until(
        sessions: &mut MatchSessions,
        client: &mut NetworkReactorManager,
        mut done: impl FnMut(&mut MatchSessions) -> bool,
    ) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(sessions) {
            assert!(Instant::now() < deadline, "timed out");
            sessions.poll();
            client.poll();
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn next_bridge_event(
        sessions: &mut MatchSessions,
        client: &mut NetworkReactorManager,
        bridge: &mut NetworkSessionBridge,
    ) -> BridgeEvent {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            sessions.poll();
            client.poll();
            if let Some(event) = bridge.poll_event() {
                return event;
            }
            assert!(Instant::now() < deadline, "timed out");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_connect_authenticate_and_reply() {
        let (mut sessions, addr, players) = server_sessions();
        let mut client = NetworkReactorManager::new(ReactorConfig::default());
        let mut bridge = client.connect_to_server(addr, 0).unwrap();
        assert_eq!(bridge.state(), BridgeState::Connecting);

        assert_eq!(
            next_bridge_event(&mut sessions, &mut client, &mut bridge),
            BridgeEvent::Connected(0)
        );
        pump_until(&mut sessions, &mut client, |s| s.len() == 1);

        let mut client_commands = CommandStore::<Vec<u64>>::new(Arc::new(match_protocol()));
        client_commands.enable_outgoing::<Auth>().unwrap();
        client_commands
            .on_incoming::<AuthSuccess, _>(|ids, success| ids.push(success.session_id))
            .unwrap();
        let auth = client_commands
            .serialize_packet(&Auth {
                protocol_version: 1,
                players: vec!["alice".into()],
            })
            .unwrap();
        bridge.send(auth).unwrap();

        let BridgeEvent::Packet(payload) = next_bridge_event(&mut sessions, &mut client, &mut bridge)
        else {
            panic!("expected a packet");
        };
        let mut ids = Vec::new();
        client_commands.unserialize_packet(&mut ids, &payload).unwrap();
        assert_eq!(ids, vec![0]);
        assert_eq!(*players.borrow(), vec!["alice"]);
    }

    #[test]
    fn test_client_disconnect_deletes_server_session() {
        let (mut sessions, addr, _) = server_sessions();
        let mut client = NetworkReactorManager::new(ReactorConfig::default());
        let mut bridge = client.connect_to_server(addr, 0).unwrap();
        next_bridge_event(&mut sessions, &mut client, &mut bridge);
        pump_until(&mut sessions, &mut client, |s| s.len() == 1);

        bridge.disconnect(4);
        assert_eq!(bridge.state(), BridgeState::Disconnected);
        assert_eq!(bridge.send(probe()), Err(BridgeError::Disconnected));

        pump_until(&mut sessions, &mut client, |s| s.is_empty());
        let deadline = Instant::now() + Duration::from_secs(5);
        while client.bridge_count() > 0 {
            assert!(Instant::now() < deadline, "client kept the bridge");
            client.poll();
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_last_packet_before_disconnect_is_dispatched() {
        let (mut sessions, addr, players) = server_sessions();
        let mut client = NetworkReactorManager::new(ReactorConfig::default());
        let mut bridge = client.connect_to_server(addr, 0).unwrap();
        next_bridge_event(&mut sessions, &mut client, &mut bridge);
        pump_until(&mut sessions, &mut client, |s| s.len() == 1);

        let mut client_commands = CommandStore::<()>::new(Arc::new(match_protocol()));
        client_commands.enable_outgoing::<Auth>().unwrap();
        let auth = client_commands
            .serialize_packet(&Auth {
                protocol_version: 1,
                players: vec!["bob".into()],
            })
            .unwrap();
        bridge.send(auth).unwrap();
        bridge.disconnect(2);

        pump_until(&mut sessions, &mut client, |s| s.is_empty());
        assert_eq!(*players.borrow(), vec!["bob"]);
        let deleted = std::iter::from_fn(|| sessions.poll_event())
            .find(|event| matches!(event, SessionEvent::Deleted { .. }));
        assert!(matches!(deleted, Some(SessionEvent::Deleted { data: 2, .. })));
    }

    #[test]
    fn test_server_disconnect_reaches_client() {
        let (mut sessions, addr, _) = server_sessions();
        let mut client = NetworkReactorManager::new(ReactorConfig::default());
        let mut bridge = client.connect_to_server(addr, 0).unwrap();
        next_bridge_event(&mut sessions, &mut client, &mut bridge);
        pump_until(&mut sessions, &mut client, |s| s.len() == 1);

        let handle = sessions.handles()[0];
        sessions.disconnect_session(handle, 11);

        assert_eq!(
            next_bridge_event(&mut sessions, &mut client, &mut bridge),
            BridgeEvent::Disconnected(11)
        );
        pump_until(&mut sessions, &mut client, |s| s.is_empty());
    }

    #[test]
    fn test_lazy_reactor_allocation_per_family() {
        let mut client = NetworkReactorManager::new(ReactorConfig::default());
        assert!(client.reactors.iter().all(Option::is_none));
        let _bridge = client.connect_to_server("127.0.0.1:9".parse().unwrap(), 0);
        assert!(client.reactors[ProtocolFamily::V4.index()].is_some());
        assert!(client.reactors[ProtocolFamily::V6.index()].is_none());
    }

    fn probe() -> OutgoingPacket {
        OutgoingPacket {
            name: "probe",
            flags: skirmish_protocol::PacketFlags::RELIABLE,
            channel: 0,
            payload: bytes::Bytes::from_static(b"x"),
        }
    }
}
