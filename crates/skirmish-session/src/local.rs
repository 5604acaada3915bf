//! In-process sessions.
//!
//! A local session is a pair of twin bridges wired through a
//! [`LocalSessionManager`] slot. Whatever one half sends is queued and only
//! delivered to the other half on the next [`SessionManager::poll`], so the
//! local path keeps the same queued contract as the network path.

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use skirmish_protocol::OutgoingPacket;

use crate::bridge::{
    BridgeError, BridgeEvent, BridgeFeed, BridgeInbox, BridgeKind, BridgeState, SessionBridge,
    bridge_channel,
};
use crate::sessions::{SessionHandle, SessionManager, SessionRegistry};

enum LocalRequest {
    Packet(Bytes),
    Disconnect(u32),
}

/// One half of a local session pair.
pub struct LocalSessionBridge {
    requests: Sender<LocalRequest>,
    inbox: BridgeInbox,
    disconnect_requested: bool,
}

impl LocalSessionBridge {
    fn new(requests: Sender<LocalRequest>, inbox: BridgeInbox) -> Self {
        Self {
            requests,
            inbox,
            disconnect_requested: false,
        }
    }
}

impl SessionBridge for LocalSessionBridge {
    fn kind(&self) -> BridgeKind {
        BridgeKind::Local
    }

    fn state(&self) -> BridgeState {
        self.inbox.state()
    }

    fn send(&mut self, packet: OutgoingPacket) -> Result<(), BridgeError> {
        if self.disconnect_requested || self.inbox.state() == BridgeState::Disconnected {
            return Err(BridgeError::Disconnected);
        }
        self.requests
            .send(LocalRequest::Packet(packet.payload))
            .map_err(|_| BridgeError::Disconnected)
    }

    fn disconnect(&mut self, data: u32) {
        if self.disconnect_requested || self.inbox.state() == BridgeState::Disconnected {
            return;
        }
        self.disconnect_requested = true;
        // Takes effect on the manager's next poll.
        let _ = self.requests.send(LocalRequest::Disconnect(data));
    }

    fn poll_event(&mut self) -> Option<BridgeEvent> {
        self.inbox.poll_event()
    }
}

struct LocalPeer {
    session: SessionHandle,
    client_requests: Receiver<LocalRequest>,
    server_requests: Receiver<LocalRequest>,
    client_feed: BridgeFeed,
    server_feed: BridgeFeed,
}

enum Forward {
    Open,
    Closed(u32),
}

/// Drain `requests` into `feed`, stopping at the first disconnect request.
fn forward(requests: &Receiver<LocalRequest>, feed: &BridgeFeed) -> Forward {
    loop {
        match requests.try_recv() {
            Ok(LocalRequest::Packet(payload)) => {
                feed.push(BridgeEvent::Packet(payload));
            }
            Ok(LocalRequest::Disconnect(data)) => return Forward::Closed(data),
            Err(TryRecvError::Empty) => return Forward::Open,
            Err(TryRecvError::Disconnected) => return Forward::Closed(0),
        }
    }
}

/// Owner of every local session pair of a match.
pub struct LocalSessionManager {
    peers: Vec<Option<LocalPeer>>,
}

impl LocalSessionManager {
    /// Create a manager with `max_peers` pair slots.
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: (0..max_peers).map(|_| None).collect(),
        }
    }

    /// Number of live pairs.
    pub fn peer_count(&self) -> usize {
        self.peers.iter().filter(|p| p.is_some()).count()
    }

    /// Build a connected bridge pair, bind the server half to a new session
    /// in `registry` and return the client half.
    ///
    /// Returns `None` if every slot is taken or the session pool is full.
    pub fn create_session(&mut self, registry: &mut SessionRegistry) -> Option<LocalSessionBridge> {
        let Some(slot) = self.peers.iter().position(Option::is_none) else {
            tracing::error!(max = self.peers.len(), "no free local session slot");
            return None;
        };

        let (client_tx, client_requests) = crossbeam_channel::unbounded();
        let (server_tx, server_requests) = crossbeam_channel::unbounded();
        let (client_feed, client_inbox) = bridge_channel();
        let (server_feed, server_inbox) = bridge_channel();

        client_feed.push(BridgeEvent::Connected(0));
        server_feed.push(BridgeEvent::Connected(0));

        let server_bridge = LocalSessionBridge::new(server_tx, server_inbox);
        let session = registry.create_session(Box::new(server_bridge))?;

        self.peers[slot] = Some(LocalPeer {
            session,
            client_requests,
            server_requests,
            client_feed,
            server_feed,
        });
        tracing::debug!(slot, "local session pair created");
        Some(LocalSessionBridge::new(client_tx, client_inbox))
    }
}

impl SessionManager for LocalSessionManager {
    fn poll(&mut self, _registry: &mut SessionRegistry) {
        for (slot, entry) in self.peers.iter_mut().enumerate() {
            let Some(peer) = entry else { continue };

            let client = forward(&peer.client_requests, &peer.server_feed);
            let server = forward(&peer.server_requests, &peer.client_feed);

            let data = match (client, server) {
                (Forward::Open, Forward::Open) => continue,
                (Forward::Closed(data), _) | (_, Forward::Closed(data)) => data,
            };

            // Packets forwarded above stay queued ahead of the goodbye.
            peer.client_feed.push(BridgeEvent::Disconnected(data));
            peer.server_feed.push(BridgeEvent::Disconnected(data));
            tracing::debug!(slot, session = ?peer.session, data, "local session pair closed");
            *entry = None;
        }
    }

    fn as_local_mut(&mut self) -> Option<&mut LocalSessionManager> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;

    use super::*;
    use crate::sessions::{MatchClientSession, MatchSessions, SessionEvent};
    use skirmish_protocol::packets::{Auth, AuthSuccess, NetworkStrings};
    use skirmish_protocol::{CommandStore, match_protocol};

    struct Harness {
        sessions: MatchSessions,
        received: Rc<RefCell<Vec<Vec<String>>>>,
        client: CommandStore<Vec<u64>>,
    }

    fn harness() -> Harness {
        let table = Arc::new(match_protocol());
        let received = Rc::new(RefCell::new(Vec::new()));

        let mut server = CommandStore::<MatchClientSession>::new(Arc::clone(&table));
        let sink = Rc::clone(&received);
        server
            .on_incoming::<NetworkStrings, _>(move |_session, packet| {
                sink.borrow_mut().push(packet.strings);
            })
            .unwrap();
        server
            .on_incoming::<Auth, _>(|session, _auth| {
                let session_id = session.id().0;
                session
                    .send_packet(&AuthSuccess {
                        session_id,
                        player_indices: vec![0],
                    })
                    .unwrap();
            })
            .unwrap();
        server.enable_outgoing::<AuthSuccess>().unwrap();

        let mut sessions = MatchSessions::new(server, 4);
        sessions.add_manager(Box::new(LocalSessionManager::new(2)));

        let mut client = CommandStore::<Vec<u64>>::new(table);
        client.enable_outgoing::<NetworkStrings>().unwrap();
        client.enable_outgoing::<Auth>().unwrap();
        client
            .on_incoming::<AuthSuccess, _>(|ids, success| ids.push(success.session_id))
            .unwrap();

        Harness {
            sessions,
            received,
            client,
        }
    }

    fn strings(id: u32) -> NetworkStrings {
        NetworkStrings {
            start_id: id,
            strings: vec![format!("s{id}")],
        }
    }

    #[test]
    fn test_created_pair_is_connected_after_first_poll() {
        let mut h = harness();
        let mut bridge = h.sessions.create_local_session().unwrap();
        assert_eq!(bridge.poll_event(), Some(BridgeEvent::Connected(0)));
        assert!(bridge.is_connected());
        assert_eq!(h.sessions.len(), 1);
    }

    #[test]
    fn test_client_packets_arrive_in_order_after_one_poll() {
        let mut h = harness();
        let mut bridge = h.sessions.create_local_session().unwrap();
        bridge.poll_event();

        for id in 0..3 {
            bridge.send(h.client.serialize_packet(&strings(id)).unwrap()).unwrap();
        }
        assert!(h.received.borrow().is_empty());

        h.sessions.poll();

        assert_eq!(
            *h.received.borrow(),
            vec![vec!["s0".to_string()], vec!["s1".into()], vec!["s2".into()]]
        );
    }

    #[test]
    fn test_server_reply_reaches_client() {
        let mut h = harness();
        let mut bridge = h.sessions.create_local_session().unwrap();
        bridge.poll_event();

        let auth = Auth {
            protocol_version: 1,
            players: vec!["alice".into()],
        };
        bridge.send(h.client.serialize_packet(&auth).unwrap()).unwrap();
        h.sessions.poll();
        assert_eq!(bridge.poll_event(), None);

        h.sessions.poll();
        let Some(BridgeEvent::Packet(payload)) = bridge.poll_event() else {
            panic!("expected a packet");
        };
        let mut ids = Vec::new();
        h.client.unserialize_packet(&mut ids, &payload).unwrap();
        assert_eq!(ids, vec![0]);
    }

    #[test]
    fn test_client_disconnect_is_processed_on_next_poll() {
        let mut h = harness();
        let mut bridge = h.sessions.create_local_session().unwrap();
        bridge.poll_event();

        bridge.disconnect(7);
        assert_eq!(
            bridge.send(h.client.serialize_packet(&strings(0)).unwrap()),
            Err(BridgeError::Disconnected)
        );
        assert_eq!(h.sessions.len(), 1);

        h.sessions.poll();

        assert_eq!(h.sessions.len(), 0);
        assert_eq!(bridge.poll_event(), Some(BridgeEvent::Disconnected(7)));
        assert_eq!(bridge.state(), BridgeState::Disconnected);
        h.sessions.poll_event();
        assert!(matches!(
            h.sessions.poll_event(),
            Some(SessionEvent::Deleted { data: 7, .. })
        ));
    }

    #[test]
    fn test_packets_sent_before_disconnect_are_dispatched() {
        let mut h = harness();
        let mut bridge = h.sessions.create_local_session().unwrap();
        bridge.poll_event();

        bridge.send(h.client.serialize_packet(&strings(0)).unwrap()).unwrap();
        bridge.send(h.client.serialize_packet(&strings(1)).unwrap()).unwrap();
        bridge.disconnect(1);

        h.sessions.poll();
        h.sessions.poll();

        assert_eq!(
            *h.received.borrow(),
            vec![vec!["s0".to_string()], vec!["s1".into()]]
        );
        assert!(h.sessions.is_empty());
        h.sessions.poll_event();
        assert!(matches!(
            h.sessions.poll_event(),
            Some(SessionEvent::Deleted { data: 1, .. })
        ));
    }

    #[test]
    fn test_server_disconnect_notifies_client() {
        let mut h = harness();
        let mut bridge = h.sessions.create_local_session().unwrap();
        bridge.poll_event();
        let handle = h.sessions.handles()[0];

        h.sessions.disconnect_session(handle, 3);
        h.sessions.poll();

        assert!(h.sessions.session(handle).is_none());
        assert_eq!(bridge.poll_event(), Some(BridgeEvent::Disconnected(3)));
    }

    #[test]
    fn test_dropped_client_bridge_closes_session() {
        let mut h = harness();
        let bridge = h.sessions.create_local_session().unwrap();
        drop(bridge);

        h.sessions.poll();
        assert!(h.sessions.is_empty());
    }

    #[test]
    fn test_slots_are_bounded_and_recycled() {
        let mut h = harness();
        let mut first = h.sessions.create_local_session().unwrap();
        let _second = h.sessions.create_local_session().unwrap();
        assert!(h.sessions.create_local_session().is_none());

        first.poll_event();
        first.disconnect(0);
        h.sessions.poll();
        assert!(h.sessions.create_local_session().is_some());
    }
}
