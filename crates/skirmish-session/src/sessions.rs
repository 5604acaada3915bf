//! Server-side session pool and the per-frame polling loop.
//!
//! [`MatchSessions`] owns a [`SessionRegistry`] (a dense slot array with a
//! free list, addressed by generation-checked [`SessionHandle`]s), the
//! server's [`CommandStore`], and any number of [`SessionManager`]s. Each
//! [`MatchSessions::poll`] lets every manager move transport events into
//! bridges (creating or deleting sessions on the way), then drains every
//! session's bridge and dispatches incoming packets.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use skirmish_protocol::{CommandStore, OutgoingCommands, OutgoingPacket, Packet, ProtocolError};

use crate::bridge::{BridgeError, BridgeEvent, BridgeState, SessionBridge};
use crate::local::{LocalSessionBridge, LocalSessionManager};

/// Server-assigned session identifier, never reused within a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

/// Generation-checked reference to a pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    index: u32,
    generation: u32,
}

/// Errors raised when sending through a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The handle refers to a deleted session.
    #[error("session no longer exists")]
    UnknownSession,
    /// The packet could not be encoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The transport refused the packet.
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

/// Lifecycle notification produced by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A session was created.
    Created {
        /// Pool handle.
        handle: SessionHandle,
        /// Session id.
        id: SessionId,
    },
    /// A session was destroyed.
    Deleted {
        /// Pool handle (now stale).
        handle: SessionHandle,
        /// Session id.
        id: SessionId,
        /// Disconnection data reported by the transport.
        data: u32,
    },
}

/// Cumulative traffic statistics of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SessionStats {
    /// Payload bytes sent.
    pub bytes_sent: u64,
    /// Payload bytes received.
    pub bytes_received: u64,
    /// Packets sent.
    pub packets_sent: u64,
    /// Packets received.
    pub packets_received: u64,
    /// Last measured round-trip time in milliseconds.
    pub ping_ms: u32,
    /// Packet loss ratio in `[0, 1]`.
    pub packet_loss: f32,
}

// ---------------------------------------------------------------------------
// MatchClientSession
// ---------------------------------------------------------------------------

/// Server-side view of one connected client.
pub struct MatchClientSession {
    id: SessionId,
    handle: SessionHandle,
    bridge: Box<dyn SessionBridge>,
    outgoing: Arc<OutgoingCommands>,
    stats: SessionStats,
    disconnect_data: Option<u32>,
}

impl MatchClientSession {
    /// Session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Pool handle.
    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    /// Returns `true` while the bridge is connected.
    pub fn is_connected(&self) -> bool {
        self.bridge.is_connected()
    }

    /// The underlying transport.
    pub fn bridge(&self) -> &dyn SessionBridge {
        self.bridge.as_ref()
    }

    /// Traffic statistics, with ping and loss refreshed from the bridge.
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            ping_ms: self.bridge.ping(),
            packet_loss: self.bridge.packet_loss(),
            ..self.stats
        }
    }

    /// Encode and send a packet.
    pub fn send_packet<T: Packet>(&mut self, data: &T) -> Result<(), SessionError> {
        let packet = self.outgoing.serialize_packet(data)?;
        self.send_raw(packet)
    }

    /// Send an already encoded packet.
    pub fn send_raw(&mut self, packet: OutgoingPacket) -> Result<(), SessionError> {
        let size = packet.payload.len() as u64;
        self.bridge.send(packet)?;
        self.stats.bytes_sent += size;
        self.stats.packets_sent += 1;
        Ok(())
    }

    /// Ask the transport to disconnect. The session is destroyed by the
    /// next [`MatchSessions::poll`] that sees the bridge disconnected.
    pub fn disconnect(&mut self, data: u32) {
        self.disconnect_data.get_or_insert(data);
        self.bridge.disconnect(data);
    }

    /// Drain the bridge into `commands`. Returns the disconnection data once
    /// the bridge is gone.
    fn dispatch(&mut self, commands: &mut CommandStore<MatchClientSession>) -> Option<u32> {
        while let Some(event) = self.poll_event() {
            match event {
                BridgeEvent::Packet(payload) => {
                    if let Err(err) = commands.unserialize_packet(self, &payload) {
                        tracing::warn!(session = self.id.0, %err, "dropping incoming packet");
                    }
                }
                BridgeEvent::Connected(data) => {
                    tracing::debug!(session = self.id.0, data, "session connected");
                }
                BridgeEvent::Disconnected(data) => return Some(data),
            }
        }
        // Transports that close on request never report it back.
        (self.bridge.state() == BridgeState::Disconnected).then(|| self.disconnect_data.unwrap_or(0))
    }

    fn poll_event(&mut self) -> Option<BridgeEvent> {
        let event = self.bridge.poll_event()?;
        if let BridgeEvent::Packet(payload) = &event {
            self.stats.bytes_received += payload.len() as u64;
            self.stats.packets_received += 1;
        }
        Some(event)
    }
}

// ---------------------------------------------------------------------------
// SessionRegistry
// ---------------------------------------------------------------------------

struct SessionSlot {
    generation: u32,
    session: Option<MatchClientSession>,
}

/// Fixed-capacity session pool.
pub struct SessionRegistry {
    slots: Vec<SessionSlot>,
    free: Vec<u32>,
    max_sessions: usize,
    next_session_id: u64,
    by_id: HashMap<SessionId, SessionHandle>,
    outgoing: Arc<OutgoingCommands>,
    events: VecDeque<SessionEvent>,
}

impl SessionRegistry {
    /// Create a pool holding at most `max_sessions` sessions that encode
    /// packets with `outgoing`.
    pub fn new(max_sessions: usize, outgoing: Arc<OutgoingCommands>) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            max_sessions,
            next_session_id: 0,
            by_id: HashMap::new(),
            outgoing,
            events: VecDeque::new(),
        }
    }

    /// Bind a new session to `bridge`. Returns `None` if the pool is full.
    pub fn create_session(&mut self, bridge: Box<dyn SessionBridge>) -> Option<SessionHandle> {
        let index = match self.free.pop() {
            Some(index) => index,
            None if self.slots.len() < self.max_sessions => {
                self.slots.push(SessionSlot {
                    generation: 0,
                    session: None,
                });
                (self.slots.len() - 1) as u32
            }
            None => {
                tracing::warn!(max = self.max_sessions, "session pool exhausted");
                return None;
            }
        };

        let slot = &mut self.slots[index as usize];
        let handle = SessionHandle {
            index,
            generation: slot.generation,
        };
        let id = SessionId(self.next_session_id);
        self.next_session_id += 1;

        slot.session = Some(MatchClientSession {
            id,
            handle,
            bridge,
            outgoing: Arc::clone(&self.outgoing),
            stats: SessionStats::default(),
            disconnect_data: None,
        });
        self.by_id.insert(id, handle);
        self.events.push_back(SessionEvent::Created { handle, id });
        tracing::info!(session = id.0, "session created");
        Some(handle)
    }

    /// Destroy the session behind `handle`, returning it. Stale handles are
    /// ignored.
    pub fn delete_session(&mut self, handle: SessionHandle, data: u32) -> Option<MatchClientSession> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let session = slot.session.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.by_id.remove(&session.id);
        self.events.push_back(SessionEvent::Deleted {
            handle,
            id: session.id,
            data,
        });
        tracing::info!(session = session.id.0, data, "session deleted");
        Some(session)
    }

    /// Session behind `handle`, if still alive.
    pub fn get(&self, handle: SessionHandle) -> Option<&MatchClientSession> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.session.as_ref()
    }

    /// Mutable session behind `handle`, if still alive.
    pub fn get_mut(&mut self, handle: SessionHandle) -> Option<&mut MatchClientSession> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.session.as_mut()
    }

    /// Handle of the session with id `id`.
    pub fn find_by_id(&self, id: SessionId) -> Option<SessionHandle> {
        self.by_id.get(&id).copied()
    }

    /// Handles of every live session, in slot order.
    pub fn handles(&self) -> Vec<SessionHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.session.is_some())
            .map(|(index, slot)| SessionHandle {
                index: index as u32,
                generation: slot.generation,
            })
            .collect()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Returns `true` if no session is alive.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

// ---------------------------------------------------------------------------
// SessionManager
// ---------------------------------------------------------------------------

/// A transport family feeding sessions into a [`SessionRegistry`].
pub trait SessionManager {
    /// Move pending transport events into bridges, creating and deleting
    /// sessions as connections come and go.
    fn poll(&mut self, registry: &mut SessionRegistry);

    /// Downcast to the local manager.
    fn as_local_mut(&mut self) -> Option<&mut LocalSessionManager> {
        None
    }
}

// ---------------------------------------------------------------------------
// MatchSessions
// ---------------------------------------------------------------------------

/// All sessions of a match, across every transport.
pub struct MatchSessions {
    registry: SessionRegistry,
    managers: Vec<Box<dyn SessionManager>>,
    commands: CommandStore<MatchClientSession>,
}

impl MatchSessions {
    /// Create an empty match with a fully configured command store.
    pub fn new(commands: CommandStore<MatchClientSession>, max_sessions: usize) -> Self {
        Self {
            registry: SessionRegistry::new(max_sessions, commands.outgoing()),
            managers: Vec::new(),
            commands,
        }
    }

    /// Add a transport.
    pub fn add_manager(&mut self, manager: Box<dyn SessionManager>) {
        self.managers.push(manager);
    }

    /// Create an in-process session through the first local manager, returning
    /// the client-side bridge.
    pub fn create_local_session(&mut self) -> Option<LocalSessionBridge> {
        let Some(local) = self.managers.iter_mut().find_map(|m| m.as_local_mut()) else {
            tracing::error!("no local session manager registered");
            return None;
        };
        local.create_session(&mut self.registry)
    }

    /// Poll every manager then dispatch every pending packet.
    ///
    /// Managers only feed bridges; sessions are deleted here, after every
    /// packet queued ahead of the disconnection has been dispatched.
    pub fn poll(&mut self) {
        for manager in &mut self.managers {
            manager.poll(&mut self.registry);
        }

        for handle in self.registry.handles() {
            // Handlers may not remove sessions, so every handle is still live.
            let lost = self
                .registry
                .get_mut(handle)
                .and_then(|session| session.dispatch(&mut self.commands));
            if let Some(data) = lost {
                self.registry.delete_session(handle, data);
            }
        }
    }

    /// Encode and send `data` to one session.
    pub fn send_packet<T: Packet>(&mut self, handle: SessionHandle, data: &T) -> Result<(), SessionError> {
        self.registry
            .get_mut(handle)
            .ok_or(SessionError::UnknownSession)?
            .send_packet(data)
    }

    /// Encode `data` once and send it to every connected session.
    pub fn broadcast_packet<T: Packet>(&mut self, data: &T) -> Result<(), SessionError> {
        let packet = self.commands.serialize_packet(data)?;
        for handle in self.registry.handles() {
            let Some(session) = self.registry.get_mut(handle) else {
                continue;
            };
            if !session.is_connected() {
                continue;
            }
            if let Err(err) = session.send_raw(packet.clone()) {
                tracing::warn!(session = session.id.0, %err, "broadcast failed");
            }
        }
        Ok(())
    }

    /// Ask the transport of `handle` to disconnect.
    pub fn disconnect_session(&mut self, handle: SessionHandle, data: u32) {
        if let Some(session) = self.registry.get_mut(handle) {
            session.disconnect(data);
        }
    }

    /// Session behind `handle`.
    pub fn session(&self, handle: SessionHandle) -> Option<&MatchClientSession> {
        self.registry.get(handle)
    }

    /// Mutable session behind `handle`.
    pub fn session_mut(&mut self, handle: SessionHandle) -> Option<&mut MatchClientSession> {
        self.registry.get_mut(handle)
    }

    /// Handle of the session with id `id`.
    pub fn find_by_id(&self, id: SessionId) -> Option<SessionHandle> {
        self.registry.find_by_id(id)
    }

    /// Handles of every live session.
    pub fn handles(&self) -> Vec<SessionHandle> {
        self.registry.handles()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    /// Returns `true` if no session is alive.
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Next session lifecycle event.
    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.registry.events.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::bridge::BridgeKind;
    use bytes::Bytes;
    use skirmish_protocol::packets::{Auth, AuthSuccess, Ready};
    use skirmish_protocol::{PacketTable, match_protocol};

    /// Bridge fed by hand, recording what the session sends.
    struct ScriptedBridge {
        incoming: VecDeque<BridgeEvent>,
        sent: Rc<RefCell<Vec<OutgoingPacket>>>,
        state: BridgeState,
        /// Close on request without reporting it, like a network bridge.
        closes_silently: bool,
    }

    impl SessionBridge for ScriptedBridge {
        fn kind(&self) -> BridgeKind {
            BridgeKind::Local
        }

        fn state(&self) -> BridgeState {
            self.state
        }

        fn send(&mut self, packet: OutgoingPacket) -> Result<(), BridgeError> {
            if self.state == BridgeState::Disconnected {
                return Err(BridgeError::Disconnected);
            }
            self.sent.borrow_mut().push(packet);
            Ok(())
        }

        fn disconnect(&mut self, data: u32) {
            if self.closes_silently {
                self.state = BridgeState::Disconnected;
            } else {
                self.incoming.push_back(BridgeEvent::Disconnected(data));
            }
        }

        fn poll_event(&mut self) -> Option<BridgeEvent> {
            let event = self.incoming.pop_front()?;
            match event {
                BridgeEvent::Connected(_) => self.state = BridgeState::Connected,
                BridgeEvent::Disconnected(_) => self.state = BridgeState::Disconnected,
                BridgeEvent::Packet(_) => {}
            }
            Some(event)
        }

        fn ping(&self) -> u32 {
            42
        }
    }

    fn scripted(events: Vec<BridgeEvent>) -> (Box<dyn SessionBridge>, Rc<RefCell<Vec<OutgoingPacket>>>) {
        let sent = Rc::new(RefCell::new(Vec::new()));
        let bridge = ScriptedBridge {
            incoming: events.into(),
            sent: Rc::clone(&sent),
            state: BridgeState::Connected,
            closes_silently: false,
        };
        (Box::new(bridge), sent)
    }

    fn table() -> Arc<PacketTable> {
        Arc::new(match_protocol())
    }

    fn server_commands() -> CommandStore<MatchClientSession> {
        let mut commands = CommandStore::new(table());
        commands
            .on_incoming::<Auth, _>(|session: &mut MatchClientSession, _auth: Auth| {
                let id = session.id().0;
                session
                    .send_packet(&AuthSuccess {
                        session_id: id,
                        player_indices: vec![0],
                    })
                    .unwrap();
            })
            .unwrap();
        commands.enable_outgoing::<AuthSuccess>().unwrap();
        commands.enable_outgoing::<Ready>().unwrap();
        commands
    }

    fn encoded<T: Packet>(data: &T) -> Bytes {
        let mut client = CommandStore::<()>::new(table());
        client.enable_outgoing::<T>().unwrap();
        client.serialize_packet(data).unwrap().payload
    }

    fn test_registry(max: usize) -> SessionRegistry {
        SessionRegistry::new(max, CommandStore::<MatchClientSession>::new(table()).outgoing())
    }

    #[test]
    fn test_session_ids_are_monotonic_and_not_reused() {
        let mut registry = test_registry(4);
        let (a, _) = scripted(vec![]);
        let (b, _) = scripted(vec![]);
        let first = registry.create_session(a).unwrap();
        let first_id = registry.get(first).unwrap().id();
        registry.delete_session(first, 0);

        let second = registry.create_session(b).unwrap();
        assert!(registry.get(second).unwrap().id() > first_id);
    }

    #[test]
    fn test_stale_handle_after_slot_reuse() {
        let mut registry = test_registry(1);
        let (a, _) = scripted(vec![]);
        let (b, _) = scripted(vec![]);
        let old = registry.create_session(a).unwrap();
        registry.delete_session(old, 0);
        let new = registry.create_session(b).unwrap();

        assert!(registry.get(old).is_none());
        assert!(registry.get(new).is_some());
        assert!(registry.delete_session(old, 0).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_pool_capacity_is_enforced() {
        let mut registry = test_registry(2);
        for _ in 0..2 {
            let (bridge, _) = scripted(vec![]);
            assert!(registry.create_session(bridge).is_some());
        }
        let (bridge, _) = scripted(vec![]);
        assert!(registry.create_session(bridge).is_none());
    }

    #[test]
    fn test_poll_dispatches_packets_to_handlers() {
        let mut sessions = MatchSessions::new(server_commands(), 8);
        let auth = encoded(&Auth {
            protocol_version: 1,
            players: vec!["alice".into()],
        });
        let (bridge, sent) = scripted(vec![BridgeEvent::Packet(auth)]);
        let handle = sessions.registry.create_session(bridge).unwrap();

        sessions.poll();

        assert_eq!(sent.borrow().len(), 1);
        assert_eq!(sent.borrow()[0].name, "AuthSuccess");
        let stats = sessions.session(handle).unwrap().stats();
        assert_eq!(stats.packets_received, 1);
        assert_eq!(stats.packets_sent, 1);
        assert_eq!(stats.ping_ms, 42);
    }

    #[test]
    fn test_malformed_packet_does_not_tear_down_session() {
        let mut sessions = MatchSessions::new(server_commands(), 8);
        let garbage = Bytes::from_static(&[0x7f, 0x01, 0x02]);
        let (bridge, sent) = scripted(vec![BridgeEvent::Packet(garbage)]);
        let handle = sessions.registry.create_session(bridge).unwrap();

        sessions.poll();

        assert!(sessions.session(handle).is_some());
        assert!(sent.borrow().is_empty());
    }

    #[test]
    fn test_disconnected_bridge_deletes_session() {
        let mut sessions = MatchSessions::new(server_commands(), 8);
        let (bridge, _) = scripted(vec![BridgeEvent::Disconnected(5)]);
        let handle = sessions.registry.create_session(bridge).unwrap();
        let id = sessions.session(handle).unwrap().id();

        sessions.poll();

        assert!(sessions.session(handle).is_none());
        assert_eq!(sessions.poll_event(), Some(SessionEvent::Created { handle, id }));
        assert_eq!(
            sessions.poll_event(),
            Some(SessionEvent::Deleted { handle, id, data: 5 })
        );
    }

    #[test]
    fn test_packets_ahead_of_disconnect_are_dispatched() {
        let mut sessions = MatchSessions::new(server_commands(), 8);
        let auth = encoded(&Auth {
            protocol_version: 1,
            players: vec!["alice".into()],
        });
        let (bridge, sent) = scripted(vec![
            BridgeEvent::Packet(auth),
            BridgeEvent::Disconnected(6),
        ]);
        let handle = sessions.registry.create_session(bridge).unwrap();

        sessions.poll();

        assert_eq!(sent.borrow().len(), 1);
        assert!(sessions.session(handle).is_none());
        sessions.poll_event();
        assert!(matches!(
            sessions.poll_event(),
            Some(SessionEvent::Deleted { data: 6, .. })
        ));
    }

    #[test]
    fn test_silently_closed_bridge_is_deleted_with_requested_data() {
        let mut sessions = MatchSessions::new(server_commands(), 8);
        let sent = Rc::new(RefCell::new(Vec::new()));
        let bridge = ScriptedBridge {
            incoming: VecDeque::new(),
            sent,
            state: BridgeState::Connected,
            closes_silently: true,
        };
        let handle = sessions.registry.create_session(Box::new(bridge)).unwrap();

        sessions.disconnect_session(handle, 8);
        assert!(sessions.session(handle).is_some());
        sessions.poll();

        assert!(sessions.session(handle).is_none());
        sessions.poll_event();
        assert!(matches!(
            sessions.poll_event(),
            Some(SessionEvent::Deleted { data: 8, .. })
        ));
    }

    #[test]
    fn test_broadcast_reaches_every_session() {
        let mut sessions = MatchSessions::new(server_commands(), 8);
        let (a, sent_a) = scripted(vec![]);
        let (b, sent_b) = scripted(vec![]);
        sessions.registry.create_session(a).unwrap();
        sessions.registry.create_session(b).unwrap();

        sessions.broadcast_packet(&Ready).unwrap();

        assert_eq!(sent_a.borrow().len(), 1);
        assert_eq!(sent_b.borrow().len(), 1);
    }

    #[test]
    fn test_send_to_deleted_session_fails() {
        let mut sessions = MatchSessions::new(server_commands(), 8);
        let (bridge, _) = scripted(vec![]);
        let handle = sessions.registry.create_session(bridge).unwrap();
        sessions.registry.delete_session(handle, 0);

        assert!(matches!(
            sessions.send_packet(handle, &Ready),
            Err(SessionError::UnknownSession)
        ));
    }

    #[test]
    fn test_create_local_session_without_manager() {
        let mut sessions = MatchSessions::new(server_commands(), 8);
        assert!(sessions.create_local_session().is_none());
    }
}
