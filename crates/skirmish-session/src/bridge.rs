//! Transport-agnostic session bridge.
//!
//! A bridge is the transport-specific half of a session. Managers feed
//! [`BridgeEvent`]s into a bridge's inbox; the owner of the bridge drains
//! them with [`SessionBridge::poll_event`], which also applies the state
//! transitions:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected
//! ```
//!
//! Dropping a bridge drops its inbox, which the feeding manager observes as a
//! closed channel; nothing else holds callbacks tied to the bridge.

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use skirmish_protocol::OutgoingPacket;

/// Connection state of a bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// No connection.
    Disconnected,
    /// Connection requested, not yet confirmed.
    Connecting,
    /// Connection established.
    Connected,
}

/// Event surfaced by a bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// The connection was established with the given application data.
    Connected(u32),
    /// The connection ended with the given application data.
    Disconnected(u32),
    /// A packet arrived.
    Packet(Bytes),
}

/// Transport used by a bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeKind {
    /// In-process loopback.
    Local,
    /// Network peer.
    Network,
}

/// Errors raised by bridge operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BridgeError {
    /// The bridge is disconnected (or a disconnect is pending).
    #[error("bridge is disconnected")]
    Disconnected,
}

/// Common interface of local and network bridges.
pub trait SessionBridge {
    /// Transport of this bridge.
    fn kind(&self) -> BridgeKind;

    /// Current connection state.
    fn state(&self) -> BridgeState;

    /// Returns `true` if the bridge is connected.
    fn is_connected(&self) -> bool {
        self.state() == BridgeState::Connected
    }

    /// Queue a packet for the remote end.
    fn send(&mut self, packet: OutgoingPacket) -> Result<(), BridgeError>;

    /// Request disconnection with application data `data`.
    fn disconnect(&mut self, data: u32);

    /// Next pending event, applying its state transition.
    fn poll_event(&mut self) -> Option<BridgeEvent>;

    /// Round-trip time in milliseconds.
    fn ping(&self) -> u32 {
        0
    }

    /// Fraction of packets lost, in `[0, 1]`.
    fn packet_loss(&self) -> f32 {
        0.0
    }
}

/// Manager-side handle that pushes events into a bridge.
#[derive(Debug, Clone)]
pub struct BridgeFeed {
    tx: Sender<BridgeEvent>,
}

impl BridgeFeed {
    /// Push an event. Returns `false` if the bridge has been dropped.
    pub fn push(&self, event: BridgeEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Bridge-side event queue and state machine.
#[derive(Debug)]
pub struct BridgeInbox {
    rx: Receiver<BridgeEvent>,
    state: BridgeState,
}

/// Create a connected feed/inbox pair. The inbox starts in
/// [`BridgeState::Connecting`].
pub fn bridge_channel() -> (BridgeFeed, BridgeInbox) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (
        BridgeFeed { tx },
        BridgeInbox {
            rx,
            state: BridgeState::Connecting,
        },
    )
}

impl BridgeInbox {
    /// Current state.
    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// Force a state, used when a disconnect takes effect locally.
    pub fn set_state(&mut self, state: BridgeState) {
        self.state = state;
    }

    /// Apply the transition for `event` and return it, or `None` if the event
    /// is not valid in the current state.
    fn apply(&mut self, event: BridgeEvent) -> Option<BridgeEvent> {
        match &event {
            BridgeEvent::Connected(_) => {
                if self.state == BridgeState::Connected {
                    return None;
                }
                self.state = BridgeState::Connected;
            }
            BridgeEvent::Disconnected(_) => {
                if self.state == BridgeState::Disconnected {
                    return None;
                }
                self.state = BridgeState::Disconnected;
            }
            BridgeEvent::Packet(payload) => {
                if self.state != BridgeState::Connected {
                    tracing::warn!(
                        size = payload.len(),
                        state = ?self.state,
                        "dropping packet received outside of connected state"
                    );
                    return None;
                }
            }
        }
        Some(event)
    }

    /// Drain the next valid event.
    pub fn poll_event(&mut self) -> Option<BridgeEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    if let Some(event) = self.apply(event) {
                        return Some(event);
                    }
                }
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => {
                    // The manager went away without a goodbye.
                    return self.apply(BridgeEvent::Disconnected(0));
                }
            }
        }
    }
}
