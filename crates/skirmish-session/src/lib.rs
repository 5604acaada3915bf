//! Session layer of a match: transport-agnostic bridges, in-process and TCP
//! transports, and the server-side session pool.

pub mod bridge;
pub mod framing;
pub mod local;
pub mod network;
pub mod reactor;
pub mod sessions;
pub mod socket;

pub use bridge::{BridgeError, BridgeEvent, BridgeKind, BridgeState, SessionBridge};
pub use local::{LocalSessionBridge, LocalSessionManager};
pub use network::{NetworkReactorManager, NetworkSessionBridge, NetworkSessionManager};
pub use reactor::{
    NetworkReactor, PeerId, ProtocolFamily, ReactorConfig, ReactorError, ReactorEvent,
};
pub use sessions::{
    MatchClientSession, MatchSessions, SessionError, SessionEvent, SessionHandle, SessionId,
    SessionManager, SessionRegistry, SessionStats,
};
pub use socket::{KeepaliveConfig, SocketConfig};
