//! Match wire protocol: bidirectional packet serialization, the ordered
//! packet registry with per-direction command stores, and network string
//! interning.

pub mod command_store;
pub mod packets;
pub mod serializer;
pub mod string_store;

pub use command_store::{
    CommandStore, Opcode, OutgoingCommands, OutgoingPacket, PacketDescriptor, PacketTable,
    ProtocolError,
};
pub use packets::{Checksum, PROTOCOL_VERSION, Packet, PacketFlags, match_protocol};
pub use serializer::{PacketSerializer, SerializeError, SerializeMode};
pub use string_store::{NetworkStringStore, StringStoreError};
