//! Packet registry and dispatch.
//!
//! A [`PacketTable`] is the ordered list of packet types known to the
//! protocol; a packet's opcode is its index in the table. A
//! [`CommandStore`] layers per-direction state on top of the shared table:
//! which packets this end accepts (each with a type-erased
//! "decode + dispatch" function) and which it may send.
//!
//! Wire layout of every packet: `[opcode: varint u16] [postcard payload]`.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::packets::{Packet, PacketFlags};
use crate::serializer::{PacketSerializer, SerializeError};

/// Index of a packet type in the [`PacketTable`].
pub type Opcode = u16;

/// Errors raised by registration, encoding or dispatch.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// No packet is registered under this opcode.
    #[error("unknown opcode {0}")]
    UnknownOpcode(Opcode),

    /// The packet type is not part of the table.
    #[error("packet {0} is not registered")]
    Unregistered(&'static str),

    /// The packet is known but this end does not accept it.
    #[error("incoming packet {0} is disabled")]
    IncomingDisabled(&'static str),

    /// The packet is known but this end may not send it.
    #[error("outgoing packet {0} is disabled")]
    OutgoingDisabled(&'static str),

    /// Payload encoding or decoding failed.
    #[error("packet {name}: {source}")]
    Serialize {
        /// Packet name.
        name: &'static str,
        /// Underlying codec error.
        #[source]
        source: SerializeError,
    },

    /// The buffer did not even contain an opcode.
    #[error("malformed packet header: {0}")]
    Header(#[source] SerializeError),
}

// ---------------------------------------------------------------------------
// PacketTable
// ---------------------------------------------------------------------------

/// Static description of a registered packet type.
#[derive(Debug, Clone)]
pub struct PacketDescriptor {
    /// Wire name.
    pub name: &'static str,
    /// Rust type of the payload.
    pub type_id: TypeId,
    /// Delivery flags used when sending.
    pub flags: PacketFlags,
    /// Channel used when sending.
    pub channel: u8,
}

/// Ordered packet registry; opcode = registration index.
#[derive(Debug, Clone, Default)]
pub struct PacketTable {
    descriptors: Vec<PacketDescriptor>,
    by_type: HashMap<TypeId, Opcode>,
    by_name: HashMap<&'static str, Opcode>,
}

impl PacketTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `T` to the table. Panics if `T` or its name is already
    /// registered, since two ends built from the same list would then
    /// disagree on every later opcode.
    pub fn with<T: Packet>(mut self) -> Self {
        let type_id = TypeId::of::<T>();
        assert!(
            !self.by_type.contains_key(&type_id) && !self.by_name.contains_key(T::NAME),
            "packet {} registered twice",
            T::NAME
        );

        let opcode = self.descriptors.len() as Opcode;
        self.descriptors.push(PacketDescriptor {
            name: T::NAME,
            type_id,
            flags: T::FLAGS,
            channel: T::CHANNEL,
        });
        self.by_type.insert(type_id, opcode);
        self.by_name.insert(T::NAME, opcode);
        self
    }

    /// Opcode of `T`, if registered.
    pub fn opcode_of<T: Packet>(&self) -> Option<Opcode> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    /// Opcode of the packet named `name`, if registered.
    pub fn opcode_by_name(&self, name: &str) -> Option<Opcode> {
        self.by_name.get(name).copied()
    }

    /// Descriptor of `opcode`, if registered.
    pub fn descriptor(&self, opcode: Opcode) -> Option<&PacketDescriptor> {
        self.descriptors.get(opcode as usize)
    }

    /// Number of registered packets.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Returns `true` if no packet is registered.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Descriptors in opcode order.
    pub fn iter(&self) -> impl Iterator<Item = &PacketDescriptor> {
        self.descriptors.iter()
    }
}

// ---------------------------------------------------------------------------
// Outgoing
// ---------------------------------------------------------------------------

/// A serialized packet ready to hand to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingPacket {
    /// Wire name, for logging.
    pub name: &'static str,
    /// Delivery flags.
    pub flags: PacketFlags,
    /// Transport channel.
    pub channel: u8,
    /// Opcode followed by the payload.
    pub payload: Bytes,
}

/// The sending half of a [`CommandStore`]: which packets may be sent.
///
/// Shared by every session through an [`Arc`] so sessions can encode packets
/// while the incoming half is busy dispatching.
#[derive(Debug, Clone)]
pub struct OutgoingCommands {
    table: Arc<PacketTable>,
    enabled: Vec<bool>,
}

impl OutgoingCommands {
    fn new(table: Arc<PacketTable>) -> Self {
        let enabled = vec![false; table.len()];
        Self { table, enabled }
    }

    /// Returns `true` if `T` may be sent.
    pub fn is_enabled<T: Packet>(&self) -> bool {
        self.table
            .opcode_of::<T>()
            .is_some_and(|op| self.enabled[op as usize])
    }

    /// Encode `data` as `[opcode][payload]`.
    pub fn serialize_packet<T: Packet>(&self, data: &T) -> Result<OutgoingPacket, ProtocolError> {
        let opcode = self
            .table
            .opcode_of::<T>()
            .ok_or(ProtocolError::Unregistered(T::NAME))?;
        if !self.enabled[opcode as usize] {
            return Err(ProtocolError::OutgoingDisabled(T::NAME));
        }

        let mut buffer = Vec::new();
        let mut writer = PacketSerializer::writer(&mut buffer);
        writer
            .write(&opcode)
            .and_then(|_| writer.write(data))
            .map_err(|source| ProtocolError::Serialize {
                name: T::NAME,
                source,
            })?;

        Ok(OutgoingPacket {
            name: T::NAME,
            flags: T::FLAGS,
            channel: T::CHANNEL,
            payload: Bytes::from(buffer),
        })
    }
}

// ---------------------------------------------------------------------------
// CommandStore
// ---------------------------------------------------------------------------

type UnserializeFn<P> =
    Box<dyn FnMut(&mut P, &mut PacketSerializer<'_>) -> Result<(), SerializeError>>;

struct IncomingEntry<P> {
    enabled: bool,
    unserialize: Option<UnserializeFn<P>>,
}

/// Per-end packet registry: incoming handlers plus outgoing permissions.
///
/// `P` is the peer type handed to handlers (typically a server-side session
/// or a client-side connection).
pub struct CommandStore<P> {
    table: Arc<PacketTable>,
    incoming: Vec<IncomingEntry<P>>,
    outgoing: Arc<OutgoingCommands>,
}

impl<P> CommandStore<P> {
    /// Create a store over `table` with every packet disabled in both
    /// directions.
    pub fn new(table: Arc<PacketTable>) -> Self {
        let incoming = (0..table.len())
            .map(|_| IncomingEntry {
                enabled: false,
                unserialize: None,
            })
            .collect();
        let outgoing = Arc::new(OutgoingCommands::new(Arc::clone(&table)));
        Self {
            table,
            incoming,
            outgoing,
        }
    }

    /// The shared packet table.
    pub fn table(&self) -> &Arc<PacketTable> {
        &self.table
    }

    /// Accept `T` and dispatch it to `handler`.
    pub fn on_incoming<T, F>(&mut self, mut handler: F) -> Result<(), ProtocolError>
    where
        T: Packet,
        F: FnMut(&mut P, T) + 'static,
        P: 'static,
    {
        let opcode = self
            .table
            .opcode_of::<T>()
            .ok_or(ProtocolError::Unregistered(T::NAME))?;
        self.incoming[opcode as usize] = IncomingEntry {
            enabled: true,
            unserialize: Some(Box::new(move |peer: &mut P, reader: &mut PacketSerializer<'_>| {
                let data: T = reader.read()?;
                reader.finish()?;
                handler(peer, data);
                Ok(())
            })),
        };
        Ok(())
    }

    /// Toggle acceptance of `T` without dropping its handler.
    pub fn set_incoming_enabled<T: Packet>(&mut self, enabled: bool) -> Result<(), ProtocolError> {
        let opcode = self
            .table
            .opcode_of::<T>()
            .ok_or(ProtocolError::Unregistered(T::NAME))?;
        let entry = &mut self.incoming[opcode as usize];
        entry.enabled = enabled && entry.unserialize.is_some();
        Ok(())
    }

    /// Allow sending `T`. Sessions created before this call keep the
    /// permissions they were created with.
    pub fn enable_outgoing<T: Packet>(&mut self) -> Result<(), ProtocolError> {
        let opcode = self
            .table
            .opcode_of::<T>()
            .ok_or(ProtocolError::Unregistered(T::NAME))?;
        Arc::make_mut(&mut self.outgoing).enabled[opcode as usize] = true;
        Ok(())
    }

    /// Shared handle to the outgoing permissions.
    pub fn outgoing(&self) -> Arc<OutgoingCommands> {
        Arc::clone(&self.outgoing)
    }

    /// Encode `data` for sending.
    pub fn serialize_packet<T: Packet>(&self, data: &T) -> Result<OutgoingPacket, ProtocolError> {
        self.outgoing.serialize_packet(data)
    }

    /// Decode the packet in `buffer` and dispatch it to its handler.
    ///
    /// Unknown opcodes, disabled packets and malformed payloads are rejected
    /// without calling any handler. Returns the name of the dispatched packet.
    pub fn unserialize_packet(
        &mut self,
        peer: &mut P,
        buffer: &[u8],
    ) -> Result<&'static str, ProtocolError> {
        let mut reader = PacketSerializer::reader(buffer);
        let opcode: Opcode = reader.read().map_err(ProtocolError::Header)?;

        let descriptor = self
            .table
            .descriptor(opcode)
            .ok_or(ProtocolError::UnknownOpcode(opcode))?;
        let name = descriptor.name;

        let entry = &mut self.incoming[opcode as usize];
        let unserialize = match (&mut entry.unserialize, entry.enabled) {
            (Some(f), true) => f,
            _ => return Err(ProtocolError::IncomingDisabled(name)),
        };

        unserialize(peer, &mut reader)
            .map_err(|source| ProtocolError::Serialize { name, source })?;
        tracing::trace!(packet = name, "dispatched incoming packet");
        Ok(name)
    }
}
