//! Bidirectional packet serialization.
//!
//! A [`PacketSerializer`] wraps a byte buffer in either read or write mode.
//! [`PacketSerializer::serialize`] takes `&mut T` and either appends `T` to
//! the buffer or overwrites `T` with the next value read from it, so a payload
//! type describes its wire format once for both directions.
//!
//! Values are encoded with [`postcard`]: integers wider than a byte are
//! written as variable-length (LEB128-style) varints, which keeps ids, ticks
//! and sizes compact on the wire. Fields that must stay fixed-width can opt
//! out with `#[serde(with = "postcard::fixint::le")]`.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Direction a [`PacketSerializer`] operates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializeMode {
    /// Values are decoded from the buffer.
    Read,
    /// Values are appended to the buffer.
    Write,
}

/// Errors raised while encoding or decoding a packet.
#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    /// The underlying postcard codec failed (truncated or malformed input).
    #[error("codec error: {0}")]
    Postcard(#[from] postcard::Error),

    /// Bytes remained after the payload was fully decoded.
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

enum Buffer<'a> {
    Read { data: &'a [u8], cursor: usize },
    Write(&'a mut Vec<u8>),
}

/// Typed read/write cursor over a packet buffer.
pub struct PacketSerializer<'a> {
    buffer: Buffer<'a>,
}

impl<'a> PacketSerializer<'a> {
    /// Create a serializer that decodes values from `data`.
    pub fn reader(data: &'a [u8]) -> Self {
        Self {
            buffer: Buffer::Read { data, cursor: 0 },
        }
    }

    /// Create a serializer that appends values to `buffer`.
    pub fn writer(buffer: &'a mut Vec<u8>) -> Self {
        Self {
            buffer: Buffer::Write(buffer),
        }
    }

    /// Current direction.
    pub fn mode(&self) -> SerializeMode {
        match self.buffer {
            Buffer::Read { .. } => SerializeMode::Read,
            Buffer::Write(_) => SerializeMode::Write,
        }
    }

    /// Returns `true` in write mode.
    pub fn is_writing(&self) -> bool {
        self.mode() == SerializeMode::Write
    }

    /// Read `value` from the buffer or write it to the buffer, depending on
    /// the mode. In read mode `value` is overwritten; on error it is left
    /// untouched.
    pub fn serialize<T>(&mut self, value: &mut T) -> Result<(), SerializeError>
    where
        T: Serialize + DeserializeOwned,
    {
        match self.mode() {
            SerializeMode::Read => {
                *value = self.read()?;
                Ok(())
            }
            SerializeMode::Write => self.write(value),
        }
    }

    /// Decode the next value. Always fails in write mode with an
    /// end-of-input error.
    pub fn read<T: DeserializeOwned>(&mut self) -> Result<T, SerializeError> {
        match &mut self.buffer {
            Buffer::Read { data, cursor } => {
                let (value, rest) = postcard::take_from_bytes::<T>(&data[*cursor..])?;
                *cursor = data.len() - rest.len();
                Ok(value)
            }
            Buffer::Write(_) => Err(postcard::Error::DeserializeUnexpectedEnd.into()),
        }
    }

    /// Append a value. In read mode this is a no-op.
    pub fn write<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), SerializeError> {
        if let Buffer::Write(out) = &mut self.buffer {
            let encoded = postcard::to_allocvec(value)?;
            out.extend_from_slice(&encoded);
        }
        Ok(())
    }

    /// Number of undecoded bytes left (read mode) or bytes written so far
    /// (write mode).
    pub fn remaining(&self) -> usize {
        match &self.buffer {
            Buffer::Read { data, cursor } => data.len() - cursor,
            Buffer::Write(out) => out.len(),
        }
    }

    /// In read mode, fail if any bytes were left unread.
    pub fn finish(&self) -> Result<(), SerializeError> {
        match &self.buffer {
            Buffer::Read { data, cursor } if *cursor < data.len() => {
                Err(SerializeError::TrailingBytes(data.len() - cursor))
            }
            _ => Ok(()),
        }
    }
}
