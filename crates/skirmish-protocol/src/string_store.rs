//! String interning shared between the two ends of a session.
//!
//! The server registers strings (entity classes, weapon names, ...) and sends
//! each new string once through a [`NetworkStrings`] packet; afterwards
//! packets reference the string by its integer id.

use std::collections::HashMap;

use crate::packets::NetworkStrings;

/// Errors raised when applying a remote string batch.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StringStoreError {
    /// The batch starts past the end of the store, which would leave ids
    /// without a string.
    #[error("string batch starts at {first_id} but store only has {len} strings")]
    Gap {
        /// First id of the rejected batch.
        first_id: u32,
        /// Current store size.
        len: u32,
    },
}

/// Append-only bijection between strings and `u32` ids.
#[derive(Debug, Clone, Default)]
pub struct NetworkStringStore {
    strings: Vec<String>,
    indices: HashMap<String, u32>,
}

impl NetworkStringStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the id of `s`, registering it if needed.
    pub fn register_string(&mut self, s: &str) -> u32 {
        if let Some(&id) = self.indices.get(s) {
            return id;
        }
        let id = self.strings.len() as u32;
        self.strings.push(s.to_owned());
        self.indices.insert(s.to_owned(), id);
        id
    }

    /// Id of `s`, if registered.
    pub fn string_index(&self, s: &str) -> Option<u32> {
        self.indices.get(s).copied()
    }

    /// String with id `id`, if it has been received.
    pub fn string(&self, id: u32) -> Option<&str> {
        self.strings.get(id as usize).map(String::as_str)
    }

    /// Number of strings in the store.
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    /// Returns `true` if the store holds no string.
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    /// Strings in id order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> {
        self.strings
            .iter()
            .enumerate()
            .map(|(id, s)| (id as u32, s.as_str()))
    }

    /// Packet carrying every string with id >= `first_id`.
    pub fn build_packet(&self, first_id: u32) -> NetworkStrings {
        let start = (first_id as usize).min(self.strings.len());
        NetworkStrings {
            start_id: first_id,
            strings: self.strings[start..].to_vec(),
        }
    }

    /// Drop every string with id >= `first_id` then append `strings` from
    /// `first_id` onward.
    pub fn fill_store(&mut self, first_id: u32, strings: Vec<String>) -> Result<(), StringStoreError> {
        let len = self.strings.len() as u32;
        if first_id > len {
            return Err(StringStoreError::Gap { first_id, len });
        }

        for removed in self.strings.drain(first_id as usize..) {
            self.indices.remove(&removed);
        }

        for s in strings {
            let id = self.strings.len() as u32;
            self.indices.insert(s.clone(), id);
            self.strings.push(s);
        }
        Ok(())
    }

    /// Apply a packet produced by [`build_packet`](Self::build_packet).
    pub fn apply_packet(&mut self, packet: NetworkStrings) -> Result<(), StringStoreError> {
        self.fill_store(packet.start_id, packet.strings)
    }
}
