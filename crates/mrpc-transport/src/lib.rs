//! mrpc transport layer.
//!
//! The point-to-point side of the RPC stack that the multicast-group
//! extension sits on: the fixed 52-byte packet header and its buffer, the
//! `InitMulticast` control body, per-connection security parameters, and
//! the connection table with its client/server state machines.
//!
//! Everything on the wire is network byte order.
//!
//! ```rust
//! use mrpc_transport::{flags, opcode, ConnHandle, Packet, PacketHeader};
//!
//! let header = PacketHeader {
//!     remote_handle: ConnHandle(7).0,
//!     opcode: 42,
//!     ..PacketHeader::default()
//! };
//! let mut packet = Packet::new(&header, b"hello");
//! packet.set_flag(flags::RETRY);
//! assert!(packet.has_flag(flags::RETRY));
//! assert_eq!(packet.body(), b"hello");
//! assert_ne!(packet.opcode(), opcode::REPLY);
//! ```

pub mod codes;
mod config;
mod connection;
mod control;
mod error;
mod packet;
mod security;

pub use config::{TransportConfig, PROTOCOL_VERSION};
pub use connection::{
    ClientState, ConnState, Connection, ConnectionParams, ConnectionTable, ServerState,
};
pub use control::InitMulticastBody;
pub use error::TransportError;
pub use packet::{
    flags, opcode, Packet, PacketHeader, CONTROL_WORDS_LEN, HEADER_LEN, SEQUENCE_WORDS,
};
pub use security::{EncryptionType, SecurityLevel, SecurityParams, SessionKey, SESSION_KEY_LEN};

use std::fmt;

/// Handle of a point-to-point connection (the connection's unique id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ConnHandle(pub u32);

impl ConnHandle {
    /// The "no connection" entry in caller-supplied recipient lists.
    pub const NONE: ConnHandle = ConnHandle(0);

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ConnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn 0x{:x}", self.0)
    }
}

/// 32-bit multicast group handle as seen on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupHandle(pub u32);

impl fmt::Display for GroupHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mgrp 0x{:x}", self.0)
    }
}

/// Stable index of a group record in the owning group table.
///
/// Connections refer back to their group through this id instead of a
/// pointer; the slot is only reused after the record has been freed and
/// every back-reference to it cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupSlot(pub usize);

/// Side-effect type tag. `0` means "no side effect".
pub type SideEffectType = u32;

/// Which end of an exchange a connection or group record plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Role {
    Client,
    Server,
}
