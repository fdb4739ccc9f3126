//! Point-to-point connection records.
//!
//! Pure bookkeeping, no I/O: the multicast layer drives these state
//! machines and keeps the group back-reference consistent.
use std::collections::HashMap;
use std::net::SocketAddr;

use crate::{
    ConnHandle, GroupSlot, Packet, PacketHeader, Role, SecurityParams, SideEffectType,
};

// ── States ───────────────────────────────────────────────────────────────

/// Client-side states. `Think` is idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    Think,
    AwaitReply,
    HardError,
}

/// Server-side states. `AwaitRequest` is idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    AwaitRequest,
    Process,
    HardError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    Client(ClientState),
    Server(ServerState),
}

impl ConnState {
    pub fn idle(role: Role) -> Self {
        match role {
            Role::Client => ConnState::Client(ClientState::Think),
            Role::Server => ConnState::Server(ServerState::AwaitRequest),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            ConnState::Client(_) => Role::Client,
            ConnState::Server(_) => Role::Server,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(
            self,
            ConnState::Client(ClientState::Think) | ConnState::Server(ServerState::AwaitRequest)
        )
    }

    pub fn is_hard_error(&self) -> bool {
        matches!(
            self,
            ConnState::Client(ClientState::HardError) | ConnState::Server(ServerState::HardError)
        )
    }

    /// The busy state for this role (`AwaitReply` or `Process`).
    pub fn busy(&self) -> Self {
        match self {
            ConnState::Client(_) => ConnState::Client(ClientState::AwaitReply),
            ConnState::Server(_) => ConnState::Server(ServerState::Process),
        }
    }

    pub fn hard_error(&self) -> Self {
        match self {
            ConnState::Client(_) => ConnState::Client(ClientState::HardError),
            ConnState::Server(_) => ConnState::Server(ServerState::HardError),
        }
    }
}

// ── Connection ───────────────────────────────────────────────────────────

/// What a bind produced; the bind exchange itself lives elsewhere.
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub role: Role,
    pub peer_handle: u32,
    pub peer_addr: Option<SocketAddr>,
    pub subsys_id: u32,
    pub security: SecurityParams,
    pub side_effect: SideEffectType,
    pub initial_seq: u32,
}

impl ConnectionParams {
    pub fn new(role: Role, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            role,
            peer_handle: 0,
            peer_addr,
            subsys_id: 0,
            security: SecurityParams::open(),
            side_effect: 0,
            initial_seq: 0,
        }
    }

    pub fn peer_handle(mut self, handle: u32) -> Self {
        self.peer_handle = handle;
        self
    }

    pub fn subsys_id(mut self, subsys: u32) -> Self {
        self.subsys_id = subsys;
        self
    }

    pub fn security(mut self, security: SecurityParams) -> Self {
        self.security = security;
        self
    }

    pub fn side_effect(mut self, side_effect: SideEffectType) -> Self {
        self.side_effect = side_effect;
        self
    }

    pub fn initial_seq(mut self, seq: u32) -> Self {
        self.initial_seq = seq;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Connection {
    pub handle: ConnHandle,
    pub peer_handle: u32,
    pub peer_addr: Option<SocketAddr>,
    pub state: ConnState,
    pub subsys_id: u32,
    pub security: SecurityParams,
    pub side_effect: SideEffectType,
    /// Next sequence number to send (client) or expect (server).
    pub next_seq: u32,
    /// Group this connection belongs to, if any.
    pub mgrp: Option<GroupSlot>,
    /// Last reply sent, kept for retransmission.
    pub held_reply: Option<Packet>,
}

impl Connection {
    pub fn role(&self) -> Role {
        self.state.role()
    }

    /// Header for the next outgoing request on this connection.
    pub fn request_header(&self, proto_version: u32, opcode: i32) -> PacketHeader {
        PacketHeader {
            proto_version,
            remote_handle: self.peer_handle,
            local_handle: self.handle.0,
            seq_number: self.next_seq,
            opcode,
            subsys_id: self.subsys_id,
            ..PacketHeader::default()
        }
    }

    pub fn advance_seq(&mut self) {
        self.next_seq = self.next_seq.wrapping_add(1);
    }
}

/// Live connections keyed by handle. Handles are never reused.
#[derive(Debug)]
pub struct ConnectionTable {
    conns: HashMap<ConnHandle, Connection>,
    next_handle: u32,
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Table whose first handle is `first` (must be non-zero).
    pub fn starting_at(first: u32) -> Self {
        Self {
            conns: HashMap::new(),
            next_handle: first.max(1),
        }
    }

    pub fn open(&mut self, params: ConnectionParams) -> ConnHandle {
        let handle = ConnHandle(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        self.conns.insert(
            handle,
            Connection {
                handle,
                peer_handle: params.peer_handle,
                peer_addr: params.peer_addr,
                state: ConnState::idle(params.role),
                subsys_id: params.subsys_id,
                security: params.security,
                side_effect: params.side_effect,
                next_seq: params.initial_seq,
                mgrp: None,
                held_reply: None,
            },
        );
        tracing::debug!("opened {handle} ({:?})", params.role);
        handle
    }

    pub fn get(&self, handle: ConnHandle) -> Option<&Connection> {
        self.conns.get(&handle)
    }

    pub fn get_mut(&mut self, handle: ConnHandle) -> Option<&mut Connection> {
        self.conns.get_mut(&handle)
    }

    pub fn remove(&mut self, handle: ConnHandle) -> Option<Connection> {
        let conn = self.conns.remove(&handle);
        if conn.is_some() {
            tracing::debug!("closed {handle}");
        }
        conn
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.conns.values()
    }
}
