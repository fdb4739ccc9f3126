use std::net::SocketAddr;

use mrpc_transport::{
    ClientState, ConnHandle, GroupHandle, Packet, Role, SecurityParams, ServerState,
    SideEffectType,
};

/// Role and role-specific state of a group record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupKind {
    /// On the free list. Owns nothing.
    Free,
    /// Sending side: the fan-out list, in join order.
    Client {
        state: ClientState,
        members: Vec<ConnHandle>,
    },
    /// Receiving side: bound to exactly one connection.
    Server { state: ServerState, conn: ConnHandle },
}

impl GroupKind {
    pub fn new_client() -> Self {
        GroupKind::Client {
            state: ClientState::Think,
            members: Vec::new(),
        }
    }

    pub fn new_server(conn: ConnHandle) -> Self {
        GroupKind::Server {
            state: ServerState::AwaitRequest,
            conn,
        }
    }

    pub fn role(&self) -> Option<Role> {
        match self {
            GroupKind::Free => None,
            GroupKind::Client { .. } => Some(Role::Client),
            GroupKind::Server { .. } => Some(Role::Server),
        }
    }
}

/// A multicast group descriptor.
#[derive(Debug, Clone)]
pub struct GroupRecord {
    pub(crate) handle: GroupHandle,
    /// Address of the client that owns the group; `None` on the client
    /// itself.
    pub(crate) client_addr: Option<SocketAddr>,
    /// Resolved group address (client role only).
    pub(crate) mcast_addr: Option<SocketAddr>,
    pub(crate) kind: GroupKind,
    pub(crate) subsys_id: u32,
    pub(crate) security: SecurityParams,
    pub(crate) next_seq: u32,
    pub(crate) side_effect: SideEffectType,
    pub(crate) current_packet: Option<Packet>,
}

impl GroupRecord {
    pub(crate) fn free() -> Self {
        Self {
            handle: GroupHandle(0),
            client_addr: None,
            mcast_addr: None,
            kind: GroupKind::Free,
            subsys_id: 0,
            security: SecurityParams::open(),
            next_seq: 0,
            side_effect: 0,
            current_packet: None,
        }
    }

    pub fn handle(&self) -> GroupHandle {
        self.handle
    }

    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.client_addr
    }

    pub fn mcast_addr(&self) -> Option<SocketAddr> {
        self.mcast_addr
    }

    pub fn kind(&self) -> &GroupKind {
        &self.kind
    }

    pub fn role(&self) -> Option<Role> {
        self.kind.role()
    }

    pub fn is_free(&self) -> bool {
        self.kind == GroupKind::Free
    }

    pub fn subsys_id(&self) -> u32 {
        self.subsys_id
    }

    pub fn security(&self) -> &SecurityParams {
        &self.security
    }

    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    pub fn side_effect(&self) -> SideEffectType {
        self.side_effect
    }

    pub fn current_packet(&self) -> Option<&Packet> {
        self.current_packet.as_ref()
    }

    /// Client state, `None` unless client role.
    pub fn client_state(&self) -> Option<ClientState> {
        match &self.kind {
            GroupKind::Client { state, .. } => Some(*state),
            _ => None,
        }
    }

    /// Server state, `None` unless server role.
    pub fn server_state(&self) -> Option<ServerState> {
        match &self.kind {
            GroupKind::Server { state, .. } => Some(*state),
            _ => None,
        }
    }

    /// The fan-out list; empty unless client role.
    pub fn members(&self) -> &[ConnHandle] {
        match &self.kind {
            GroupKind::Client { members, .. } => members,
            _ => &[],
        }
    }

    /// Bound connection of a server record.
    pub fn bound_conn(&self) -> Option<ConnHandle> {
        match &self.kind {
            GroupKind::Server { conn, .. } => Some(*conn),
            _ => None,
        }
    }

    pub fn has_member(&self, conn: ConnHandle) -> bool {
        match &self.kind {
            GroupKind::Client { members, .. } => members.contains(&conn),
            GroupKind::Server { conn: bound, .. } => *bound == conn,
            GroupKind::Free => false,
        }
    }

    /// Idle means `Think` for a client and `AwaitRequest` for a server.
    pub fn is_idle(&self) -> bool {
        matches!(
            self.kind,
            GroupKind::Client {
                state: ClientState::Think,
                ..
            } | GroupKind::Server {
                state: ServerState::AwaitRequest,
                ..
            }
        )
    }

    pub fn is_hard_error(&self) -> bool {
        matches!(
            self.kind,
            GroupKind::Client {
                state: ClientState::HardError,
                ..
            } | GroupKind::Server {
                state: ServerState::HardError,
                ..
            }
        )
    }

    pub(crate) fn set_client_state(&mut self, new: ClientState) {
        if let GroupKind::Client { state, .. } = &mut self.kind {
            *state = new;
        }
    }

    pub(crate) fn set_server_state(&mut self, new: ServerState) {
        if let GroupKind::Server { state, .. } = &mut self.kind {
            *state = new;
        }
    }

    pub(crate) fn advance_seq(&mut self) {
        self.next_seq = self.next_seq.wrapping_add(1);
    }

    /// Append to the fan-out list, growing capacity by `increment` slots
    /// at a time.
    pub(crate) fn push_member(&mut self, conn: ConnHandle, increment: usize) {
        if let GroupKind::Client { members, .. } = &mut self.kind {
            if members.len() == members.capacity() {
                members.reserve_exact(increment.max(1));
            }
            members.push(conn);
        }
    }

    /// Remove from the fan-out list, keeping it dense and ordered.
    /// Returns whether `conn` was present.
    pub(crate) fn remove_member(&mut self, conn: ConnHandle) -> bool {
        if let GroupKind::Client { members, .. } = &mut self.kind {
            if let Some(pos) = members.iter().position(|m| *m == conn) {
                members.remove(pos);
                return true;
            }
        }
        false
    }

    pub(crate) fn member_capacity(&self) -> usize {
        match &self.kind {
            GroupKind::Client { members, .. } => members.capacity(),
            _ => 0,
        }
    }
}
