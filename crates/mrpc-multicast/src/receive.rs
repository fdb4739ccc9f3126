//! Server receive path shared by unicast and multicast requests.
//!
//! Multicast packets are translated first; after that every request goes
//! through the same connection lookup, sequence check and state advance.
//! That advance is the only place a server group's sequence number moves.
use std::net::SocketAddr;

use mrpc_transport::{
    flags, opcode, ConnHandle, ConnState, Connection, Packet, PacketHeader, Role, ServerState,
};

use crate::crypto;
use crate::handshake;
use crate::side_effect::SideEffectRegistry;
use crate::state::MulticastState;
use crate::translate::{translate, DropReason, Translation};
use crate::MulticastError;

/// What became of an inbound packet.
#[derive(Debug)]
pub enum Inbound {
    /// A new request for the application, to be answered with
    /// [`Endpoint::reply`](crate::Endpoint::reply).
    Request(Request),
    /// Answered without the application: a handshake, or a retry of a
    /// request whose reply is held.
    Replied {
        to: Option<SocketAddr>,
        packet: Packet,
    },
    Dropped(DropReason),
}

/// An accepted request. Multicast requests arrive already rewritten for
/// the connection they were delivered on.
#[derive(Debug, Clone)]
pub struct Request {
    pub(crate) conn: ConnHandle,
    pub(crate) packet: Packet,
}

impl Request {
    pub fn conn(&self) -> ConnHandle {
        self.conn
    }

    pub fn opcode(&self) -> i32 {
        self.packet.opcode()
    }

    pub fn body(&self) -> &[u8] {
        self.packet.body()
    }

    pub fn seq_number(&self) -> u32 {
        self.packet.seq_number()
    }

    /// Whether the request reached this connection through its group.
    pub fn is_multicast(&self) -> bool {
        self.packet.has_flag(flags::MULTICAST)
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }
}

pub(crate) fn receive(
    state: &mut MulticastState,
    side_effects: &SideEffectRegistry,
    proto_version: u32,
    mut packet: Packet,
) -> Inbound {
    if packet.has_flag(flags::MULTICAST) && !packet.has_flag(flags::RETRY) {
        match translate(state, &mut packet) {
            Translation::Deliver(conn) => tracing::trace!("group packet rewritten for {conn}"),
            Translation::PassThrough => {}
            Translation::Drop(reason) => return Inbound::Dropped(reason),
        }
    }

    match accept(state, side_effects, proto_version, packet) {
        Ok(inbound) => inbound,
        Err(reason) => {
            state.stats.bogus_packets.inc();
            tracing::debug!("dropping packet: {reason:?}");
            Inbound::Dropped(reason)
        }
    }
}

fn accept(
    state: &mut MulticastState,
    side_effects: &SideEffectRegistry,
    proto_version: u32,
    mut packet: Packet,
) -> Result<Inbound, DropReason> {
    let handle = ConnHandle(packet.remote_handle());
    let conn = state
        .conns
        .get(handle)
        .filter(|c| c.role() == Role::Server)
        .ok_or(DropReason::NoSuchConnection)?;

    if packet.has_flag(flags::ENCRYPTED) {
        crypto::strip(&mut packet, &conn.security);
    }

    let seq = packet.seq_number();
    let to = conn.peer_addr.or(packet.peer());
    if seq != conn.next_seq {
        if seq == conn.next_seq.wrapping_sub(1) && packet.has_flag(flags::RETRY) {
            let held = conn.held_reply.clone().ok_or(DropReason::InProgress)?;
            tracing::debug!("{handle}: retransmitting reply for seq {seq}");
            return Ok(Inbound::Replied { to, packet: held });
        }
        return Err(DropReason::SequenceMismatch {
            expected: conn.next_seq,
            got: seq,
        });
    }
    if conn.state != ConnState::Server(ServerState::AwaitRequest) {
        return Err(DropReason::NotAwaitingRequest);
    }

    if packet.opcode() == opcode::INIT_MULTICAST {
        let reply =
            handshake::handle_init_multicast(state, side_effects, proto_version, &packet, handle)?;
        return Ok(Inbound::Replied { to, packet: reply });
    }

    advance(state, handle, packet.has_flag(flags::MULTICAST));
    state.stats.requests.inc();
    Ok(Inbound::Request(Request {
        conn: handle,
        packet,
    }))
}

/// Move the connection (and, for multicast requests, its server group)
/// on to the next sequence number and into `Process`.
fn advance(state: &mut MulticastState, handle: ConnHandle, multicast: bool) {
    let Some(conn) = state.conns.get_mut(handle) else {
        return;
    };
    conn.advance_seq();
    conn.state = ConnState::Server(ServerState::Process);
    conn.held_reply = None;

    if let (true, Some(slot)) = (multicast, conn.mgrp) {
        let record = state.groups.get_mut(slot);
        if record.role() == Some(Role::Server) {
            record.advance_seq();
            record.set_server_state(ServerState::Process);
        }
    }
}

/// Answer `request`: back to `AwaitRequest`, reply held for retries.
pub(crate) fn reply(
    state: &mut MulticastState,
    proto_version: u32,
    request: &Request,
    code: i32,
    body: &[u8],
) -> Result<(Option<SocketAddr>, Packet), MulticastError> {
    let conn = state
        .conns
        .get_mut(request.conn)
        .ok_or(MulticastError::NoSuchConnection(request.conn))?;
    if conn.state.is_hard_error() {
        return Err(MulticastError::HardError(request.conn.to_string()));
    }

    let packet = build_reply(
        conn,
        proto_version,
        request.packet.seq_number(),
        code,
        request.packet.timestamp(),
        body,
    );
    conn.state = ConnState::Server(ServerState::AwaitRequest);
    conn.held_reply = Some(packet.clone());
    let to = conn.peer_addr.or(request.packet.peer());

    state.set_bound_server_state(request.conn, ServerState::AwaitRequest);
    Ok((to, packet))
}

pub(crate) fn build_reply(
    conn: &Connection,
    proto_version: u32,
    seq: u32,
    code: i32,
    timestamp: u32,
    body: &[u8],
) -> Packet {
    let header = PacketHeader {
        proto_version,
        remote_handle: conn.peer_handle,
        local_handle: conn.handle.0,
        seq_number: seq,
        opcode: opcode::REPLY,
        subsys_id: conn.subsys_id,
        return_code: code,
        timestamp,
        ..PacketHeader::default()
    };
    let mut packet = Packet::new(&header, body);
    crypto::apply(&mut packet, &conn.security);
    packet
}
