//! Multicast packet translation (server side).
//!
//! A packet sent to a group is addressed to the group handle and carries
//! the group's sequence number. Translation checks it against the server
//! record bound for that (client address, group) pair, decrypts it with
//! the group key, and rewrites the header so it reads as if it had
//! arrived on the bound connection. The group's own sequence number is
//! left alone; the receive path advances it together with the
//! connection's.
use mrpc_transport::{flags, ConnHandle, ConnState, GroupHandle, Packet, Role, ServerState};

use crate::crypto;
use crate::state::MulticastState;

/// Why an inbound packet was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Group-addressed packet with a zero remote handle or a non-zero
    /// local handle.
    BadHandles,
    NoSuchGroup,
    NoSuchConnection,
    /// The group or connection is not waiting for a request.
    NotAwaitingRequest,
    /// Sequence number neither the expected one nor a retry of the last.
    SequenceMismatch { expected: u32, got: u32 },
    /// Retry of a request still being processed.
    InProgress,
    /// Body could not be decoded.
    Malformed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Translation {
    /// Rewritten for this connection.
    Deliver(ConnHandle),
    /// Retry: already addressed to a connection.
    PassThrough,
    Drop(DropReason),
}

pub(crate) fn translate(state: &mut MulticastState, packet: &mut Packet) -> Translation {
    if packet.has_flag(flags::RETRY) {
        return Translation::PassThrough;
    }
    match rewrite(state, packet) {
        Ok(conn) => Translation::Deliver(conn),
        Err(reason) => {
            state.stats.bogus_packets.inc();
            tracing::debug!(
                "dropping multicast packet for mgrp 0x{:x} from {:?}: {reason:?}",
                packet.remote_handle(),
                packet.peer()
            );
            Translation::Drop(reason)
        }
    }
}

fn rewrite(state: &MulticastState, packet: &mut Packet) -> Result<ConnHandle, DropReason> {
    let group = packet.remote_handle();
    if group == 0 || packet.local_handle() != 0 {
        return Err(DropReason::BadHandles);
    }

    let slot = state
        .groups
        .lookup(packet.peer(), GroupHandle(group), Role::Server)
        .ok_or(DropReason::NoSuchGroup)?;
    let record = state.groups.get(slot);
    let conn_handle = record.bound_conn().ok_or(DropReason::NoSuchGroup)?;
    let conn = state
        .conns
        .get(conn_handle)
        .ok_or(DropReason::NoSuchConnection)?;
    debug_assert_eq!(conn.mgrp, Some(slot));

    if record.server_state() != Some(ServerState::AwaitRequest)
        || conn.state != ConnState::Server(ServerState::AwaitRequest)
    {
        return Err(DropReason::NotAwaitingRequest);
    }

    if packet.has_flag(flags::ENCRYPTED) {
        crypto::strip(packet, record.security());
    }

    let got = packet.seq_number();
    if got != record.next_seq() {
        return Err(DropReason::SequenceMismatch {
            expected: record.next_seq(),
            got,
        });
    }

    packet.set_remote_handle(conn.handle.0);
    packet.set_local_handle(conn.peer_handle);
    packet.set_seq_number(conn.next_seq);
    Ok(conn_handle)
}
