//! Server side of `InitMulticast`: bind a connection to a server group.
use mrpc_transport::{
    codes, ConnHandle, InitMulticastBody, Packet, Role, SecurityParams,
};

use crate::group::GroupKind;
use crate::receive::build_reply;
use crate::side_effect::SideEffectRegistry;
use crate::state::MulticastState;
use crate::translate::DropReason;

/// Process an `InitMulticast` request that passed sequence checks on
/// `conn_handle`, and return the reply to send. The reply is also held on
/// the connection for retransmission.
///
/// Any earlier binding of this connection is dropped, and so is any other
/// connection's binding for the same (client address, group) pair. A
/// failing init hook unbinds the new group again; its code is the reply's
/// return code.
pub(crate) fn handle_init_multicast(
    state: &mut MulticastState,
    side_effects: &SideEffectRegistry,
    proto_version: u32,
    request: &Packet,
    conn_handle: ConnHandle,
) -> Result<Packet, DropReason> {
    let body = InitMulticastBody::decode(request.body()).map_err(|e| {
        tracing::debug!("bad InitMulticast on {conn_handle}: {e}");
        DropReason::Malformed
    })?;

    let conn = state
        .conns
        .get_mut(conn_handle)
        .ok_or(DropReason::NoSuchConnection)?;
    conn.held_reply = None;
    conn.advance_seq();
    // Group packets are matched on their sender address, so the record
    // is keyed the same way.
    let client_addr = request.peer().or(conn.peer_addr);
    let subsys_id = conn.subsys_id;
    let conn_security = conn.security;
    let side_effect = conn.side_effect;

    state.stats.requests.inc();
    state.stats.handshakes.inc();

    state.detach(conn_handle, side_effects);
    if let Some(previous) = state.groups.lookup(client_addr, body.group, Role::Server) {
        tracing::debug!("{conn_handle} takes over {} from another connection", body.group);
        state.delete_group(previous, side_effects);
    }

    let slot = state.groups.allocate(
        client_addr,
        Some(body.group),
        GroupKind::new_server(conn_handle),
    );
    let record = state.groups.get_mut(slot);
    record.subsys_id = subsys_id;
    record.security = SecurityParams {
        key: body.session_key,
        ..conn_security
    };
    record.next_seq = body.initial_seq;
    record.side_effect = side_effect;
    if let Some(conn) = state.conns.get_mut(conn_handle) {
        conn.mgrp = Some(slot);
    }

    let mut code = codes::SUCCESS;
    if let Some(hooks) = side_effects.hooks(side_effect) {
        if let Err(e) = hooks.on_init_multicast(body.group, conn_handle, request) {
            tracing::debug!("init hook refused {} on {conn_handle}: {e:?}", body.group);
            code = e.code();
            state.groups.free(slot, &mut state.conns);
        }
    }
    if code == codes::SUCCESS {
        tracing::info!(
            "{conn_handle} joined {} at seq {}",
            body.group,
            body.initial_seq
        );
    }

    let conn = state
        .conns
        .get_mut(conn_handle)
        .ok_or(DropReason::NoSuchConnection)?;
    let reply = build_reply(
        conn,
        proto_version,
        conn.next_seq.wrapping_sub(1),
        code,
        request.timestamp(),
        &[],
    );
    conn.held_reply = Some(reply.clone());
    Ok(reply)
}
