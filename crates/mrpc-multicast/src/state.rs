//! State shared by every operation of an endpoint.
//!
//! One `MulticastState` sits behind the endpoint's mutex. Helpers here
//! are synchronous and leave the tables consistent when they return, so
//! the lock can be dropped at any await point.
use std::sync::Arc;

use mrpc_transport::{
    ClientState, ConnHandle, ConnState, ConnectionTable, GroupSlot, Role, ServerState,
};

use crate::group::GroupTable;
use crate::side_effect::SideEffectRegistry;
use crate::waiters::{WaitKey, WaitQueues};
use crate::MulticastStats;

#[derive(Debug)]
pub(crate) struct MulticastState {
    pub(crate) groups: GroupTable,
    pub(crate) conns: ConnectionTable,
    pub(crate) waiters: WaitQueues,
    pub(crate) stats: Arc<MulticastStats>,
}

impl MulticastState {
    pub(crate) fn new(stats: Arc<MulticastStats>) -> Self {
        Self {
            groups: GroupTable::new(stats.clone()),
            conns: ConnectionTable::new(),
            waiters: WaitQueues::default(),
            stats,
        }
    }

    // ── Busy locks ───────────────────────────────────────────────────────

    /// Return a connection to idle (unless it broke meanwhile) and wake
    /// its waiters.
    pub(crate) fn release_conn(&mut self, handle: ConnHandle) {
        if let Some(conn) = self.conns.get_mut(handle) {
            if !conn.state.is_hard_error() {
                conn.state = ConnState::idle(conn.role());
            }
        }
        self.waiters.wake_all(WaitKey::Connection(handle));
    }

    /// Return a client group to `Think` (unless it broke meanwhile) and
    /// wake its waiters.
    pub(crate) fn release_group(&mut self, slot: GroupSlot) {
        let record = self.groups.get_mut(slot);
        if record.client_state() == Some(ClientState::AwaitReply) {
            record.set_client_state(ClientState::Think);
        }
        self.waiters.wake_all(WaitKey::Group(slot));
    }

    pub(crate) fn set_conn_error(&mut self, handle: ConnHandle) {
        if let Some(conn) = self.conns.get_mut(handle) {
            tracing::warn!("{handle} entering hard error");
            conn.state = conn.state.hard_error();
        }
        self.waiters.wake_all(WaitKey::Connection(handle));
    }

    // ── Group membership ─────────────────────────────────────────────────

    /// Delete a group: run its delete hook, free the record, wake waiters.
    /// Busy groups are deleted too.
    pub(crate) fn delete_group(&mut self, slot: GroupSlot, side_effects: &SideEffectRegistry) {
        let record = self.groups.get(slot);
        let handle = record.handle();
        if !record.is_idle() && !record.is_hard_error() {
            tracing::warn!("deleting busy {handle}");
        }

        if let Some(hooks) = side_effects.hooks(record.side_effect()) {
            let role = record.role().unwrap_or(Role::Client);
            if let Err(e) = hooks.on_delete_group(handle, record.client_addr(), role) {
                tracing::debug!("delete hook for {handle} failed: {e:?}");
            }
        }

        self.groups.free(slot, &mut self.conns);
        self.waiters.wake_all(WaitKey::Group(slot));
        tracing::info!("deleted {handle}");
    }

    /// Take `conn` out of its group, if any. A client group keeps going
    /// without it; a server group exists only for its connection and is
    /// deleted.
    pub(crate) fn detach(&mut self, conn: ConnHandle, side_effects: &SideEffectRegistry) {
        let Some(slot) = self.conns.get(conn).and_then(|c| c.mgrp) else {
            return;
        };
        let role = self.groups.get(slot).role();
        match role {
            Some(Role::Server) => self.delete_group(slot, side_effects),
            Some(Role::Client) => {
                let record = self.groups.get_mut(slot);
                let handle = record.handle();
                if !record.is_idle() && !record.is_hard_error() {
                    tracing::warn!("removing {conn} from busy {handle}");
                }
                let removed = record.remove_member(conn);
                assert!(removed, "{conn} points at {handle} but is not on its list");
                if let Some(c) = self.conns.get_mut(conn) {
                    c.mgrp = None;
                }
                tracing::debug!("removed {conn} from {handle}");
            }
            None => panic!("{conn} points at free record {slot:?}"),
        }
    }

    /// Put the server group bound to `conn` (if any) in `state`.
    pub(crate) fn set_bound_server_state(&mut self, conn: ConnHandle, state: ServerState) {
        let Some(slot) = self.conns.get(conn).and_then(|c| c.mgrp) else {
            return;
        };
        self.groups.get_mut(slot).set_server_state(state);
    }
}
