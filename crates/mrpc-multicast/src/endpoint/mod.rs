//! The async face of the multicast layer.
//!
//! An [`Endpoint`] owns the group and connection tables of one RPC
//! endpoint, the side-effect registry and the reliable sender. All table
//! access happens under a single mutex that is never held across an
//! await; operations suspend only while the sender works or while they
//! wait for a busy group or connection to come free.
mod client;
mod config;
mod transport;

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use mrpc_transport::{ConnHandle, Connection, ConnectionParams, GroupHandle, Packet, Role};

use crate::group::GroupRecord;
use crate::receive::{self, Inbound, Request};
use crate::side_effect::SideEffectRegistry;
use crate::state::MulticastState;
use crate::waiters::WaitKey;
use crate::{MulticastError, MulticastStats};

pub use client::{GroupSpec, McastHost, MemberOutcome, SendGuard};
pub use config::{EndpointConfig, DEFAULT_FANOUT_INCREMENT};
pub use transport::{ReliableSender, SendOutcome};

#[cfg(test)]
pub use transport::mock;

/// One step of a busy-lock loop.
enum Acquire<T> {
    /// Lookups passed and the objects are locked.
    Ready(T),
    /// Something was busy; retry once this fires.
    Wait(oneshot::Receiver<()>),
}

pub struct Endpoint<S> {
    state: Mutex<MulticastState>,
    side_effects: SideEffectRegistry,
    stats: Arc<MulticastStats>,
    sender: S,
    config: EndpointConfig,
}

impl<S: ReliableSender> Endpoint<S> {
    pub fn new(sender: S, config: EndpointConfig) -> Self {
        Self::with_side_effects(sender, SideEffectRegistry::new(), config)
    }

    pub fn with_side_effects(
        sender: S,
        side_effects: SideEffectRegistry,
        config: EndpointConfig,
    ) -> Self {
        let stats = Arc::new(MulticastStats::default());
        Self {
            state: Mutex::new(MulticastState::new(stats.clone())),
            side_effects,
            stats,
            sender,
            config,
        }
    }

    pub fn sender(&self) -> &S {
        &self.sender
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn stats(&self) -> &MulticastStats {
        &self.stats
    }

    /// Run `step` under the lock until it stops asking to wait.
    async fn acquire<T, F>(&self, mut step: F) -> Result<T, MulticastError>
    where
        F: FnMut(&mut MulticastState) -> Result<Acquire<T>, MulticastError>,
    {
        loop {
            let next = {
                let mut guard = self.state.lock();
                step(&mut *guard)?
            };
            match next {
                Acquire::Ready(value) => return Ok(value),
                Acquire::Wait(woken) => {
                    // A dropped sender also means "look again".
                    let _ = woken.await;
                }
            }
        }
    }

    // ── Connections ──────────────────────────────────────────────────────

    /// Register a connection whose bind has completed.
    pub fn open_connection(&self, params: ConnectionParams) -> Result<ConnHandle, MulticastError> {
        self.side_effects.lookup(params.side_effect)?;
        Ok(self.state.lock().conns.open(params))
    }

    /// Record the peer's handle once the bind exchange has produced it.
    pub fn set_peer_handle(&self, conn: ConnHandle, peer_handle: u32) -> Result<(), MulticastError> {
        let mut st = self.state.lock();
        let c = st
            .conns
            .get_mut(conn)
            .ok_or(MulticastError::NoSuchConnection(conn))?;
        c.peer_handle = peer_handle;
        Ok(())
    }

    /// Put a connection in hard error. Anyone waiting on it wakes up and
    /// sees the failure.
    pub fn set_connection_error(&self, conn: ConnHandle) -> Result<(), MulticastError> {
        let mut st = self.state.lock();
        if st.conns.get(conn).is_none() {
            return Err(MulticastError::NoSuchConnection(conn));
        }
        st.set_conn_error(conn);
        Ok(())
    }

    /// Tear a connection down, taking it out of its group first.
    pub fn destroy_connection(&self, conn: ConnHandle) -> Result<(), MulticastError> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if st.conns.get(conn).is_none() {
            return Err(MulticastError::NoSuchConnection(conn));
        }
        st.detach(conn, &self.side_effects);
        st.conns.remove(conn);
        st.waiters.wake_all(WaitKey::Connection(conn));
        Ok(())
    }

    // ── Server receive path ──────────────────────────────────────────────

    /// Feed an inbound packet through translation and the shared receive
    /// path. Handshake replies and retransmissions are sent from here.
    pub async fn receive(&self, packet: Packet) -> Inbound {
        let inbound = {
            let mut guard = self.state.lock();
            receive::receive(
                &mut guard,
                &self.side_effects,
                self.config.protocol_version(),
                packet,
            )
        };
        if let Inbound::Replied { to, packet } = &inbound {
            self.sender.transmit(*to, packet.clone()).await;
        }
        inbound
    }

    /// Answer an accepted request. Returns the reply as sent.
    pub async fn reply(
        &self,
        request: &Request,
        code: i32,
        body: &[u8],
    ) -> Result<Packet, MulticastError> {
        self.config.transport.check_body_len(body.len())?;
        let (to, packet) = {
            let mut guard = self.state.lock();
            receive::reply(
                &mut guard,
                self.config.protocol_version(),
                request,
                code,
                body,
            )?
        };
        self.sender.transmit(to, packet.clone()).await;
        Ok(packet)
    }

    // ── Inspection ───────────────────────────────────────────────────────

    pub fn connection(&self, conn: ConnHandle) -> Option<Connection> {
        self.state.lock().conns.get(conn).cloned()
    }

    /// Snapshot of a group this endpoint created.
    pub fn group(&self, handle: GroupHandle) -> Option<GroupRecord> {
        let st = self.state.lock();
        st.groups
            .lookup(None, handle, Role::Client)
            .map(|slot| st.groups.get(slot).clone())
    }

    /// Snapshot of the server group a client at `client_addr` bound here.
    pub fn server_group(
        &self,
        client_addr: Option<SocketAddr>,
        handle: GroupHandle,
    ) -> Option<GroupRecord> {
        let st = self.state.lock();
        st.groups
            .lookup(client_addr, handle, Role::Server)
            .map(|slot| st.groups.get(slot).clone())
    }

    /// Snapshot of the group `conn` belongs to.
    pub fn group_of(&self, conn: ConnHandle) -> Option<GroupRecord> {
        let st = self.state.lock();
        let slot = st.conns.get(conn)?.mgrp?;
        Some(st.groups.get(slot).clone())
    }

    pub fn groups_in_use(&self) -> usize {
        self.state.lock().groups.in_use()
    }

    /// Check that group and connection cross-references agree.
    pub fn verify_links(&self) -> Result<(), String> {
        let st = self.state.lock();
        st.groups.verify_links(&st.conns)
    }
}
