//! Client-side group operations.
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};

use futures_util::future::join_all;

use mrpc_transport::{
    codes, flags, opcode, ClientState, ConnHandle, EncryptionType, GroupHandle, GroupSlot,
    InitMulticastBody, Packet, PacketHeader, Role, SecurityLevel, SecurityParams, SessionKey,
    SideEffectType,
};

use super::{Acquire, Endpoint, ReliableSender, SendOutcome};
use crate::crypto;
use crate::group::GroupKind;
use crate::state::MulticastState;
use crate::waiters::WaitKey;
use crate::MulticastError;

/// Where a new group's packets go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum McastHost {
    /// Resolved through the system resolver.
    ByName(String),
    ByAddr(IpAddr),
    BySocketAddr(SocketAddr),
    /// No group address; members are reached only through fan-out.
    Dummy,
}

/// Parameters for [`Endpoint::create_group`].
#[derive(Debug, Clone)]
pub struct GroupSpec {
    host: McastHost,
    port: u16,
    subsys_id: u32,
    level: SecurityLevel,
    key: SessionKey,
    encryption: EncryptionType,
    side_effect: SideEffectType,
}

impl GroupSpec {
    pub fn new(host: McastHost, port: u16) -> Self {
        Self {
            host,
            port,
            subsys_id: 0,
            level: SecurityLevel::Open,
            key: SessionKey::zeroed(),
            encryption: EncryptionType::NONE,
            side_effect: 0,
        }
    }

    pub fn subsys_id(mut self, subsys_id: u32) -> Self {
        self.subsys_id = subsys_id;
        self
    }

    pub fn security(
        mut self,
        level: SecurityLevel,
        key: SessionKey,
        encryption: EncryptionType,
    ) -> Self {
        self.level = level;
        self.key = key;
        self.encryption = encryption;
        self
    }

    pub fn side_effect(mut self, tag: SideEffectType) -> Self {
        self.side_effect = tag;
        self
    }
}

/// Per-member result of [`Endpoint::multicast`].
#[derive(Debug)]
pub struct MemberOutcome {
    pub conn: ConnHandle,
    pub result: Result<Packet, MulticastError>,
}

/// A group locked for sending by [`Endpoint::prepare_send`].
///
/// Dropping the guard without calling [`complete`](Self::complete)
/// releases the group with its sequence number unchanged.
pub struct SendGuard<'a, S> {
    endpoint: &'a Endpoint<S>,
    slot: GroupSlot,
    group: GroupHandle,
    released: bool,
}

impl<S> std::fmt::Debug for SendGuard<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendGuard")
            .field("group", &self.group)
            .field("released", &self.released)
            .finish()
    }
}

impl<S> SendGuard<'_, S> {
    pub fn group(&self) -> GroupHandle {
        self.group
    }

    /// The multicast went out to `recipients`: advance the group's
    /// sequence number and each recipient's, then release the group.
    pub fn complete(self, recipients: &[ConnHandle]) {
        let endpoint = self.endpoint;
        let mut guard = endpoint.state.lock();
        self.finish(&mut guard, recipients);
    }

    fn finish(mut self, st: &mut MulticastState, recipients: &[ConnHandle]) {
        let record = st.groups.get_mut(self.slot);
        record.advance_seq();
        record.current_packet = None;
        for &conn in recipients.iter().filter(|h| !h.is_none()) {
            if let Some(c) = st.conns.get_mut(conn) {
                c.advance_seq();
            }
        }
        st.release_group(self.slot);
        self.released = true;
    }
}

impl<S> Drop for SendGuard<'_, S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let mut st = self.endpoint.state.lock();
        st.groups.get_mut(self.slot).current_packet = None;
        st.release_group(self.slot);
    }
}

async fn resolve(host: &McastHost, port: u16) -> Result<Option<SocketAddr>, MulticastError> {
    match host {
        McastHost::Dummy => Ok(None),
        McastHost::BySocketAddr(addr) => Ok(Some(*addr)),
        McastHost::ByAddr(ip) => Ok(Some(SocketAddr::new(*ip, port))),
        McastHost::ByName(name) => {
            let mut addrs = tokio::net::lookup_host((name.as_str(), port))
                .await
                .map_err(|e| MulticastError::AddressResolution(format!("{name}: {e}")))?;
            addrs
                .next()
                .map(Some)
                .ok_or_else(|| MulticastError::AddressResolution(format!("{name}: no addresses")))
        }
    }
}

impl<S: ReliableSender> Endpoint<S> {
    // ── Group lifecycle ──────────────────────────────────────────────────

    /// Create a client group with no members.
    pub async fn create_group(&self, spec: GroupSpec) -> Result<GroupHandle, MulticastError> {
        let security = SecurityParams::new(spec.level, spec.key, spec.encryption).map_err(|_| {
            MulticastError::InvalidSecurityParameters {
                level: spec.level,
                encryption: spec.encryption,
            }
        })?;
        let mcast_addr = resolve(&spec.host, spec.port).await?;

        let mut guard = self.state.lock();
        let st = &mut *guard;
        let slot = st.groups.allocate(None, None, GroupKind::new_client());
        let record = st.groups.get_mut(slot);
        record.mcast_addr = mcast_addr;
        record.subsys_id = spec.subsys_id;
        record.security = security;
        record.side_effect = spec.side_effect;
        let handle = record.handle();

        let hooks = match self.side_effects.lookup(spec.side_effect) {
            Ok(hooks) => hooks,
            Err(e) => {
                st.groups.free(slot, &mut st.conns);
                return Err(e);
            }
        };
        if let Some(hooks) = hooks {
            if let Err(e) = hooks.on_create_group(handle) {
                st.groups.free(slot, &mut st.conns);
                return Err(e.into());
            }
        }

        tracing::info!(
            "created {handle} (subsys {}, {:?}, addr {mcast_addr:?})",
            spec.subsys_id,
            spec.level
        );
        Ok(handle)
    }

    /// Delete a client group, waiting until it is idle. Members are
    /// detached; their connections stay open.
    pub async fn delete_group(&self, group: GroupHandle) -> Result<(), MulticastError> {
        self.acquire(|st| {
            let slot = client_group(st, group)?;
            if !st.groups.get(slot).is_idle() {
                return Ok(Acquire::Wait(st.waiters.enqueue(WaitKey::Group(slot))));
            }
            st.delete_group(slot, &self.side_effects);
            Ok(Acquire::Ready(()))
        })
        .await
    }

    // ── Membership ───────────────────────────────────────────────────────

    /// Bind `conn` to `group` on the server side and, once the server
    /// accepts, append it to the fan-out list.
    ///
    /// Waits while the group or the connection is busy.
    pub async fn add_member(&self, group: GroupHandle, conn: ConnHandle) -> Result<(), MulticastError> {
        let (slot, peer, request) = self
            .acquire(|st| self.begin_add_member(st, group, conn))
            .await?;

        tracing::debug!("sending InitMulticast for {group} on {conn}");
        let outcome = self.sender.send_reliably(peer, conn, request).await;

        let mut guard = self.state.lock();
        self.finish_add_member(&mut guard, slot, group, conn, outcome)
    }

    fn begin_add_member(
        &self,
        st: &mut MulticastState,
        group: GroupHandle,
        conn: ConnHandle,
    ) -> Result<Acquire<(GroupSlot, Option<SocketAddr>, Packet)>, MulticastError> {
        let slot = client_group(st, group)?;
        let record = st.groups.get(slot);
        if !record.is_idle() {
            return Ok(Acquire::Wait(st.waiters.enqueue(WaitKey::Group(slot))));
        }

        let c = st
            .conns
            .get(conn)
            .ok_or(MulticastError::NoSuchConnection(conn))?;
        if c.role() != Role::Client {
            return Err(MulticastError::IncompatibleGroup {
                reason: "not a client connection",
            });
        }
        if c.state.is_hard_error() {
            return Err(MulticastError::HardError(conn.to_string()));
        }
        if !c.state.is_idle() {
            return Ok(Acquire::Wait(st.waiters.enqueue(WaitKey::Connection(conn))));
        }
        match c.mgrp {
            Some(existing) if existing == slot => {
                return Err(MulticastError::DuplicateMember { group, conn });
            }
            Some(_) => {
                return Err(MulticastError::IncompatibleGroup {
                    reason: "connection belongs to another group",
                });
            }
            None => {}
        }
        if c.subsys_id != record.subsys_id() {
            return Err(MulticastError::IncompatibleGroup {
                reason: "subsystem differs",
            });
        }
        if !c.security.compatible_with(record.security()) {
            return Err(MulticastError::IncompatibleGroup {
                reason: "security parameters differ",
            });
        }
        if c.side_effect != record.side_effect() {
            return Err(MulticastError::IncompatibleGroup {
                reason: "side-effect type differs",
            });
        }

        let body = InitMulticastBody {
            group,
            initial_seq: record.next_seq(),
            session_key: record.security().key,
        };
        let header = c.request_header(self.config.protocol_version(), opcode::INIT_MULTICAST);
        let mut request = Packet::new(&header, &body.encode());
        let conn_security = c.security;
        let peer = c.peer_addr;
        let side_effect = record.side_effect();

        st.groups
            .get_mut(slot)
            .set_client_state(ClientState::AwaitReply);
        if let Some(c) = st.conns.get_mut(conn) {
            c.state = c.state.busy();
        }

        if let Some(hooks) = self.side_effects.hooks(side_effect) {
            if let Err(e) = hooks.on_add_member(group, conn, &mut request) {
                if e.is_soft() {
                    st.release_conn(conn);
                } else {
                    st.set_conn_error(conn);
                }
                st.release_group(slot);
                return Err(e.into());
            }
        }

        crypto::apply(&mut request, &conn_security);
        Ok(Acquire::Ready((slot, peer, request)))
    }

    fn finish_add_member(
        &self,
        st: &mut MulticastState,
        slot: GroupSlot,
        group: GroupHandle,
        conn: ConnHandle,
        outcome: SendOutcome,
    ) -> Result<(), MulticastError> {
        let Some(conn_security) = st.conns.get(conn).map(|c| c.security) else {
            st.release_group(slot);
            return Err(MulticastError::NoSuchConnection(conn));
        };

        let mut reply = match outcome {
            SendOutcome::Arrived(reply) => reply,
            SendOutcome::Naked => {
                st.set_conn_error(conn);
                st.release_group(slot);
                return Err(MulticastError::Naked);
            }
            SendOutcome::Timeout => {
                st.set_conn_error(conn);
                st.release_group(slot);
                return Err(MulticastError::Dead);
            }
        };
        if reply.has_flag(flags::ENCRYPTED) {
            crypto::strip(&mut reply, &conn_security);
        }
        if let Some(c) = st.conns.get_mut(conn) {
            c.advance_seq();
        }

        let code = reply.return_code();
        if code != codes::SUCCESS {
            tracing::debug!("server refused {conn} for {group}: code {code}");
            st.release_conn(conn);
            st.release_group(slot);
            return Err(MulticastError::Rejected { code });
        }

        st.groups
            .get_mut(slot)
            .push_member(conn, self.config.fanout_increment);
        if let Some(c) = st.conns.get_mut(conn) {
            c.mgrp = Some(slot);
        }
        st.release_conn(conn);
        st.release_group(slot);
        tracing::info!("{conn} joined {group}");
        Ok(())
    }

    /// Take `conn` out of `group`. A group busy with an unrelated send
    /// does not hold this up.
    pub async fn remove_member(
        &self,
        group: GroupHandle,
        conn: ConnHandle,
    ) -> Result<(), MulticastError> {
        self.acquire(|st| {
            let slot = client_group(st, group)?;
            let c = st
                .conns
                .get(conn)
                .ok_or(MulticastError::NoSuchConnection(conn))?;
            if c.state.is_hard_error() {
                return Err(MulticastError::HardError(conn.to_string()));
            }
            if !c.state.is_idle() {
                return Ok(Acquire::Wait(st.waiters.enqueue(WaitKey::Connection(conn))));
            }
            if c.mgrp != Some(slot) {
                return Err(MulticastError::NotGroupMember { group, conn });
            }
            st.detach(conn, &self.side_effects);
            Ok(Acquire::Ready(()))
        })
        .await
    }

    // ── Sending ──────────────────────────────────────────────────────────

    /// Lock `group` for a multicast and check the recipient list.
    ///
    /// With `expand`, `recipients` must be exactly as long as the member
    /// list and is filled with the members in join order. Otherwise its
    /// non-empty entries must name every member exactly once.
    pub async fn prepare_send(
        &self,
        group: GroupHandle,
        expand: bool,
        recipients: &mut [ConnHandle],
    ) -> Result<SendGuard<'_, S>, MulticastError> {
        let slot = self
            .acquire(|st| {
                let slot = client_group(st, group)?;
                let record = st.groups.get(slot);
                if !record.is_idle() {
                    return Ok(Acquire::Wait(st.waiters.enqueue(WaitKey::Group(slot))));
                }

                let members = record.members();
                if members.is_empty() {
                    return Err(MulticastError::IncompatibleGroup {
                        reason: "group has no members",
                    });
                }
                if expand {
                    if recipients.len() != members.len() {
                        return Err(MulticastError::IncompatibleGroup {
                            reason: "recipient list does not match member count",
                        });
                    }
                    recipients.copy_from_slice(members);
                } else {
                    let mut listed = HashSet::new();
                    for &conn in recipients.iter().filter(|h| !h.is_none()) {
                        match st.conns.get(conn) {
                            Some(c) if c.mgrp == Some(slot) => {
                                if !listed.insert(conn) {
                                    return Err(MulticastError::IncompatibleGroup {
                                        reason: "recipient listed twice",
                                    });
                                }
                            }
                            _ => {
                                return Err(MulticastError::IncompatibleGroup {
                                    reason: "recipient is not a member",
                                })
                            }
                        }
                    }
                    if listed.len() != members.len() {
                        return Err(MulticastError::IncompatibleGroup {
                            reason: "recipient list does not match member count",
                        });
                    }
                }

                st.groups
                    .get_mut(slot)
                    .set_client_state(ClientState::AwaitReply);
                Ok(Acquire::Ready(slot))
            })
            .await?;

        Ok(SendGuard {
            endpoint: self,
            slot,
            group,
            released: false,
        })
    }

    /// Send one request to every member of `group` and collect the
    /// replies. Members that cannot be reached are put in hard error; the
    /// others move on to their next sequence number together with the
    /// group.
    pub async fn multicast(
        &self,
        group: GroupHandle,
        opcode: i32,
        body: &[u8],
        expand: bool,
        recipients: &mut [ConnHandle],
    ) -> Result<Vec<MemberOutcome>, MulticastError> {
        self.config.transport.check_body_len(body.len())?;
        let send = self.prepare_send(group, expand, recipients).await?;
        let targets: Vec<ConnHandle> = recipients
            .iter()
            .copied()
            .filter(|h| !h.is_none())
            .collect();

        let mut results: HashMap<ConnHandle, Result<Packet, MulticastError>> = HashMap::new();
        let mut locked = Vec::with_capacity(targets.len());
        for &conn in &targets {
            let lock = self
                .acquire(|st| {
                    let c = st
                        .conns
                        .get(conn)
                        .ok_or(MulticastError::NoSuchConnection(conn))?;
                    if c.state.is_hard_error() {
                        return Err(MulticastError::HardError(conn.to_string()));
                    }
                    if !c.state.is_idle() {
                        return Ok(Acquire::Wait(st.waiters.enqueue(WaitKey::Connection(conn))));
                    }
                    let target = (conn, c.peer_addr, c.security);
                    if let Some(c) = st.conns.get_mut(conn) {
                        c.state = c.state.busy();
                    }
                    Ok(Acquire::Ready(target))
                })
                .await;
            match lock {
                Ok(target) => locked.push(target),
                Err(e) => {
                    results.insert(conn, Err(e));
                }
            }
        }

        let packet = {
            let mut st = self.state.lock();
            let record = st.groups.get_mut(send.slot);
            let header = PacketHeader {
                proto_version: self.config.protocol_version(),
                remote_handle: group.0,
                local_handle: 0,
                flags: flags::MULTICAST,
                seq_number: record.next_seq(),
                opcode,
                subsys_id: record.subsys_id(),
                ..PacketHeader::default()
            };
            let mut packet = Packet::new(&header, body);
            crypto::apply(&mut packet, record.security());
            record.current_packet = Some(packet.clone());
            packet
        };
        tracing::debug!(
            "multicasting opcode {opcode} on {group} to {} members",
            locked.len()
        );

        let outcomes = join_all(
            locked
                .iter()
                .map(|(conn, peer, _)| self.sender.send_reliably(*peer, *conn, packet.clone())),
        )
        .await;

        {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            for ((conn, _, security), outcome) in locked.iter().zip(outcomes) {
                let result = match outcome {
                    SendOutcome::Arrived(mut reply) => {
                        if reply.has_flag(flags::ENCRYPTED) {
                            crypto::strip(&mut reply, security);
                        }
                        Ok(reply)
                    }
                    SendOutcome::Naked => {
                        st.set_conn_error(*conn);
                        Err(MulticastError::Naked)
                    }
                    SendOutcome::Timeout => {
                        st.set_conn_error(*conn);
                        Err(MulticastError::Dead)
                    }
                };
                results.insert(*conn, result);
            }

            let sent_to: Vec<ConnHandle> = locked.iter().map(|(conn, _, _)| *conn).collect();
            send.finish(st, &sent_to);
            for conn in sent_to {
                st.release_conn(conn);
            }
        }

        Ok(targets
            .into_iter()
            .filter_map(|conn| {
                results
                    .remove(&conn)
                    .map(|result| MemberOutcome { conn, result })
            })
            .collect())
    }

    /// Plain request/reply on one client connection.
    pub async fn call(
        &self,
        conn: ConnHandle,
        opcode: i32,
        body: &[u8],
    ) -> Result<Packet, MulticastError> {
        self.config.transport.check_body_len(body.len())?;
        let (peer, security, request) = self
            .acquire(|st| {
                let c = st
                    .conns
                    .get(conn)
                    .ok_or(MulticastError::NoSuchConnection(conn))?;
                if c.role() != Role::Client {
                    return Err(MulticastError::NotClientConnection(conn));
                }
                if c.state.is_hard_error() {
                    return Err(MulticastError::HardError(conn.to_string()));
                }
                if !c.state.is_idle() {
                    return Ok(Acquire::Wait(st.waiters.enqueue(WaitKey::Connection(conn))));
                }
                let header = c.request_header(self.config.protocol_version(), opcode);
                let mut request = Packet::new(&header, body);
                crypto::apply(&mut request, &c.security);
                let ready = (c.peer_addr, c.security, request);
                if let Some(c) = st.conns.get_mut(conn) {
                    c.state = c.state.busy();
                }
                Ok(Acquire::Ready(ready))
            })
            .await?;

        let outcome = self.sender.send_reliably(peer, conn, request).await;

        let mut st = self.state.lock();
        match outcome {
            SendOutcome::Arrived(mut reply) => {
                if reply.has_flag(flags::ENCRYPTED) {
                    crypto::strip(&mut reply, &security);
                }
                if let Some(c) = st.conns.get_mut(conn) {
                    c.advance_seq();
                }
                st.release_conn(conn);
                Ok(reply)
            }
            SendOutcome::Naked => {
                st.set_conn_error(conn);
                Err(MulticastError::Naked)
            }
            SendOutcome::Timeout => {
                st.set_conn_error(conn);
                Err(MulticastError::Dead)
            }
        }
    }
}

/// Live client group for `group`, or the matching error.
fn client_group(st: &MulticastState, group: GroupHandle) -> Result<GroupSlot, MulticastError> {
    let slot = st
        .groups
        .lookup(None, group, Role::Client)
        .ok_or(MulticastError::NoSuchGroup(group))?;
    if st.groups.get(slot).is_hard_error() {
        return Err(MulticastError::HardError(group.to_string()));
    }
    Ok(slot)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use futures_util::poll;
    use mrpc_transport::ConnectionParams;

    use super::*;
    use crate::endpoint::mock::MockSender;
    use crate::{EndpointConfig, SideEffect, SideEffectError, SideEffectRegistry};

    fn endpoint() -> Endpoint<MockSender> {
        Endpoint::new(MockSender::new(), EndpointConfig::new())
    }

    fn open(ep: &Endpoint<MockSender>) -> ConnHandle {
        ep.open_connection(ConnectionParams::new(Role::Client, None).peer_handle(0x40))
            .unwrap()
    }

    async fn group_with(ep: &Endpoint<MockSender>, n: usize) -> (GroupHandle, Vec<ConnHandle>) {
        let group = ep
            .create_group(GroupSpec::new(McastHost::Dummy, 0))
            .await
            .unwrap();
        let mut conns = Vec::new();
        for _ in 0..n {
            let conn = open(ep);
            ep.add_member(group, conn).await.unwrap();
            conns.push(conn);
        }
        (group, conns)
    }

    fn refusal(code: i32) -> SendOutcome {
        let header = PacketHeader {
            opcode: opcode::REPLY,
            ..PacketHeader::default()
        };
        SendOutcome::Arrived(MockSender::reply_to(&Packet::new(&header, b""), code))
    }

    #[tokio::test]
    async fn create_group_records_parameters() {
        let ep = endpoint();
        let spec = GroupSpec::new(McastHost::ByAddr(Ipv4Addr::new(239, 1, 2, 3).into()), 2432)
            .subsys_id(9);
        let group = ep.create_group(spec).await.unwrap();

        let record = ep.group(group).unwrap();
        assert_eq!(record.subsys_id(), 9);
        assert_eq!(record.next_seq(), 0);
        assert_eq!(record.mcast_addr(), Some("239.1.2.3:2432".parse().unwrap()));
        assert!(record.members().is_empty());
        assert_eq!(ep.groups_in_use(), 1);
    }

    #[tokio::test]
    async fn create_group_rejects_ambiguous_encryption() {
        let ep = endpoint();
        let spec = GroupSpec::new(McastHost::Dummy, 0).security(
            SecurityLevel::Secure,
            SessionKey([1; 32]),
            EncryptionType::KNOWN,
        );
        assert!(matches!(
            ep.create_group(spec).await,
            Err(MulticastError::InvalidSecurityParameters { .. })
        ));
        assert_eq!(ep.groups_in_use(), 0);
    }

    #[tokio::test]
    async fn create_group_rejects_unknown_side_effect() {
        let ep = endpoint();
        let spec = GroupSpec::new(McastHost::Dummy, 0).side_effect(3);
        assert!(matches!(
            ep.create_group(spec).await,
            Err(MulticastError::UnknownSideEffect(3))
        ));
        assert_eq!(ep.groups_in_use(), 0);
        assert!(ep.verify_links().is_ok());
    }

    #[tokio::test]
    async fn add_member_sends_init_multicast() {
        let ep = endpoint();
        let (group, conns) = group_with(&ep, 1).await;
        let conn = conns[0];

        let sent = ep.sender().sent();
        assert_eq!(sent.len(), 1);
        let (target, request) = &sent[0];
        assert_eq!(*target, conn);
        assert_eq!(request.opcode(), opcode::INIT_MULTICAST);
        assert_eq!(request.remote_handle(), 0x40);
        let body = InitMulticastBody::decode(request.body()).unwrap();
        assert_eq!(body.group, group);
        assert_eq!(body.initial_seq, 0);

        assert_eq!(ep.group(group).unwrap().members(), &[conn]);
        let c = ep.connection(conn).unwrap();
        assert_eq!(c.next_seq, 1);
        assert!(c.state.is_idle());
        assert!(ep.verify_links().is_ok());
    }

    #[tokio::test]
    async fn duplicate_member_sends_nothing() {
        let ep = endpoint();
        let (group, conns) = group_with(&ep, 1).await;
        assert!(matches!(
            ep.add_member(group, conns[0]).await,
            Err(MulticastError::DuplicateMember { .. })
        ));
        assert_eq!(ep.sender().sent().len(), 1);
        assert_eq!(ep.group(group).unwrap().members().len(), 1);
    }

    #[tokio::test]
    async fn member_of_other_group_is_incompatible() {
        let ep = endpoint();
        let (_, conns) = group_with(&ep, 1).await;
        let (other, _) = group_with(&ep, 0).await;
        assert!(matches!(
            ep.add_member(other, conns[0]).await,
            Err(MulticastError::IncompatibleGroup { .. })
        ));
    }

    #[tokio::test]
    async fn subsystem_mismatch_is_incompatible() {
        let ep = endpoint();
        let group = ep
            .create_group(GroupSpec::new(McastHost::Dummy, 0).subsys_id(1))
            .await
            .unwrap();
        let conn = open(&ep);
        assert!(matches!(
            ep.add_member(group, conn).await,
            Err(MulticastError::IncompatibleGroup { .. })
        ));
        assert!(ep.sender().sent().is_empty());
    }

    #[tokio::test]
    async fn naked_handshake_breaks_connection_only() {
        let ep = endpoint();
        let (group, _) = group_with(&ep, 0).await;
        let conn = open(&ep);
        ep.sender().script(conn, SendOutcome::Naked);

        assert!(matches!(
            ep.add_member(group, conn).await,
            Err(MulticastError::Naked)
        ));
        assert!(ep.connection(conn).unwrap().state.is_hard_error());
        let record = ep.group(group).unwrap();
        assert!(record.is_idle());
        assert!(record.members().is_empty());
    }

    #[tokio::test]
    async fn server_refusal_is_reported() {
        let ep = endpoint();
        let (group, _) = group_with(&ep, 0).await;
        let conn = open(&ep);
        ep.sender().script(conn, refusal(codes::BAD_MGROUP));

        match ep.add_member(group, conn).await {
            Err(MulticastError::Rejected { code }) => assert_eq!(code, codes::BAD_MGROUP),
            other => panic!("unexpected {other:?}"),
        }
        let c = ep.connection(conn).unwrap();
        assert!(c.state.is_idle());
        assert!(c.mgrp.is_none());
    }

    struct Veto;

    impl SideEffect for Veto {
        fn on_add_member(
            &self,
            _group: GroupHandle,
            _conn: ConnHandle,
            _request: &mut Packet,
        ) -> Result<(), SideEffectError> {
            Err(SideEffectError::Soft(-1200))
        }
    }

    #[tokio::test]
    async fn soft_add_member_hook_failure_leaves_connection_usable() {
        let mut registry = SideEffectRegistry::new();
        registry.register(2, Arc::new(Veto));
        let ep = Endpoint::with_side_effects(MockSender::new(), registry, EndpointConfig::new());
        let group = ep
            .create_group(GroupSpec::new(McastHost::Dummy, 0).side_effect(2))
            .await
            .unwrap();
        let conn = ep
            .open_connection(ConnectionParams::new(Role::Client, None).side_effect(2))
            .unwrap();

        assert!(matches!(
            ep.add_member(group, conn).await,
            Err(MulticastError::SideEffectFailure { soft: true, code: -1200 })
        ));
        assert!(ep.connection(conn).unwrap().state.is_idle());
        assert!(ep.group(group).unwrap().is_idle());
        assert!(ep.sender().sent().is_empty());
    }

    /// Fails whichever hooks are given a code; counts delete calls.
    #[derive(Default)]
    struct Failing {
        create: Option<SideEffectError>,
        add: Option<SideEffectError>,
        delete: Option<SideEffectError>,
        deletes: AtomicUsize,
    }

    impl SideEffect for Failing {
        fn on_create_group(&self, _group: GroupHandle) -> Result<(), SideEffectError> {
            self.create.map_or(Ok(()), Err)
        }

        fn on_add_member(
            &self,
            _group: GroupHandle,
            _conn: ConnHandle,
            _request: &mut Packet,
        ) -> Result<(), SideEffectError> {
            self.add.map_or(Ok(()), Err)
        }

        fn on_delete_group(
            &self,
            _group: GroupHandle,
            _client_addr: Option<SocketAddr>,
            _role: Role,
        ) -> Result<(), SideEffectError> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            self.delete.map_or(Ok(()), Err)
        }
    }

    fn with_hooks(hooks: Arc<Failing>) -> Endpoint<MockSender> {
        let mut registry = SideEffectRegistry::new();
        registry.register(2, hooks);
        Endpoint::with_side_effects(MockSender::new(), registry, EndpointConfig::new())
    }

    #[tokio::test]
    async fn failed_create_hook_frees_record() {
        for (code, soft) in [(-1200, true), (-2500, false)] {
            let ep = with_hooks(Arc::new(Failing {
                create: Some(SideEffectError::from_code(code)),
                ..Failing::default()
            }));
            let result = ep
                .create_group(GroupSpec::new(McastHost::Dummy, 0).side_effect(2))
                .await;
            match result {
                Err(MulticastError::SideEffectFailure { soft: s, code: c }) => {
                    assert_eq!((s, c), (soft, code));
                }
                other => panic!("unexpected {other:?}"),
            }
            assert_eq!(ep.groups_in_use(), 0);
            assert!(ep.verify_links().is_ok());
        }
    }

    #[tokio::test]
    async fn hard_add_member_hook_failure_breaks_connection() {
        let ep = with_hooks(Arc::new(Failing {
            add: Some(SideEffectError::Hard(-2100)),
            ..Failing::default()
        }));
        let group = ep
            .create_group(GroupSpec::new(McastHost::Dummy, 0).side_effect(2))
            .await
            .unwrap();
        let conn = ep
            .open_connection(ConnectionParams::new(Role::Client, None).side_effect(2))
            .unwrap();

        assert!(matches!(
            ep.add_member(group, conn).await,
            Err(MulticastError::SideEffectFailure { soft: false, code: -2100 })
        ));
        let c = ep.connection(conn).unwrap();
        assert!(c.state.is_hard_error());
        assert!(c.mgrp.is_none());
        let record = ep.group(group).unwrap();
        assert!(record.is_idle());
        assert!(record.members().is_empty());
        assert!(ep.sender().sent().is_empty());
    }

    #[tokio::test]
    async fn failed_delete_hook_still_deletes() {
        let hooks = Arc::new(Failing {
            delete: Some(SideEffectError::Hard(-2300)),
            ..Failing::default()
        });
        let ep = with_hooks(hooks.clone());
        let group = ep
            .create_group(GroupSpec::new(McastHost::Dummy, 0).side_effect(2))
            .await
            .unwrap();
        let conn = ep
            .open_connection(ConnectionParams::new(Role::Client, None).side_effect(2))
            .unwrap();
        ep.add_member(group, conn).await.unwrap();

        ep.delete_group(group).await.unwrap();
        assert_eq!(hooks.deletes.load(Ordering::SeqCst), 1);
        assert!(ep.group(group).is_none());
        assert_eq!(ep.groups_in_use(), 0);
        assert!(ep.connection(conn).unwrap().mgrp.is_none());
        assert!(ep.verify_links().is_ok());
    }

    #[tokio::test]
    async fn prepare_send_expands_member_list() {
        let ep = endpoint();
        let (group, conns) = group_with(&ep, 3).await;

        let mut list = vec![ConnHandle::NONE; 3];
        let send = ep.prepare_send(group, true, &mut list).await.unwrap();
        assert_eq!(list, conns);
        assert_eq!(send.group(), group);
        drop(send);

        let mut short = vec![ConnHandle::NONE; 2];
        assert!(matches!(
            ep.prepare_send(group, true, &mut short).await,
            Err(MulticastError::IncompatibleGroup { .. })
        ));
    }

    #[tokio::test]
    async fn prepare_send_checks_explicit_list() {
        let ep = endpoint();
        let (group, conns) = group_with(&ep, 2).await;
        let outsider = open(&ep);

        let mut list = vec![conns[1], ConnHandle::NONE, conns[0]];
        let send = ep.prepare_send(group, false, &mut list).await.unwrap();
        send.complete(&list);
        assert_eq!(ep.group(group).unwrap().next_seq(), 1);

        let mut bad = vec![conns[0], outsider];
        assert!(matches!(
            ep.prepare_send(group, false, &mut bad).await,
            Err(MulticastError::IncompatibleGroup { .. })
        ));
        let mut partial = vec![conns[0]];
        assert!(matches!(
            ep.prepare_send(group, false, &mut partial).await,
            Err(MulticastError::IncompatibleGroup { .. })
        ));
    }

    #[tokio::test]
    async fn repeated_recipient_is_rejected() {
        let ep = endpoint();
        let (group, conns) = group_with(&ep, 2).await;

        let mut twice = vec![conns[0], conns[0]];
        assert!(matches!(
            ep.prepare_send(group, false, &mut twice).await,
            Err(MulticastError::IncompatibleGroup { .. })
        ));
        assert!(ep.group(group).unwrap().is_idle());

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            ep.multicast(group, 7, b"x", false, &mut twice),
        )
        .await
        .expect("multicast returns instead of waiting on its own lock");
        assert!(matches!(
            result,
            Err(MulticastError::IncompatibleGroup { .. })
        ));
        assert!(ep.connection(conns[0]).unwrap().state.is_idle());
        assert_eq!(ep.group(group).unwrap().next_seq(), 0);
    }

    #[tokio::test]
    async fn empty_group_cannot_send() {
        let ep = endpoint();
        let (group, _) = group_with(&ep, 0).await;
        assert!(matches!(
            ep.prepare_send(group, true, &mut []).await,
            Err(MulticastError::IncompatibleGroup { .. })
        ));
    }

    #[tokio::test]
    async fn dropped_guard_releases_without_advancing() {
        let ep = endpoint();
        let (group, conns) = group_with(&ep, 1).await;
        let mut list = conns.clone();
        let send = ep.prepare_send(group, false, &mut list).await.unwrap();
        assert!(!ep.group(group).unwrap().is_idle());
        drop(send);
        let record = ep.group(group).unwrap();
        assert!(record.is_idle());
        assert_eq!(record.next_seq(), 0);
    }

    #[tokio::test]
    async fn remove_member_ignores_busy_group() {
        let ep = endpoint();
        let (group, conns) = group_with(&ep, 2).await;
        let mut list = conns.clone();
        let send = ep.prepare_send(group, false, &mut list).await.unwrap();

        ep.remove_member(group, conns[0]).await.unwrap();
        assert_eq!(ep.group(group).unwrap().members(), &[conns[1]]);
        assert!(ep.connection(conns[0]).unwrap().mgrp.is_none());
        drop(send);

        assert!(matches!(
            ep.remove_member(group, conns[0]).await,
            Err(MulticastError::NotGroupMember { .. })
        ));
    }

    #[tokio::test]
    async fn delete_waits_for_send_to_finish() {
        let ep = endpoint();
        let (group, conns) = group_with(&ep, 1).await;
        let mut list = conns.clone();
        let send = ep.prepare_send(group, false, &mut list).await.unwrap();

        let delete = ep.delete_group(group);
        tokio::pin!(delete);
        assert!(poll!(&mut delete).is_pending());

        drop(send);
        delete.await.unwrap();
        assert!(ep.group(group).is_none());
        assert!(ep.connection(conns[0]).unwrap().mgrp.is_none());
        assert_eq!(ep.groups_in_use(), 0);
    }

    #[tokio::test]
    async fn multicast_advances_group_and_members() {
        let ep = endpoint();
        let (group, conns) = group_with(&ep, 3).await;
        ep.sender().script(conns[1], SendOutcome::Timeout);

        let mut list = vec![ConnHandle::NONE; 3];
        let outcomes = ep.multicast(group, 21, b"go", true, &mut list).await.unwrap();

        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].conn, conns[0]);
        assert!(outcomes[0].result.is_ok());
        assert!(matches!(outcomes[1].result, Err(MulticastError::Dead)));
        assert!(outcomes[2].result.is_ok());

        let record = ep.group(group).unwrap();
        assert_eq!(record.next_seq(), 1);
        assert!(record.is_idle());
        assert!(record.current_packet().is_none());
        assert_eq!(ep.connection(conns[0]).unwrap().next_seq, 2);
        assert!(ep.connection(conns[1]).unwrap().state.is_hard_error());

        let group_packets: Vec<_> = ep
            .sender()
            .sent()
            .into_iter()
            .filter(|(_, p)| p.has_flag(flags::MULTICAST))
            .collect();
        assert_eq!(group_packets.len(), 3);
        for (_, packet) in &group_packets {
            assert_eq!(packet.remote_handle(), group.0);
            assert_eq!(packet.local_handle(), 0);
            assert_eq!(packet.seq_number(), 0);
            assert_eq!(packet.body(), b"go");
        }
    }

    #[tokio::test]
    async fn broken_member_is_reported_not_sent() {
        let ep = endpoint();
        let (group, conns) = group_with(&ep, 2).await;
        ep.set_connection_error(conns[0]).unwrap();

        let mut list = vec![ConnHandle::NONE; 2];
        let outcomes = ep.multicast(group, 21, b"", true, &mut list).await.unwrap();
        assert!(matches!(outcomes[0].result, Err(MulticastError::HardError(_))));
        assert!(outcomes[1].result.is_ok());
        let multicasts = ep
            .sender()
            .sent()
            .into_iter()
            .filter(|(_, p)| p.has_flag(flags::MULTICAST))
            .count();
        assert_eq!(multicasts, 1);
    }

    #[tokio::test]
    async fn call_advances_sequence() {
        let ep = endpoint();
        let conn = open(&ep);
        let reply = ep.call(conn, 5, b"x").await.unwrap();
        assert_eq!(reply.return_code(), codes::SUCCESS);
        assert_eq!(ep.connection(conn).unwrap().next_seq, 1);

        ep.sender().script(conn, SendOutcome::Naked);
        assert!(matches!(ep.call(conn, 5, b"x").await, Err(MulticastError::Naked)));
        assert!(matches!(
            ep.call(conn, 5, b"x").await,
            Err(MulticastError::HardError(_))
        ));
    }

    #[tokio::test]
    async fn destroyed_member_leaves_group() {
        let ep = endpoint();
        let (group, conns) = group_with(&ep, 2).await;
        ep.destroy_connection(conns[0]).unwrap();
        assert_eq!(ep.group(group).unwrap().members(), &[conns[1]]);
        assert!(ep.connection(conns[0]).is_none());
        assert!(ep.verify_links().is_ok());
    }
}
