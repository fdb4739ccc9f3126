use std::net::SocketAddr;
use std::sync::Arc;

use mrpc_transport::{ConnHandle, ConnectionTable, GroupHandle, GroupSlot, Role};

use super::{GroupKind, GroupRecord};
use crate::MulticastStats;

/// Number of address buckets. Must be a power of two.
pub const BUCKET_COUNT: usize = 256;

/// Bucket for a peer address: the low byte of the IP, or bucket 0 when
/// the address is unknown (groups owned by this client).
pub fn bucket_of(addr: Option<SocketAddr>) -> usize {
    let low = match addr {
        None => return 0,
        Some(SocketAddr::V4(a)) => a.ip().octets()[3],
        Some(SocketAddr::V6(a)) => a.ip().octets()[15],
    };
    low as usize & (BUCKET_COUNT - 1)
}

/// Arena of group records with a free list and an address bucket index.
///
/// Slots are never shrunk; a freed slot goes on the free list and is the
/// first to be handed out again.
#[derive(Debug)]
pub struct GroupTable {
    slots: Vec<GroupRecord>,
    free: Vec<GroupSlot>,
    buckets: Vec<Vec<GroupSlot>>,
    last_handle: u32,
    stats: Arc<MulticastStats>,
}

impl Default for GroupTable {
    fn default() -> Self {
        Self::new(Arc::new(MulticastStats::default()))
    }
}

impl GroupTable {
    pub fn new(stats: Arc<MulticastStats>) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            buckets: vec![Vec::new(); BUCKET_COUNT],
            last_handle: 0,
            stats,
        }
    }

    /// Take a record off the free list (growing the pool if needed),
    /// give it `kind` and index it under (`client_addr`, handle).
    ///
    /// `handle` is `None` for groups this endpoint creates, which get the
    /// next handle from a counter; servers pass the client's handle.
    pub fn allocate(
        &mut self,
        client_addr: Option<SocketAddr>,
        handle: Option<GroupHandle>,
        kind: GroupKind,
    ) -> GroupSlot {
        debug_assert!(kind != GroupKind::Free, "allocating a free record");

        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(GroupRecord::free());
                self.stats.pool_growth.inc();
                GroupSlot(self.slots.len() - 1)
            }
        };

        let handle = handle.unwrap_or_else(|| {
            self.last_handle = self.last_handle.wrapping_add(1).max(1);
            GroupHandle(self.last_handle)
        });

        self.slots[slot.0] = GroupRecord {
            handle,
            client_addr,
            kind,
            ..GroupRecord::free()
        };
        self.buckets[bucket_of(client_addr)].push(slot);

        self.stats.groups_allocated.inc();
        self.stats.groups_in_use.inc();
        tracing::debug!("allocated {handle} in {slot:?}");
        slot
    }

    /// Find the live record for (`client_addr`, `handle`) in `role`.
    pub fn lookup(
        &self,
        client_addr: Option<SocketAddr>,
        handle: GroupHandle,
        role: Role,
    ) -> Option<GroupSlot> {
        self.buckets[bucket_of(client_addr)]
            .iter()
            .copied()
            .find(|slot| {
                let record = &self.slots[slot.0];
                record.handle == handle
                    && record.client_addr == client_addr
                    && record.role() == Some(role)
            })
    }

    /// # Panics
    /// If `slot` was never allocated.
    pub fn get(&self, slot: GroupSlot) -> &GroupRecord {
        &self.slots[slot.0]
    }

    pub(crate) fn get_mut(&mut self, slot: GroupSlot) -> &mut GroupRecord {
        &mut self.slots[slot.0]
    }

    /// Return a record to the free list, clearing every member's
    /// back-reference first.
    ///
    /// # Panics
    /// If the record is already free, or a member does not point back at
    /// it: either means the tables are corrupt.
    pub fn free(&mut self, slot: GroupSlot, conns: &mut ConnectionTable) {
        let record = &mut self.slots[slot.0];
        let members = match std::mem::replace(&mut record.kind, GroupKind::Free) {
            GroupKind::Free => panic!("double free of group record {slot:?}"),
            GroupKind::Client { members, .. } => members,
            GroupKind::Server { conn, .. } => vec![conn],
        };
        for handle in members {
            unlink_member(conns, handle, slot);
        }

        let handle = record.handle;
        let bucket = bucket_of(record.client_addr);
        record.client_addr = None;
        record.mcast_addr = None;
        record.current_packet = None;
        record.side_effect = 0;

        self.buckets[bucket].retain(|s| *s != slot);
        self.free.push(slot);

        self.stats.groups_freed.inc();
        self.stats.groups_in_use.dec();
        tracing::debug!("freed {handle} from {slot:?}");
    }

    /// Records currently allocated.
    pub fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Size of the record pool, free slots included.
    pub fn pool_size(&self) -> usize {
        self.slots.len()
    }

    pub fn bucket_len(&self, bucket: usize) -> usize {
        self.buckets[bucket].len()
    }

    /// Check the cross-links between groups, buckets and connections.
    pub fn verify_links(&self, conns: &ConnectionTable) -> Result<(), String> {
        for (i, record) in self.slots.iter().enumerate() {
            let slot = GroupSlot(i);
            let on_free_list = self.free.contains(&slot);
            let chains: Vec<usize> = (0..BUCKET_COUNT)
                .filter(|b| self.buckets[*b].contains(&slot))
                .collect();

            if record.is_free() {
                if !on_free_list || !chains.is_empty() {
                    return Err(format!("free {slot:?} is indexed or off the free list"));
                }
                continue;
            }
            if on_free_list {
                return Err(format!("live {slot:?} is on the free list"));
            }
            if chains != [bucket_of(record.client_addr)] {
                return Err(format!("{slot:?} is in buckets {chains:?}"));
            }

            let members: &[ConnHandle] = match &record.kind {
                GroupKind::Client { members, .. } => members,
                GroupKind::Server { conn, .. } => std::slice::from_ref(conn),
                GroupKind::Free => &[],
            };
            for handle in members {
                match conns.get(*handle) {
                    Some(conn) if conn.mgrp == Some(slot) => {}
                    Some(conn) => {
                        return Err(format!(
                            "{handle} in {slot:?} points at {:?}",
                            conn.mgrp
                        ))
                    }
                    None => return Err(format!("{slot:?} lists missing {handle}")),
                }
            }
        }

        for conn in conns.iter() {
            if let Some(slot) = conn.mgrp {
                let linked = self
                    .slots
                    .get(slot.0)
                    .is_some_and(|record| record.has_member(conn.handle));
                if !linked {
                    return Err(format!("{} points at {slot:?} which lacks it", conn.handle));
                }
            }
        }
        Ok(())
    }
}

fn unlink_member(conns: &mut ConnectionTable, handle: ConnHandle, slot: GroupSlot) {
    let Some(conn) = conns.get_mut(handle) else {
        panic!("{slot:?} lists {handle}, which does not exist");
    };
    assert_eq!(
        conn.mgrp,
        Some(slot),
        "{handle} does not point back at {slot:?}"
    );
    conn.mgrp = None;
}
