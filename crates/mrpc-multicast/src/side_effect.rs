//! Side-effect plugins.
//!
//! A side effect is a protocol extension bound to a group or connection
//! by an integer type tag. The multicast layer calls it at four points of
//! a group's life; every hook defaults to a no-op.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use mrpc_transport::{codes, ConnHandle, GroupHandle, Packet, Role, SideEffectType};

use crate::MulticastError;

/// Classified hook failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffectError {
    /// The operation fails but both objects stay usable.
    Soft(i32),
    /// The connection involved is put in hard error.
    Hard(i32),
}

impl SideEffectError {
    /// Classify a raw return code: anything above the fatal limit is soft.
    pub fn from_code(code: i32) -> Self {
        if code > codes::FATAL_LIMIT {
            SideEffectError::Soft(code)
        } else {
            SideEffectError::Hard(code)
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            SideEffectError::Soft(code) | SideEffectError::Hard(code) => *code,
        }
    }

    pub fn is_soft(&self) -> bool {
        matches!(self, SideEffectError::Soft(_))
    }
}

impl From<SideEffectError> for MulticastError {
    fn from(e: SideEffectError) -> Self {
        MulticastError::SideEffectFailure {
            soft: e.is_soft(),
            code: e.code(),
        }
    }
}

/// Hooks invoked by the multicast layer.
pub trait SideEffect: Send + Sync {
    /// A client group was created.
    fn on_create_group(&self, _group: GroupHandle) -> Result<(), SideEffectError> {
        Ok(())
    }

    /// The `InitMulticast` request for `conn` is about to be sent. The hook
    /// may rewrite the packet or replace it outright.
    fn on_add_member(
        &self,
        _group: GroupHandle,
        _conn: ConnHandle,
        _request: &mut Packet,
    ) -> Result<(), SideEffectError> {
        Ok(())
    }

    /// A server group was bound to `conn`. Failure unbinds it again and
    /// the code goes back to the client.
    fn on_init_multicast(
        &self,
        _group: GroupHandle,
        _conn: ConnHandle,
        _request: &Packet,
    ) -> Result<(), SideEffectError> {
        Ok(())
    }

    /// A group is being deleted. The result is only logged.
    fn on_delete_group(
        &self,
        _group: GroupHandle,
        _client_addr: Option<SocketAddr>,
        _role: Role,
    ) -> Result<(), SideEffectError> {
        Ok(())
    }
}

/// Side effects known to an endpoint, by type tag. Tag 0 means none.
#[derive(Default, Clone)]
pub struct SideEffectRegistry {
    entries: HashMap<SideEffectType, Arc<dyn SideEffect>>,
}

impl SideEffectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `hooks` under `tag`, replacing any earlier entry.
    ///
    /// # Panics
    /// If `tag` is 0.
    pub fn register(&mut self, tag: SideEffectType, hooks: Arc<dyn SideEffect>) {
        assert_ne!(tag, 0, "side-effect type 0 is reserved for \"none\"");
        self.entries.insert(tag, hooks);
    }

    /// Resolve a tag. `Ok(None)` for 0, an error for unregistered tags.
    pub fn lookup(
        &self,
        tag: SideEffectType,
    ) -> Result<Option<&Arc<dyn SideEffect>>, MulticastError> {
        if tag == 0 {
            return Ok(None);
        }
        self.entries
            .get(&tag)
            .map(Some)
            .ok_or(MulticastError::UnknownSideEffect(tag))
    }

    /// Hooks for a tag already validated at bind time. An unregistered
    /// tag here behaves like no side effect.
    pub(crate) fn hooks(&self, tag: SideEffectType) -> Option<&Arc<dyn SideEffect>> {
        self.entries.get(&tag)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for SideEffectRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<_> = self.entries.keys().collect();
        tags.sort();
        f.debug_struct("SideEffectRegistry")
            .field("tags", &tags)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;
    impl SideEffect for Noop {}

    #[test]
    fn classify_codes() {
        assert_eq!(SideEffectError::from_code(-1), SideEffectError::Soft(-1));
        assert_eq!(
            SideEffectError::from_code(-1999),
            SideEffectError::Soft(-1999)
        );
        assert_eq!(
            SideEffectError::from_code(codes::FATAL_LIMIT),
            SideEffectError::Hard(codes::FATAL_LIMIT)
        );
        assert_eq!(
            SideEffectError::from_code(-3000),
            SideEffectError::Hard(-3000)
        );
    }

    #[test]
    fn converts_to_multicast_error() {
        let err: MulticastError = SideEffectError::Hard(-2500).into();
        assert!(matches!(
            err,
            MulticastError::SideEffectFailure {
                soft: false,
                code: -2500
            }
        ));
        assert_eq!(err.code(), codes::SE_FAIL_HARD);
    }

    #[test]
    fn lookup_by_tag() {
        let mut registry = SideEffectRegistry::new();
        registry.register(4, Arc::new(Noop));

        assert!(registry.lookup(0).unwrap().is_none());
        assert!(registry.lookup(4).unwrap().is_some());
        assert!(matches!(
            registry.lookup(5),
            Err(MulticastError::UnknownSideEffect(5))
        ));
    }

    #[test]
    fn default_hooks_succeed() {
        let hooks = Noop;
        let mut packet = Packet::new(&Default::default(), b"");
        assert!(hooks.on_create_group(GroupHandle(1)).is_ok());
        assert!(hooks
            .on_add_member(GroupHandle(1), ConnHandle(2), &mut packet)
            .is_ok());
        assert!(hooks
            .on_delete_group(GroupHandle(1), None, Role::Client)
            .is_ok());
    }

    #[test]
    #[should_panic(expected = "reserved")]
    fn tag_zero_is_reserved() {
        SideEffectRegistry::new().register(0, Arc::new(Noop));
    }
}
