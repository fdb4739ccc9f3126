//! mrpc multicast groups.
//!
//! Lets a client send one request to a set of connections and collect
//! one reply per member. The client keeps a group record with a fan-out
//! list; each server keeps a record bound to the single connection that
//! joined it. Group packets carry the group handle and group sequence
//! number and are translated on arrival into ordinary requests on the
//! bound connection.
//!
//! Security: group session key, XOR or ChaCha20 (HKDF-SHA256 derived).
//! Concurrency: one mutex per endpoint, never held across an await;
//! busy groups and connections are waited on through oneshot queues.

pub mod crypto;
pub mod endpoint;
pub mod error;
pub mod group;
pub mod side_effect;
pub mod stats;

mod handshake;
mod receive;
mod state;
mod translate;
mod waiters;

pub use endpoint::{
    Endpoint, EndpointConfig, GroupSpec, McastHost, MemberOutcome, ReliableSender, SendGuard,
    SendOutcome, DEFAULT_FANOUT_INCREMENT,
};
pub use error::MulticastError;
pub use group::{bucket_of, GroupKind, GroupRecord, GroupTable, BUCKET_COUNT};
pub use receive::{Inbound, Request};
pub use side_effect::{SideEffect, SideEffectError, SideEffectRegistry};
pub use stats::MulticastStats;
pub use translate::DropReason;
